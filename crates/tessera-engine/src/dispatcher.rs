//! Stage-by-stage execution of a [`Schedule`] over a [`Store`].
//!
//! One tick runs every stage in order. Within a stage, systems run
//! concurrently on a rayon pool; the stage ends when all of them have
//! finished, and the store then merges the mutations they queued. A stage
//! therefore observes every structural edit made by earlier stages and none
//! made by its own.
//!
//! Systems of one stage share the store without synchronization. The
//! schedule is responsible for keeping conflicting systems apart; any
//! co-staged conflicts found at construction are logged as warnings.

use std::time::{Duration, Instant};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tessera_ecs::mutation::MergeReport;
use tessera_ecs::store::Store;
use tessera_ecs::EcsError;
use tracing::{debug, trace, warn};

use crate::config::DispatcherConfig;
use crate::schedule::{Schedule, ScheduledSystem, Stage};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// One system's run within a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemReport {
    pub name: String,
    /// Entities the system was invoked for.
    pub matched: usize,
    pub elapsed: Duration,
}

/// One stage's run within a tick.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub index: usize,
    /// In the stage's system order.
    pub systems: Vec<SystemReport>,
    /// What the merge after this stage applied.
    pub merge: MergeReport,
    /// Systems plus merge.
    pub elapsed: Duration,
}

/// Timing and mutation counts for one tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// 1-based tick number.
    pub tick: u64,
    pub stages: Vec<StageReport>,
    pub elapsed: Duration,
}

impl TickReport {
    /// Merge counts summed over every stage.
    pub fn merged(&self) -> MergeReport {
        let mut total = MergeReport::default();
        for stage in &self.stages {
            total.accumulate(&stage.merge);
        }
        total
    }

    pub fn system(&self, name: &str) -> Option<&SystemReport> {
        self.stages
            .iter()
            .flat_map(|stage| &stage.systems)
            .find(|system| system.name == name)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Owns the store and the schedule, and drives ticks.
pub struct Dispatcher {
    store: Store,
    schedule: Schedule,
    pool: ThreadPool,
    tick_counter: u64,
    last_report: Option<TickReport>,
}

impl Dispatcher {
    /// Build the worker pool and resolve every system's query.
    ///
    /// Fails if the pool cannot be built, or a system's query names an
    /// unregistered type or conflicts with itself.
    pub fn new(
        store: Store,
        schedule: Schedule,
        config: DispatcherConfig,
    ) -> Result<Self, EngineError> {
        for conflict in schedule.access_conflicts(&store)? {
            warn!(
                stage = conflict.stage,
                first = %conflict.first,
                second = %conflict.second,
                record = conflict.record,
                "co-staged systems have conflicting access"
            );
        }

        let prefix = config.thread_name_prefix.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_threads)
            .thread_name(move |index| format!("{prefix}-{index}"))
            .build()?;
        debug!(
            threads = pool.current_num_threads(),
            stages = schedule.stages().len(),
            "dispatcher ready"
        );

        Ok(Self {
            store,
            schedule,
            pool,
            tick_counter: 0,
            last_report: None,
        })
    }

    /// Run every stage once, merging after each.
    ///
    /// A system error (a query that no longer resolves, or a store integrity
    /// fault) aborts the tick; later stages do not run and the tick counter
    /// does not advance.
    pub fn run_tick(&mut self) -> Result<TickReport, EngineError> {
        let tick_start = Instant::now();
        let mut stages = Vec::with_capacity(self.schedule.stages().len());

        for (index, stage) in self.schedule.stages_mut().iter_mut().enumerate() {
            let stage_start = Instant::now();
            let systems = run_stage(&self.pool, &self.store, stage)?;
            let merge = self.store.merge()?;
            trace!(stage = index, ?merge, "stage merged");
            stages.push(StageReport {
                index,
                systems,
                merge,
                elapsed: stage_start.elapsed(),
            });
        }

        self.tick_counter += 1;
        let report = TickReport {
            tick: self.tick_counter,
            stages,
            elapsed: tick_start.elapsed(),
        };
        debug!(
            tick = report.tick,
            entities = self.store.entity_count(),
            elapsed_us = report.elapsed.as_micros() as u64,
            "tick complete"
        );
        self.last_report = Some(report.clone());
        Ok(report)
    }

    /// Run `count` ticks. Returns the merge counts summed over all of them.
    pub fn run_ticks(&mut self, count: u64) -> Result<MergeReport, EngineError> {
        let mut total = MergeReport::default();
        for _ in 0..count {
            total.accumulate(&self.run_tick()?.merged());
        }
        Ok(total)
    }

    // -- accessors ----------------------------------------------------------

    /// Ticks completed so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Direct access between ticks, e.g. for seeding entities.
    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn last_report(&self) -> Option<&TickReport> {
        self.last_report.as_ref()
    }

    pub fn worker_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Give back the store, dropping the schedule and the pool.
    pub fn into_store(self) -> Store {
        self.store
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("schedule", &self.schedule)
            .field("tick_counter", &self.tick_counter)
            .field("entities", &self.store.entity_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stage execution
// ---------------------------------------------------------------------------

fn run_stage(
    pool: &ThreadPool,
    store: &Store,
    stage: &mut Stage,
) -> Result<Vec<SystemReport>, EcsError> {
    if let [only] = stage.systems.as_mut_slice() {
        return Ok(vec![run_system(only, store)?]);
    }

    let (sender, receiver) = crossbeam_channel::unbounded();
    pool.scope(|scope| {
        for (order, system) in stage.systems.iter_mut().enumerate() {
            let sender = sender.clone();
            scope.spawn(move |_| {
                // The receiver outlives the scope.
                let _ = sender.send((order, run_system(system, store)));
            });
        }
    });
    drop(sender);

    let mut results: Vec<_> = receiver.iter().collect();
    results.sort_by_key(|(order, _)| *order);
    results.into_iter().map(|(_, result)| result).collect()
}

fn run_system(system: &mut ScheduledSystem, store: &Store) -> Result<SystemReport, EcsError> {
    let start = Instant::now();
    // Safety: systems of one stage are independent by construction of the
    // schedule, and the store is not mutated until every one has returned.
    let matched = unsafe { system.system.run(store)? };
    trace!(system = %system.name, matched, "system ran");
    Ok(SystemReport {
        name: system.name.clone(),
        matched,
        elapsed: start.elapsed(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter(u64);

    #[derive(Debug, Clone, PartialEq)]
    struct Marker;

    struct Increment;

    impl System for Increment {
        type Query = (Write<Counter>,);

        fn run(&mut self, (c,): <Self::Query as Query>::Item<'_>, _world: &WorldHandle<'_>) {
            c.0 += 1;
        }
    }

    struct CountMarkers;

    impl System for CountMarkers {
        type Query = (Read<Marker>,);

        fn run(&mut self, _item: <Self::Query as Query>::Item<'_>, _world: &WorldHandle<'_>) {}
    }

    /// Spawns one marked entity per counter entity.
    struct SpawnMarkers;

    impl System for SpawnMarkers {
        type Query = (Read<Counter>,);

        fn run(&mut self, _item: <Self::Query as Query>::Item<'_>, world: &WorldHandle<'_>) {
            world.request_new_entity().with(Marker).finish().unwrap();
        }
    }

    fn setup_store(counters: usize) -> Store {
        let mut builder = StoreBuilder::new();
        builder.register_component::<Counter>().unwrap();
        builder.register_component::<Marker>().unwrap();
        let mut store = builder.seal();
        for _ in 0..counters {
            store.build_entity().with(Counter(0)).finish().unwrap();
        }
        store
    }

    fn dispatcher(store: Store, builder: ScheduleBuilder) -> Dispatcher {
        Dispatcher::new(store, builder.build().unwrap(), DispatcherConfig::with_threads(2)).unwrap()
    }

    // -- 1. Construction ------------------------------------------------------

    #[test]
    fn new_dispatcher_starts_at_tick_zero() {
        let d = dispatcher(setup_store(0), ScheduleBuilder::new());
        assert_eq!(d.tick_count(), 0);
        assert!(d.last_report().is_none());
        assert_eq!(d.worker_threads(), 2);
    }

    #[test]
    fn unregistered_query_type_fails_construction() {
        #[derive(Debug)]
        struct Unknown;

        struct UsesUnknown;

        impl System for UsesUnknown {
            type Query = (Read<Unknown>,);

            fn run(&mut self, _item: <Self::Query as Query>::Item<'_>, _world: &WorldHandle<'_>) {}
        }

        let mut builder = ScheduleBuilder::new();
        builder.add_system(UsesUnknown, "uses_unknown", &[]).unwrap();
        let err = Dispatcher::new(
            setup_store(0),
            builder.build().unwrap(),
            DispatcherConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Ecs(EcsError::NotRegistered { .. })));
    }

    // -- 2. Ticks ---------------------------------------------------------------

    #[test]
    fn empty_schedule_still_advances_ticks() {
        let mut d = dispatcher(setup_store(3), ScheduleBuilder::new());
        let report = d.run_tick().unwrap();
        assert_eq!(report.tick, 1);
        assert!(report.stages.is_empty());
        assert_eq!(d.tick_count(), 1);
    }

    #[test]
    fn systems_run_once_per_match_per_tick() {
        let mut builder = ScheduleBuilder::new();
        builder.add_system(Increment, "increment", &[]).unwrap();
        let mut d = dispatcher(setup_store(5), builder);

        d.run_ticks(4).unwrap();
        assert_eq!(d.tick_count(), 4);
        let values: Vec<u64> = d
            .store()
            .query::<(Read<Counter>,)>()
            .unwrap()
            .into_iter()
            .map(|(c,)| c.0)
            .collect();
        assert_eq!(values, vec![4; 5]);

        let report = d.last_report().unwrap();
        assert_eq!(report.system("increment").unwrap().matched, 5);
    }

    #[test]
    fn spawns_become_visible_to_the_next_stage_only() {
        let mut builder = ScheduleBuilder::new();
        builder.add_system(SpawnMarkers, "spawn", &[]).unwrap();
        builder.add_system(CountMarkers, "count_same", &[]).unwrap();
        builder
            .add_system(CountMarkers, "count_after", &["spawn", "count_same"])
            .unwrap();
        let mut d = dispatcher(setup_store(3), builder);

        let report = d.run_tick().unwrap();
        assert_eq!(report.stages.len(), 2);
        assert_eq!(report.system("count_same").unwrap().matched, 0);
        assert_eq!(report.system("count_after").unwrap().matched, 3);
        assert_eq!(report.stages[0].merge.spawned_entities, 3);
        assert_eq!(report.merged().spawned_entities, 3);
        assert_eq!(d.store().entity_count(), 6);
    }

    #[test]
    fn stage_reports_keep_schedule_order() {
        let mut builder = ScheduleBuilder::new();
        builder.add_system(CountMarkers, "a", &[]).unwrap();
        builder.add_system(CountMarkers, "b", &[]).unwrap();
        builder.add_system(CountMarkers, "c", &[]).unwrap();
        let mut d = dispatcher(setup_store(1), builder);

        let report = d.run_tick().unwrap();
        let names: Vec<&str> = report.stages[0]
            .systems
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, d.schedule().stages()[0].names());
    }

    #[test]
    fn store_mut_seeds_between_ticks() {
        let mut builder = ScheduleBuilder::new();
        builder.add_system(Increment, "increment", &[]).unwrap();
        let mut d = dispatcher(setup_store(1), builder);
        d.run_tick().unwrap();
        d.store_mut().build_entity().with(Counter(100)).finish().unwrap();
        let report = d.run_tick().unwrap();
        assert_eq!(report.system("increment").unwrap().matched, 2);
        assert_eq!(d.into_store().entity_count(), 2);
    }
}
