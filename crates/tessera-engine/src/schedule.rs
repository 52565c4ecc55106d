//! Dependency-graph scheduling.
//!
//! Systems are added by name together with the names of systems that must
//! run before them. A dependency must already have been added, so a forward
//! reference (and with it any cycle) cannot be expressed.
//!
//! [`ScheduleBuilder::build`] partitions the graph into stages by peeling off
//! sinks: systems nothing else still waits on form the last stage, the
//! systems only they depended on form the one before, and so on. The stages
//! are then reversed into execution order. Every system lands in the latest
//! stage its dependents allow, strictly after each of its dependencies.
//!
//! No order is guaranteed among the systems of one stage; they are expected
//! to be independent of each other.

use std::collections::HashMap;

use tessera_ecs::query::Access;
use tessera_ecs::store::Store;
use tessera_ecs::EcsError;
use tracing::debug;

use crate::system::{Erased, RunSystem, System};
use crate::EngineError;

// ---------------------------------------------------------------------------
// ScheduleBuilder
// ---------------------------------------------------------------------------

struct Node {
    name: String,
    system: Box<dyn RunSystem>,
    /// Indices of the systems this one runs after.
    deps: Vec<usize>,
}

/// Collects named systems and their dependencies.
#[derive(Default)]
pub struct ScheduleBuilder {
    nodes: Vec<Node>,
    by_name: HashMap<String, usize>,
}

impl ScheduleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `system` under `name`, to run after every system in `after`.
    ///
    /// Fails if `name` is taken or any dependency has not been added yet.
    pub fn add_system<S: System>(
        &mut self,
        system: S,
        name: &str,
        after: &[&str],
    ) -> Result<&mut Self, EngineError> {
        if self.by_name.contains_key(name) {
            return Err(EngineError::DuplicateSystem {
                name: name.to_owned(),
            });
        }
        let mut deps = Vec::with_capacity(after.len());
        for dep in after {
            let index = self
                .by_name
                .get(*dep)
                .copied()
                .ok_or_else(|| EngineError::DependencyNotFound {
                    system: name.to_owned(),
                    dependency: (*dep).to_owned(),
                })?;
            if !deps.contains(&index) {
                deps.push(index);
            }
        }
        self.by_name.insert(name.to_owned(), self.nodes.len());
        self.nodes.push(Node {
            name: name.to_owned(),
            system: Box::new(Erased(system)),
            deps,
        });
        Ok(self)
    }

    pub fn system_count(&self) -> usize {
        self.nodes.len()
    }

    /// Partition the systems into stages.
    pub fn build(self) -> Result<Schedule, EngineError> {
        let count = self.nodes.len();

        // Number of not-yet-staged systems waiting on each system.
        let mut waiting = vec![0usize; count];
        for node in &self.nodes {
            for &dep in &node.deps {
                waiting[dep] += 1;
            }
        }

        let mut staged = vec![false; count];
        let mut layers: Vec<Vec<usize>> = Vec::new();
        let mut remaining = count;
        while remaining > 0 {
            let layer: Vec<usize> = (0..count)
                .filter(|&i| !staged[i] && waiting[i] == 0)
                .collect();
            if layer.is_empty() {
                return Err(EngineError::CycleDetected { remaining });
            }
            for &i in &layer {
                staged[i] = true;
                for &dep in &self.nodes[i].deps {
                    waiting[dep] -= 1;
                }
            }
            remaining -= layer.len();
            layers.push(layer);
        }
        layers.reverse();

        let mut slots: Vec<Option<Node>> = self.nodes.into_iter().map(Some).collect();
        let stages: Vec<Stage> = layers
            .into_iter()
            .map(|layer| Stage {
                systems: layer
                    .into_iter()
                    .filter_map(|i| slots[i].take())
                    .map(|node| ScheduledSystem {
                        name: node.name,
                        system: node.system,
                    })
                    .collect(),
            })
            .collect();

        let schedule = Schedule { stages };
        debug!(
            stages = schedule.stages.len(),
            systems = schedule.system_count(),
            layout = ?schedule.stage_names(),
            "schedule built"
        );
        Ok(schedule)
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

pub(crate) struct ScheduledSystem {
    pub(crate) name: String,
    pub(crate) system: Box<dyn RunSystem>,
}

/// Systems that run concurrently, between two merges.
pub struct Stage {
    pub(crate) systems: Vec<ScheduledSystem>,
}

impl Stage {
    pub fn names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}

/// Two systems of one stage that touch the same record type, at least one of
/// them mutably.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessConflict {
    pub stage: usize,
    pub first: String,
    pub second: String,
    pub record: &'static str,
}

/// An immutable, ordered list of stages.
pub struct Schedule {
    stages: Vec<Stage>,
}

impl Schedule {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub(crate) fn stages_mut(&mut self) -> &mut [Stage] {
        &mut self.stages
    }

    /// Stage index of the system called `name`.
    pub fn stage_of(&self, name: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage.systems.iter().any(|s| s.name == name))
    }

    /// System names per stage, in execution order.
    pub fn stage_names(&self) -> Vec<Vec<&str>> {
        self.stages.iter().map(Stage::names).collect()
    }

    pub fn system_count(&self) -> usize {
        self.stages.iter().map(Stage::len).sum()
    }

    /// Resolve every system's query against `store` and report co-staged
    /// pairs with conflicting access.
    ///
    /// Fails if a query names an unregistered type or conflicts with itself.
    pub fn access_conflicts(&self, store: &Store) -> Result<Vec<AccessConflict>, EcsError> {
        let mut conflicts = Vec::new();
        for (index, stage) in self.stages.iter().enumerate() {
            let accesses: Vec<(&str, Vec<Access>)> = stage
                .systems
                .iter()
                .map(|s| s.system.accesses(store).map(|a| (s.name.as_str(), a)))
                .collect::<Result<_, EcsError>>()?;
            for (i, (first, a)) in accesses.iter().enumerate() {
                for (second, b) in &accesses[i + 1..] {
                    if let Some(hit) = a.iter().find(|x| b.iter().any(|y| x.conflicts_with(y))) {
                        conflicts.push(AccessConflict {
                            stage: index,
                            first: (*first).to_owned(),
                            second: (*second).to_owned(),
                            record: hit.name,
                        });
                    }
                }
            }
        }
        Ok(conflicts)
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("stages", &self.stage_names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
