//! Headless demo: a handful of bodies fall, bleed out, and get reaped.
//!
//! Run with: `RUST_LOG=tessera_engine=debug cargo run --example movement`

use anyhow::Result;
use tessera_engine::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, PartialEq)]
struct Velocity {
    dx: f32,
    dy: f32,
}

#[derive(Debug, Clone, PartialEq)]
struct Health(u32);

#[derive(Debug, Clone, PartialEq)]
struct Gravity(f32);

struct ApplyGravity;

impl System for ApplyGravity {
    type Query = (Write<Velocity>, Read<Gravity>);

    fn run(&mut self, (v, g): <Self::Query as Query>::Item<'_>, _world: &WorldHandle<'_>) {
        v.dy += g.0;
    }
}

struct Movement;

impl System for Movement {
    type Query = (Write<Position>, Read<Velocity>);

    fn run(&mut self, (p, v): <Self::Query as Query>::Item<'_>, _world: &WorldHandle<'_>) {
        p.x += v.dx;
        p.y += v.dy;
    }
}

/// Bodies below the floor lose health; at zero they are removed.
struct FloorDamage {
    floor: f32,
}

impl System for FloorDamage {
    type Query = (Read<EntityRecord>, Read<Position>, Write<Health>);

    fn run(&mut self, (record, p, hp): <Self::Query as Query>::Item<'_>, world: &WorldHandle<'_>) {
        if p.y < self.floor {
            hp.0 = hp.0.saturating_sub(25);
            if hp.0 == 0 && world.request_remove_entity(record) {
                info!(entity = %record.id(), "body reaped");
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut builder = StoreBuilder::new();
    builder.register_component::<Position>()?;
    builder.register_component::<Velocity>()?;
    builder.register_component::<Health>()?;
    builder.register_resource(Gravity(-0.5))?;
    let mut store = builder.seal();

    for i in 0..8 {
        store
            .build_entity()
            .with(Position { x: i as f32, y: 10.0 + i as f32 * 2.0 })
            .with(Velocity { dx: 0.25, dy: 0.0 })
            .with(Health(100))
            .finish()?;
    }

    let mut schedule = ScheduleBuilder::new();
    schedule
        .add_system(ApplyGravity, "gravity", &[])?
        .add_system(Movement, "movement", &["gravity"])?
        .add_system(FloorDamage { floor: 0.0 }, "floor_damage", &["movement"])?;
    let schedule = schedule.build()?;
    info!(layout = ?schedule.stage_names(), "schedule");

    let mut dispatcher = Dispatcher::new(store, schedule, DispatcherConfig::default())?;
    while dispatcher.store().entity_count() > 0 && dispatcher.tick_count() < 200 {
        let report = dispatcher.run_tick()?;
        let merged = report.merged();
        if !merged.is_empty() {
            info!(tick = report.tick, ?merged, "structural changes");
        }
    }

    info!(
        ticks = dispatcher.tick_count(),
        remaining = dispatcher.store().entity_count(),
        "simulation finished"
    );
    Ok(())
}
