//! Tessera Engine -- dependency-ordered, stage-parallel system execution.
//!
//! This crate builds on [`tessera_ecs`] to drive systems. Systems are added
//! to a [`ScheduleBuilder`](schedule::ScheduleBuilder) by name, each after
//! the systems it depends on. The builder partitions them into stages, and a
//! [`Dispatcher`](dispatcher::Dispatcher) runs each stage's systems
//! concurrently and merges their queued mutations before the next stage.
//!
//! # Quick Start
//!
//! ```
//! use tessera_engine::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! struct Movement;
//!
//! impl System for Movement {
//!     type Query = (Write<Position>, Read<Velocity>);
//!
//!     fn run(&mut self, (p, v): <Self::Query as Query>::Item<'_>, _world: &WorldHandle<'_>) {
//!         p.x += v.dx;
//!         p.y += v.dy;
//!     }
//! }
//!
//! let mut builder = StoreBuilder::new();
//! builder.register_component::<Position>().unwrap();
//! builder.register_component::<Velocity>().unwrap();
//! let mut store = builder.seal();
//! let e = store
//!     .build_entity()
//!     .with(Position { x: 0.0, y: 0.0 })
//!     .with(Velocity { dx: 1.0, dy: 0.5 })
//!     .finish()
//!     .unwrap();
//!
//! let mut schedule = ScheduleBuilder::new();
//! schedule.add_system(Movement, "movement", &[]).unwrap();
//!
//! let mut dispatcher =
//!     Dispatcher::new(store, schedule.build().unwrap(), DispatcherConfig::default()).unwrap();
//! dispatcher.run_ticks(2).unwrap();
//!
//! assert_eq!(
//!     dispatcher.store().get::<Position>(e),
//!     Some(&Position { x: 2.0, y: 1.0 })
//! );
//! ```

#![deny(unsafe_code)]

pub mod config;
#[allow(unsafe_code)]
pub mod dispatcher;
pub mod schedule;
#[allow(unsafe_code)]
pub mod system;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use tessera_ecs;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while building a schedule or running it.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A system named a dependency that has not been added (yet).
    #[error("system '{system}' depends on unknown system '{dependency}'")]
    DependencyNotFound { system: String, dependency: String },

    /// Two systems were added under one name.
    #[error("a system named '{name}' was already added")]
    DuplicateSystem { name: String },

    /// Stage partitioning stalled with systems left over.
    #[error("dependency cycle among {remaining} remaining systems")]
    CycleDetected { remaining: usize },

    /// The worker pool could not be started.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Ecs(#[from] tessera_ecs::EcsError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the ECS prelude.
    pub use tessera_ecs::prelude::*;

    // Engine-specific exports.
    pub use crate::config::DispatcherConfig;
    pub use crate::dispatcher::{Dispatcher, StageReport, SystemReport, TickReport};
    pub use crate::schedule::{AccessConflict, Schedule, ScheduleBuilder, Stage};
    pub use crate::system::System;
    pub use crate::EngineError;
}
