//! The [`System`] trait.
//!
//! A system declares the record types it operates on as a [`Query`] and is
//! invoked once per matching entity. It owns whatever state it needs between
//! calls; the schedule owns the system.
//!
//! ```
//! use tessera_engine::prelude::*;
//!
//! #[derive(Debug)]
//! struct Position { x: f32, y: f32 }
//! #[derive(Debug)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! struct Movement;
//!
//! impl System for Movement {
//!     type Query = (Write<Position>, Read<Velocity>);
//!
//!     fn run(&mut self, (pos, vel): <Self::Query as Query>::Item<'_>, _world: &WorldHandle<'_>) {
//!         pos.x += vel.dx;
//!         pos.y += vel.dy;
//!     }
//! }
//! ```

use tessera_ecs::mutation::WorldHandle;
use tessera_ecs::query::{Access, Query};
use tessera_ecs::store::Store;
use tessera_ecs::EcsError;

/// Behavior run over every entity that owns the types in [`Self::Query`].
///
/// `world` is the mutation capability for this call: structural edits go
/// through it and take effect after the current stage.
pub trait System: Send + 'static {
    type Query: Query;

    fn run(&mut self, item: <Self::Query as Query>::Item<'_>, world: &WorldHandle<'_>);
}

// ---------------------------------------------------------------------------
// Type-erased system
// ---------------------------------------------------------------------------

/// Object-safe face of a [`System`], used by the schedule.
pub(crate) trait RunSystem: Send {
    fn accesses(&self, store: &Store) -> Result<Vec<Access>, EcsError>;

    /// Fetch and invoke the system over every match. Returns the match count.
    ///
    /// # Safety
    ///
    /// Same contract as [`Store::fetch_shared`].
    unsafe fn run(&mut self, store: &Store) -> Result<usize, EcsError>;
}

pub(crate) struct Erased<S>(pub(crate) S);

impl<S: System> RunSystem for Erased<S> {
    fn accesses(&self, store: &Store) -> Result<Vec<Access>, EcsError> {
        S::Query::accesses(store)
    }

    unsafe fn run(&mut self, store: &Store) -> Result<usize, EcsError> {
        let accesses = S::Query::accesses(store)?;
        let world = store.handle_for(&accesses);
        let system = &mut self.0;
        store.fetch_shared::<S::Query>(|item| system.run(item, &world))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
