//! Keel Engine -- systems, messaging and scheduling on top of `keel-ecs`.
//!
//! The kernel is single-threaded and frame driven. An [`Engine`](engine::Engine)
//! owns the entity registry and a [`Scheduler`](scheduler::Scheduler); the
//! scheduler owns the [`Mediator`](bus::Mediator) message bus, on which every
//! system is also a module. One call to `execute()` is one frame: every
//! system whose frame rate allows it runs once, in registration order, and a
//! failure in one system is logged without stopping the others.
//!
//! # Quick Start
//!
//! ```
//! use keel_engine::prelude::*;
//!
//! #[derive(Debug)]
//! struct Position(f32);
//! impl Component for Position {}
//!
//! #[derive(Debug)]
//! struct Speed(f32);
//! impl Component for Speed {}
//!
//! struct Movement;
//! impl Module for Movement {}
//! impl System for Movement {
//!     fn frame_rate(&self) -> Option<u32> { Some(0) }
//!     fn execute(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()> {
//!         let dt = ctx.delta_seconds();
//!         for id in ctx.world().entity_ids_with::<(Position, Speed)>() {
//!             let entity = ctx.world_mut().entity_mut(id)?;
//!             let speed = entity.get::<Speed>()?.0;
//!             entity.get_mut::<Position>()?.0 += speed * dt;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut engine = Engine::new();
//! engine.register_system(Movement).unwrap();
//! engine
//!     .create_entity(Some("ball"), |e| {
//!         e.attach(Position(0.0));
//!         e.attach(Speed(2.0));
//!     })
//!     .unwrap();
//! engine.execute();
//! assert_eq!(engine.tick_count(), 1);
//! ```

#![deny(unsafe_code)]

pub mod bus;
pub mod clock;
pub mod context;
pub mod engine;
pub mod scheduler;
pub mod system;
pub mod task;

use bus::ModuleId;
use keel_ecs::EcsError;
use system::Stage;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the engine layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A registry or component-store operation failed.
    #[error(transparent)]
    Ecs(#[from] EcsError),

    /// No system of the requested type is registered.
    #[error("system {system} is not registered")]
    SystemNotFound { system: &'static str },

    /// A system of the same type is already registered.
    #[error("system {system} is already registered")]
    SystemAlreadyRegistered { system: String },

    /// The addressed module does not exist (never added, or removed).
    #[error("{module} does not exist")]
    ModuleNotFound { module: ModuleId },

    /// Nothing answered a query.
    #[error("query {query} received no response")]
    NoResponse { query: &'static str },

    /// A system or handler returned an error or panicked. Isolated and
    /// logged by the scheduler; never propagated out of a frame.
    #[error("{module} failed in {stage}: {error:#}")]
    SystemFailure {
        module: String,
        stage: Stage,
        error: anyhow::Error,
    },

    /// A background task could not be started or did not complete.
    #[error("background task '{task}' failed: {reason}")]
    TaskFailed { task: String, reason: String },
}

impl EngineError {
    /// Whether this is one of the "lookup found nothing" errors.
    pub fn is_not_found(&self) -> bool {
        match self {
            EngineError::Ecs(err) => err.is_not_found(),
            EngineError::SystemNotFound { .. } | EngineError::ModuleNotFound { .. } => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage, including the `keel-ecs` prelude.
pub mod prelude {
    pub use keel_ecs::prelude::*;

    pub use crate::bus::{Mediator, Module, ModuleId, Query, Subscriptions};
    pub use crate::clock::{Clock, ManualClock, MonotonicClock};
    pub use crate::context::Context;
    pub use crate::engine::Engine;
    pub use crate::scheduler::{EngineConfig, Scheduler, SystemTiming, TickDiagnostics};
    pub use crate::system::{BoxedSystem, Stage, System, SystemFactory};
    pub use crate::task::TaskHandle;
    pub use crate::EngineError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
