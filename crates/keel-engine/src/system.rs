//! The system contract.
//!
//! A [`System`] is a [`Module`] the scheduler also drives: it gets a
//! per-frame [`execute`](System::execute) call at its own frame rate and
//! hooks for entity lifecycle events. Everything a system does runs behind a
//! failure-isolation boundary; an `Err` or a panic is logged and the engine
//! carries on with the next system.

use std::any::type_name;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use keel_ecs::kind::short_name;
use keel_ecs::prelude::*;

use crate::bus::{handlers_of, HandlerTable, Module};
use crate::context::Context;
use crate::EngineError;

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// A module with per-frame work.
///
/// Only [`execute`](System::execute) is required. Hooks default to doing
/// nothing, except [`on_entity_changed`](System::on_entity_changed), which
/// forwards to [`on_entity_registered`](System::on_entity_registered) so a
/// system tracking membership can handle both in one place.
pub trait System: Module + AsAny {
    /// Runs per second. `Some(0)` runs on every scheduler tick, `None` uses
    /// the engine's configured default.
    fn frame_rate(&self) -> Option<u32> {
        None
    }

    /// Per-frame work. [`Context::delta_time`] holds the (speed-scaled) time
    /// since this system last ran.
    fn execute(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()>;

    /// A new entity is live with its initial components attached.
    fn on_entity_registered(&mut self, _ctx: &mut Context<'_>, _entity: EntityId) -> anyhow::Result<()> {
        Ok(())
    }

    /// The component set of `entity` changed.
    fn on_entity_changed(&mut self, ctx: &mut Context<'_>, entity: EntityId) -> anyhow::Result<()> {
        self.on_entity_registered(ctx, entity)
    }

    /// `entity` has been removed from the registry. It is still fully
    /// readable here and dropped once every system has seen it.
    fn on_entity_removed(&mut self, _ctx: &mut Context<'_>, _entity: &Entity) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BoxedSystem / SystemFactory
// ---------------------------------------------------------------------------

/// A type-erased system together with everything the scheduler needs to
/// register it: its kind, display name and message handlers.
pub struct BoxedSystem {
    pub(crate) kind: KindId,
    pub(crate) name: String,
    pub(crate) handlers: HandlerTable,
    pub(crate) system: Box<dyn System>,
}

impl BoxedSystem {
    /// Box `system`, capturing its subscriptions.
    pub fn new<S: System>(system: S) -> Self {
        Self {
            kind: KindId::of::<S>(),
            name: short_name(type_name::<S>()).to_owned(),
            handlers: handlers_of::<S>(),
            system: Box::new(system),
        }
    }

    /// Kind of the boxed system.
    pub fn kind(&self) -> KindId {
        self.kind
    }

    /// Short type name of the boxed system.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frame rate the system asks for.
    pub fn frame_rate(&self) -> Option<u32> {
        self.system.frame_rate()
    }
}

impl fmt::Debug for BoxedSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxedSystem")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Entry point of a system plugin: build a system, possibly seeding the
/// registry with entities it needs.
pub type SystemFactory = fn(&mut EntityRegistry) -> BoxedSystem;

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

/// Where a module failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Execute,
    EntityRegistered,
    EntityChanged,
    EntityRemoved,
    /// A `run_after_system` callback the module queued.
    AfterSystem,
    /// Handling a message of the given kind.
    Message(KindId),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Execute => f.write_str("execute"),
            Stage::EntityRegistered => f.write_str("on_entity_registered"),
            Stage::EntityChanged => f.write_str("on_entity_changed"),
            Stage::EntityRemoved => f.write_str("on_entity_removed"),
            Stage::AfterSystem => f.write_str("run_after_system"),
            Stage::Message(kind) => write!(f, "message {kind}"),
        }
    }
}

/// Run `work`, turning an `Err` (and, with `catch_panics`, a panic) into a
/// logged [`EngineError::SystemFailure`].
pub(crate) fn isolate<F>(module: &str, stage: Stage, catch_panics: bool, work: F) -> Result<(), EngineError>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    let outcome = if catch_panics {
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(payload.as_ref()))),
        }
    } else {
        work()
    };

    outcome.map_err(|error| {
        tracing::error!(module, %stage, error = %format!("{error:#}"), "system failure isolated");
        EngineError::SystemFailure {
            module: module.to_owned(),
            stage,
            error,
        }
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Subscriptions;

    struct Tick;

    struct Ticker;

    impl Module for Ticker {
        fn subscriptions(subs: &mut Subscriptions<Self>) {
            subs.on(|_: &mut Ticker, _ctx, _: &Tick| Ok(()));
        }
    }

    impl System for Ticker {
        fn frame_rate(&self) -> Option<u32> {
            Some(30)
        }

        fn execute(&mut self, _ctx: &mut Context<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn boxed_system_captures_identity() {
        let boxed = BoxedSystem::new(Ticker);
        assert_eq!(boxed.kind(), KindId::of::<Ticker>());
        assert_eq!(boxed.name(), "Ticker");
        assert_eq!(boxed.frame_rate(), Some(30));
        assert!(boxed.handlers.contains_key(&KindId::of::<Tick>()));
    }

    #[test]
    fn isolate_passes_success_through() {
        assert!(isolate("m", Stage::Execute, true, || Ok(())).is_ok());
    }

    #[test]
    fn isolate_wraps_errors() {
        let err = isolate("mover", Stage::EntityRemoved, true, || anyhow::bail!("boom")).unwrap_err();
        match err {
            EngineError::SystemFailure { module, stage, error } => {
                assert_eq!(module, "mover");
                assert_eq!(stage, Stage::EntityRemoved);
                assert_eq!(error.to_string(), "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn isolate_catches_panics() {
        let err = isolate("m", Stage::Execute, true, || panic!("kaboom")).unwrap_err();
        assert!(err.to_string().contains("kaboom"), "{err}");
    }

    #[test]
    fn stage_display_names_the_hook() {
        assert_eq!(Stage::EntityChanged.to_string(), "on_entity_changed");
        assert!(Stage::Message(KindId::of::<Tick>()).to_string().starts_with("message Tick"));
    }
}
