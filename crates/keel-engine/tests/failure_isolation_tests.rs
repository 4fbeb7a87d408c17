//! A failing system must never stop the others: not during a frame, not
//! while entity notifications are fanned out.

use std::cell::RefCell;
use std::rc::Rc;

use keel_engine::prelude::*;

type Calls = Rc<RefCell<Vec<&'static str>>>;

#[derive(Debug)]
struct Tag;
impl Component for Tag {}

macro_rules! recording_system {
    ($name:ident, fail: $fail:ident) => {
        struct $name {
            calls: Calls,
        }

        impl Module for $name {}

        impl System for $name {
            fn frame_rate(&self) -> Option<u32> {
                Some(0)
            }

            fn execute(&mut self, _ctx: &mut Context<'_>) -> anyhow::Result<()> {
                self.calls.borrow_mut().push(concat!(stringify!($name), ".execute"));
                $fail("execute")
            }

            fn on_entity_registered(&mut self, _ctx: &mut Context<'_>, _entity: EntityId) -> anyhow::Result<()> {
                self.calls.borrow_mut().push(concat!(stringify!($name), ".registered"));
                $fail("registered")
            }

            fn on_entity_removed(&mut self, _ctx: &mut Context<'_>, _entity: &Entity) -> anyhow::Result<()> {
                self.calls.borrow_mut().push(concat!(stringify!($name), ".removed"));
                $fail("removed")
            }
        }
    };
}

fn ok(_: &str) -> anyhow::Result<()> {
    Ok(())
}

fn err(stage: &str) -> anyhow::Result<()> {
    anyhow::bail!("broken in {stage}")
}

fn panics(stage: &str) -> anyhow::Result<()> {
    panic!("exploded in {stage}")
}

recording_system!(First, fail: err);
recording_system!(Second, fail: panics);
recording_system!(Third, fail: ok);

fn engine_with_all(calls: &Calls) -> Engine {
    let mut engine = Engine::new();
    engine.register_system(First { calls: calls.clone() }).unwrap();
    engine.register_system(Second { calls: calls.clone() }).unwrap();
    engine.register_system(Third { calls: calls.clone() }).unwrap();
    engine
}

#[test]
fn removal_hook_runs_once_per_system_despite_failures() {
    let calls = Calls::default();
    let mut engine = engine_with_all(&calls);
    let id = engine
        .create_entity(Some("victim"), |e| {
            e.attach(Tag);
        })
        .unwrap();
    calls.borrow_mut().clear();

    engine.remove_entity(id).unwrap();
    assert_eq!(
        *calls.borrow(),
        vec!["First.removed", "Second.removed", "Third.removed"]
    );
    assert!(!engine.world().contains(id));
}

#[test]
fn registration_hook_reaches_every_system() {
    let calls = Calls::default();
    let mut engine = engine_with_all(&calls);
    engine.create_entity(None, |_| {}).unwrap();
    assert_eq!(
        *calls.borrow(),
        vec!["First.registered", "Second.registered", "Third.registered"]
    );
}

#[test]
fn frame_continues_past_failing_systems() {
    let calls = Calls::default();
    let mut engine = engine_with_all(&calls);

    engine.execute();
    engine.execute();

    let executes: Vec<&str> = calls
        .borrow()
        .iter()
        .copied()
        .filter(|c| c.ends_with(".execute"))
        .collect();
    assert_eq!(
        executes,
        vec![
            "First.execute",
            "Second.execute",
            "Third.execute",
            "First.execute",
            "Second.execute",
            "Third.execute",
        ]
    );

    let failures = &engine.scheduler().last_diagnostics().failures;
    assert_eq!(failures.len(), 2, "{failures:?}");
    assert!(failures[0].contains("broken in execute"));
    assert!(failures[1].contains("exploded in execute"));
}

#[test]
fn failing_system_state_survives() {
    struct Flaky {
        attempts: u32,
    }
    impl Module for Flaky {}
    impl System for Flaky {
        fn frame_rate(&self) -> Option<u32> {
            Some(0)
        }
        fn execute(&mut self, _ctx: &mut Context<'_>) -> anyhow::Result<()> {
            self.attempts += 1;
            if self.attempts % 2 == 1 {
                panic!("odd attempt");
            }
            Ok(())
        }
    }

    let mut engine = Engine::new();
    engine.register_system(Flaky { attempts: 0 }).unwrap();
    for _ in 0..4 {
        engine.execute();
    }
    assert_eq!(engine.system::<Flaky>().unwrap().attempts, 4);
}

#[test]
fn panicking_after_system_callback_is_isolated() {
    struct Bomb;
    impl Module for Bomb {}
    impl System for Bomb {
        fn frame_rate(&self) -> Option<u32> {
            Some(0)
        }
        fn execute(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()> {
            ctx.run_after_system(|_, _| panic!("callback exploded"));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Counter {
        runs: u32,
    }
    impl Module for Counter {}
    impl System for Counter {
        fn frame_rate(&self) -> Option<u32> {
            Some(0)
        }
        fn execute(&mut self, _ctx: &mut Context<'_>) -> anyhow::Result<()> {
            self.runs += 1;
            Ok(())
        }
    }

    let mut engine = Engine::new();
    engine.register_system(Bomb).unwrap();
    engine.register_system(Counter::default()).unwrap();
    engine.execute();

    assert_eq!(engine.system::<Counter>().unwrap().runs, 1);
    let failures = &engine.scheduler().last_diagnostics().failures;
    assert_eq!(failures.len(), 1, "{failures:?}");
    assert!(failures[0].contains("Bomb failed in run_after_system"), "{failures:?}");
    assert!(failures[0].contains("callback exploded"), "{failures:?}");

    // The frame closed, so a new system is scheduled straight away.
    engine
        .register_system(Third {
            calls: Calls::default(),
        })
        .unwrap();
    assert_eq!(engine.scheduler().system_names(), vec!["Bomb", "Counter", "Third"]);
}
