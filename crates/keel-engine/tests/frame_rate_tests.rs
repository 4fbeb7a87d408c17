//! Frame-rate scheduling on simulated time.
//!
//! Every test drives the scheduler with a `ManualClock`, so intervals are
//! exact and the results do not depend on how fast the machine is.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use keel_engine::prelude::*;
use proptest::prelude::*;

#[derive(Debug)]
struct X;
impl Component for X {}

/// What each system saw, by frame.
type Seen = Rc<RefCell<Vec<(u64, Vec<String>)>>>;

struct Observer<const RATE: u32> {
    seen: Seen,
    frame: u64,
}

impl<const RATE: u32> Observer<RATE> {
    fn new(seen: Seen) -> Self {
        Self { seen, frame: 0 }
    }
}

impl<const RATE: u32> Module for Observer<RATE> {}

impl<const RATE: u32> System for Observer<RATE> {
    fn frame_rate(&self) -> Option<u32> {
        Some(RATE)
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        let names = ctx
            .world()
            .get_entities::<(X,)>()
            .map(|e| e.name().to_owned())
            .collect();
        self.seen.borrow_mut().push((self.frame, names));
        self.frame += 1;
        Ok(())
    }
}

// -----------------------------------------------------------------------
// The canonical scenario
// -----------------------------------------------------------------------

#[test]
fn unthrottled_sees_entity_at_once_ten_hz_waits_100ms() {
    let clock = ManualClock::new();
    let mut engine = Engine::with_clock(EngineConfig::default(), clock.clone());

    let seen_a = Seen::default();
    let seen_b = Seen::default();
    engine.register_system(Observer::<0>::new(seen_a.clone())).unwrap();
    engine.register_system(Observer::<10>::new(seen_b.clone())).unwrap();
    engine
        .create_entity(Some("e1"), |e| {
            e.attach(X);
        })
        .unwrap();

    engine.execute();
    assert_eq!(seen_a.borrow().len(), 1);
    assert_eq!(seen_a.borrow()[0].1, vec!["e1"]);
    assert!(seen_b.borrow().is_empty());

    // 99ms of simulated time in 11ms steps: B stays idle.
    for _ in 0..9 {
        clock.advance(Duration::from_millis(11));
        engine.execute();
        assert!(seen_b.borrow().is_empty());
    }
    clock.advance(Duration::from_millis(1));
    engine.execute();
    assert_eq!(seen_b.borrow().len(), 1);
    assert_eq!(seen_b.borrow()[0].1, vec!["e1"]);
    assert_eq!(seen_a.borrow().len(), 11);
}

#[test]
fn timing_reports_interval_and_delta() {
    let clock = ManualClock::new();
    let mut scheduler = Scheduler::with_clock(EngineConfig::default(), clock.clone());
    let mut world = EntityRegistry::new();
    scheduler.register(Observer::<4>::new(Seen::default())).unwrap();

    scheduler.execute(&mut world);
    clock.advance(Duration::from_millis(260));
    scheduler.execute(&mut world);

    let timing = scheduler.timing::<Observer<4>>().unwrap();
    assert_eq!(timing.interval(), Some(Duration::from_millis(250)));
    assert_eq!(timing.last_delta(), Duration::from_millis(260));
}

#[test]
fn paused_engine_keeps_running_systems_with_zero_delta() {
    struct Integrator {
        total: Duration,
    }
    impl Module for Integrator {}
    impl System for Integrator {
        fn frame_rate(&self) -> Option<u32> {
            Some(0)
        }
        fn execute(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()> {
            self.total += ctx.delta_time();
            Ok(())
        }
    }

    let clock = ManualClock::new();
    let mut engine = Engine::with_clock(EngineConfig::default(), clock.clone());
    engine
        .register_system(Integrator {
            total: Duration::ZERO,
        })
        .unwrap();

    engine.execute();
    clock.advance(Duration::from_millis(40));
    engine.execute();
    engine.scheduler_mut().pause();
    clock.advance(Duration::from_millis(40));
    engine.execute();
    engine.scheduler_mut().resume();
    clock.advance(Duration::from_millis(40));
    engine.execute();

    assert_eq!(engine.system::<Integrator>().unwrap().total, Duration::from_millis(80));
    assert_eq!(engine.tick_count(), 4);
}

// -----------------------------------------------------------------------
// Property tests
// -----------------------------------------------------------------------

proptest! {
    /// With steps shorter than the interval a throttled system runs exactly
    /// once per elapsed interval; with any steps it never runs more often.
    #[test]
    fn throttled_runs_bounded_by_elapsed_intervals(
        steps in prop::collection::vec(1u64..250, 1..120),
    ) {
        let clock = ManualClock::new();
        let mut scheduler = Scheduler::with_clock(EngineConfig::default(), clock.clone());
        let mut world = EntityRegistry::new();
        let seen = Seen::default();
        scheduler.register(Observer::<10>::new(seen.clone())).unwrap();
        scheduler.register(Observer::<0>::new(Seen::default())).unwrap();

        scheduler.execute(&mut world);
        let mut elapsed = 0u64;
        for step in &steps {
            clock.advance(Duration::from_millis(*step));
            elapsed += step;
            scheduler.execute(&mut world);
        }

        let runs = seen.borrow().len() as u64;
        prop_assert!(runs <= elapsed / 100, "runs={runs} elapsed={elapsed}");
        if steps.iter().all(|s| *s <= 100) {
            prop_assert_eq!(runs, elapsed / 100);
        }
        prop_assert_eq!(scheduler.tick_count(), steps.len() as u64 + 1);
    }

    /// Unthrottled systems run on every tick regardless of spacing.
    #[test]
    fn unthrottled_runs_every_tick(steps in prop::collection::vec(0u64..50, 0..60)) {
        let clock = ManualClock::new();
        let mut scheduler = Scheduler::with_clock(EngineConfig::default(), clock.clone());
        let mut world = EntityRegistry::new();
        let seen = Seen::default();
        scheduler.register(Observer::<0>::new(seen.clone())).unwrap();

        scheduler.execute(&mut world);
        for step in &steps {
            clock.advance(Duration::from_millis(*step));
            scheduler.execute(&mut world);
        }
        prop_assert_eq!(seen.borrow().len(), steps.len() + 1);
    }
}
