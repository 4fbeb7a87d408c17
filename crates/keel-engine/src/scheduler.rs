//! Frame-rate aware system scheduler.
//!
//! The [`Scheduler`] owns the message bus and the ordered list of systems.
//! Each call to [`Scheduler::execute`] is one engine frame:
//!
//! 1. Pending entity lifecycle events are fanned out to every system.
//! 2. Systems are visited in registration order. A system runs when its
//!    interval (`1000 / frame_rate` ms) has elapsed, or always when its frame
//!    rate is 0. It receives the speed-scaled time since its previous run.
//! 3. After each system, queued `run_after_system` callbacks run and the
//!    lifecycle events the system caused are fanned out.
//! 4. Systems added or removed during the frame join or leave the schedule.
//!
//! Every system call sits behind a failure-isolation boundary: an error or
//! panic is logged, recorded in [`TickDiagnostics`], and the frame goes on.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use keel_engine::prelude::*;
//!
//! #[derive(Default)]
//! struct Counter { runs: u32 }
//! impl Module for Counter {}
//! impl System for Counter {
//!     fn frame_rate(&self) -> Option<u32> { Some(10) }
//!     fn execute(&mut self, _ctx: &mut Context<'_>) -> anyhow::Result<()> {
//!         self.runs += 1;
//!         Ok(())
//!     }
//! }
//!
//! let clock = ManualClock::new();
//! let mut scheduler = Scheduler::with_clock(EngineConfig::default(), clock.clone());
//! let mut world = EntityRegistry::new();
//! scheduler.register(Counter::default()).unwrap();
//!
//! for _ in 0..30 {
//!     scheduler.execute(&mut world);
//!     clock.advance(Duration::from_millis(10));
//! }
//! // 290 ms of simulated time at 100 ms per run.
//! assert_eq!(scheduler.system::<Counter>().unwrap().runs, 2);
//! ```

use std::any::type_name;
use std::fmt;
use std::time::{Duration, Instant};

use keel_ecs::prelude::*;

use crate::bus::{Mediator, ModuleBody, ModuleId};
use crate::clock::{Clock, MonotonicClock};
use crate::context::{Context, Deferred};
use crate::system::{isolate, BoxedSystem, Stage, System};
use crate::EngineError;

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Engine-wide scheduling settings.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Multiplier applied to every system's delta time. 0 pauses.
    pub speed: f32,
    /// Whether the isolation boundary also catches panics, not only errors.
    pub catch_panics: bool,
    /// Frame rate for systems that do not ask for one.
    pub default_frame_rate: u32,
}

impl Default for EngineConfig {
    /// Normal speed, panics caught, 60 runs per second.
    fn default() -> Self {
        Self {
            speed: 1.0,
            catch_panics: true,
            default_frame_rate: 60,
        }
    }
}

/// Negative, NaN and infinite speeds make no sense for a time scale.
fn sanitize_speed(speed: f32) -> f32 {
    if speed.is_finite() && speed > 0.0 {
        speed
    } else {
        if speed != 0.0 {
            tracing::warn!(speed, "invalid speed, pausing instead");
        }
        0.0
    }
}

// ---------------------------------------------------------------------------
// SystemTiming
// ---------------------------------------------------------------------------

/// Per-system timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemTiming {
    /// `None` runs every tick.
    interval: Option<Duration>,
    /// Start of the current interval.
    timer_start: Duration,
    last_call: Duration,
    last_delta: Duration,
}

impl SystemTiming {
    /// Timer for a system running `frame_rate` times per second, started at
    /// `now`. Rates of 0 and above 1000 run every tick.
    pub fn new(frame_rate: u32, now: Duration) -> Self {
        let interval = match frame_rate {
            0 => None,
            rate => Some(Duration::from_millis(1000 / u64::from(rate))).filter(|i| !i.is_zero()),
        };
        Self {
            interval,
            timer_start: now,
            last_call: now,
            last_delta: Duration::ZERO,
        }
    }

    /// Time between runs, `None` for systems that run every tick.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Delta time handed to the system on its last run.
    pub fn last_delta(&self) -> Duration {
        self.last_delta
    }

    /// Restart the timer and the delta-time reference at `now`.
    pub fn restart(&mut self, now: Duration) {
        self.timer_start = now;
        self.last_call = now;
    }

    /// Decide whether the system runs at `now`. If it does, returns its delta
    /// time scaled by `speed` and moves the timer to the last interval
    /// boundary before `now`, so overruns do not accumulate as drift.
    pub fn poll(&mut self, now: Duration, speed: f32) -> Option<Duration> {
        if let Some(interval) = self.interval {
            let elapsed = now.saturating_sub(self.timer_start);
            if elapsed < interval {
                return None;
            }
            let overrun = (elapsed - interval).as_nanos() % interval.as_nanos();
            self.timer_start = now - Duration::from_nanos(overrun as u64);
        }
        let raw = now.saturating_sub(self.last_call);
        let delta = if speed == 1.0 {
            raw
        } else {
            Duration::try_from_secs_f64(raw.as_secs_f64() * f64::from(speed)).unwrap_or(Duration::MAX)
        };
        self.last_call = now;
        self.last_delta = delta;
        Some(delta)
    }
}

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// What happened during the last [`Scheduler::execute`].
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Wall-clock time of each system that ran, in execution order.
    pub system_times: Vec<(String, Duration)>,
    /// Rendered [`EngineError::SystemFailure`]s isolated by the scheduler.
    pub failures: Vec<String>,
    /// Wall-clock time of the whole frame.
    pub total_time: Duration,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct ScheduledSystem {
    kind: KindId,
    name: String,
    module: ModuleId,
    timing: SystemTiming,
}

/// Drives registered systems and owns the message bus.
pub struct Scheduler {
    bus: Mediator,
    /// Execution order.
    systems: Vec<ScheduledSystem>,
    /// Registered mid-frame, scheduled from the next frame on.
    pending_add: Vec<ScheduledSystem>,
    /// Removed mid-frame, dropped at the end of the frame.
    pending_remove: Vec<KindId>,
    after_system: Vec<Deferred>,
    config: EngineConfig,
    clock: Box<dyn Clock>,
    first_tick: bool,
    in_frame: bool,
    tick_count: u64,
    last_diagnostics: TickDiagnostics,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("systems", &self.system_names())
            .field("config", &self.config)
            .field("tick_count", &self.tick_count)
            .field("bus", &self.bus)
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Scheduler {
    /// A scheduler on wall-clock time.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, MonotonicClock::new())
    }

    /// A scheduler reading time from `clock`.
    pub fn with_clock(mut config: EngineConfig, clock: impl Clock + 'static) -> Self {
        config.speed = sanitize_speed(config.speed);
        Self {
            bus: Mediator::new(),
            systems: Vec::new(),
            pending_add: Vec::new(),
            pending_remove: Vec::new(),
            after_system: Vec::new(),
            config,
            clock: Box::new(clock),
            first_tick: true,
            in_frame: false,
            tick_count: 0,
            last_diagnostics: TickDiagnostics::default(),
        }
    }

    /// Current settings. Speed changes made through
    /// [`set_speed`](Self::set_speed) are reflected here.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The message bus.
    pub fn bus(&self) -> &Mediator {
        &self.bus
    }

    /// The message bus, mutably.
    pub fn bus_mut(&mut self) -> &mut Mediator {
        &mut self.bus
    }

    // -- registration ---------------------------------------------------------

    /// Register `system` and add it to the bus.
    ///
    /// # Errors
    ///
    /// [`EngineError::SystemAlreadyRegistered`] if a system of the same type
    /// is registered.
    pub fn register<S: System>(&mut self, system: S) -> Result<ModuleId, EngineError> {
        self.register_boxed(BoxedSystem::new(system))
    }

    /// Register an already boxed system, e.g. one built by a
    /// [`SystemFactory`](crate::system::SystemFactory).
    pub fn register_boxed(&mut self, boxed: BoxedSystem) -> Result<ModuleId, EngineError> {
        if self.is_registered(boxed.kind) {
            return Err(EngineError::SystemAlreadyRegistered { system: boxed.name });
        }
        let frame_rate = boxed
            .system
            .frame_rate()
            .unwrap_or(self.config.default_frame_rate);
        let BoxedSystem {
            kind,
            name,
            handlers,
            system,
        } = boxed;

        let module = self.bus.insert(name.clone(), kind, handlers, ModuleBody::System(system));
        let entry = ScheduledSystem {
            kind,
            name,
            module,
            timing: SystemTiming::new(frame_rate, self.clock.now()),
        };
        tracing::debug!(system = %entry.name, frame_rate, deferred = self.in_frame, "system registered");
        if self.in_frame {
            self.pending_add.push(entry);
        } else {
            self.systems.push(entry);
        }
        Ok(module)
    }

    /// Unregister system `S`. Mid-frame the system finishes the frame first.
    ///
    /// # Errors
    ///
    /// [`EngineError::SystemNotFound`] if `S` is not registered.
    pub fn remove_system<S: System>(&mut self) -> Result<(), EngineError> {
        if self.remove_kind(KindId::of::<S>()) {
            Ok(())
        } else {
            Err(EngineError::SystemNotFound {
                system: type_name::<S>(),
            })
        }
    }

    /// Remove module `id` from the bus. The id of a system unregisters the
    /// system, the same way [`remove_system`](Self::remove_system) does.
    /// Returns whether anything was removed.
    pub fn remove_module(&mut self, id: ModuleId) -> bool {
        let system = self
            .systems
            .iter()
            .chain(&self.pending_add)
            .find(|s| s.module == id)
            .map(|s| s.kind);
        match system {
            Some(kind) => self.remove_kind(kind),
            None => self.bus.remove_module(id),
        }
    }

    fn remove_kind(&mut self, kind: KindId) -> bool {
        if let Some(pos) = self.pending_add.iter().position(|s| s.kind == kind) {
            let entry = self.pending_add.remove(pos);
            self.bus.take_module(entry.module);
            tracing::debug!(system = %entry.name, "pending system removed");
            return true;
        }
        if !self.has_kind(kind) {
            return false;
        }
        if self.in_frame {
            self.pending_remove.push(kind);
        } else {
            self.detach(kind);
        }
        true
    }

    fn detach(&mut self, kind: KindId) {
        if let Some(pos) = self.systems.iter().position(|s| s.kind == kind) {
            let entry = self.systems.remove(pos);
            self.bus.take_module(entry.module);
            tracing::debug!(system = %entry.name, "system removed");
        }
    }

    fn is_registered(&self, kind: KindId) -> bool {
        self.systems.iter().chain(&self.pending_add).any(|s| s.kind == kind)
    }

    fn has_kind(&self, kind: KindId) -> bool {
        self.is_registered(kind) && !self.pending_remove.contains(&kind)
    }

    fn entry(&self, kind: KindId) -> Option<&ScheduledSystem> {
        self.systems.iter().chain(&self.pending_add).find(|s| s.kind == kind)
    }

    // -- lookup ---------------------------------------------------------------

    /// Whether system `S` is registered (and not about to be removed).
    pub fn has_system<S: System>(&self) -> bool {
        self.has_kind(KindId::of::<S>())
    }

    /// The registered instance of `S`.
    ///
    /// # Errors
    ///
    /// [`EngineError::SystemNotFound`] if `S` was never registered.
    pub fn system<S: System>(&self) -> Result<&S, EngineError> {
        self.entry(KindId::of::<S>())
            .and_then(|entry| self.bus.module::<S>(entry.module))
            .ok_or(EngineError::SystemNotFound {
                system: type_name::<S>(),
            })
    }

    /// The registered instance of `S`, mutably.
    pub fn system_mut<S: System>(&mut self) -> Result<&mut S, EngineError> {
        let not_found = || EngineError::SystemNotFound {
            system: type_name::<S>(),
        };
        let module = self.entry(KindId::of::<S>()).ok_or_else(not_found)?.module;
        self.bus.module_mut::<S>(module).ok_or_else(not_found)
    }

    /// Timer state of `S`.
    pub fn timing<S: System>(&self) -> Option<&SystemTiming> {
        self.entry(KindId::of::<S>()).map(|entry| &entry.timing)
    }

    /// Names of the scheduled systems, in execution order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    /// Number of scheduled systems.
    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// Frames executed so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Diagnostics of the last frame.
    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }

    // -- speed ----------------------------------------------------------------

    /// Current delta-time multiplier.
    pub fn speed(&self) -> f32 {
        self.config.speed
    }

    /// Scale every system's delta time by `speed`.
    pub fn set_speed(&mut self, speed: f32) {
        self.config.speed = sanitize_speed(speed);
    }

    /// Freeze simulated time: systems still run, with zero delta.
    pub fn pause(&mut self) {
        self.set_speed(0.0);
    }

    /// Back to normal speed.
    pub fn resume(&mut self) {
        self.set_speed(1.0);
    }

    /// Whether the speed is 0.
    pub fn is_paused(&self) -> bool {
        self.config.speed == 0.0
    }

    // -- frame ----------------------------------------------------------------

    /// Run one frame.
    pub fn execute(&mut self, world: &mut EntityRegistry) {
        if self.in_frame {
            // A panic escaped the previous frame with `catch_panics` off.
            tracing::warn!("previous frame did not finish, settling its deferred changes");
            self.end_frame();
        }
        let frame_start = Instant::now();
        self.last_diagnostics = TickDiagnostics::default();
        if self.first_tick {
            let now = self.clock.now();
            for entry in &mut self.systems {
                entry.timing.restart(now);
            }
            self.first_tick = false;
        }
        self.flush_events(world);

        self.in_frame = true;
        for index in 0..self.systems.len() {
            let now = self.clock.now();
            let speed = self.config.speed;
            let entry = &mut self.systems[index];
            let Some(delta) = entry.timing.poll(now, speed) else {
                continue;
            };
            let (module, name) = (entry.module, entry.name.clone());

            tracing::trace!(system = %name, delta_ms = delta.as_secs_f64() * 1000.0, "running system");
            let started = Instant::now();
            self.dispatch(world, module, Stage::Execute, delta, |system, ctx| system.execute(ctx));
            self.last_diagnostics.system_times.push((name, started.elapsed()));
            self.flush_events(world);
        }
        self.end_frame();
        self.tick_count += 1;
        self.last_diagnostics.total_time = frame_start.elapsed();
    }

    /// Apply the registrations and removals deferred during the frame.
    fn end_frame(&mut self) {
        self.in_frame = false;
        for kind in std::mem::take(&mut self.pending_remove) {
            self.detach(kind);
        }
        self.systems.append(&mut self.pending_add);
    }

    /// Run `f` with a top-level [`Context`], then deliver whatever lifecycle
    /// events and deferred callbacks it produced.
    pub fn with_context<R>(&mut self, world: &mut EntityRegistry, f: impl FnOnce(&mut Context<'_>) -> R) -> R {
        let result = {
            let mut ctx = Context::new(
                world,
                &mut self.bus,
                &mut self.after_system,
                Duration::ZERO,
                None,
                self.config.catch_panics,
            );
            f(&mut ctx)
        };
        self.flush_events(world);
        result
    }

    // -- entity notifications -------------------------------------------------

    /// Drain the registry's lifecycle events and fan them out, together with
    /// queued `run_after_system` callbacks, until nothing is left.
    ///
    /// Registered/changed events for entities that are already gone are
    /// dropped; their removal is still announced, after which the removed
    /// entity's hierarchy links are released.
    pub fn flush_events(&mut self, world: &mut EntityRegistry) {
        loop {
            while !self.after_system.is_empty() {
                for Deferred { owner, callback } in std::mem::take(&mut self.after_system) {
                    let result = isolate(&owner, Stage::AfterSystem, self.config.catch_panics, || {
                        callback(&mut *world, &mut *self);
                        Ok(())
                    });
                    if let Err(err) = result {
                        self.last_diagnostics.failures.push(err.to_string());
                    }
                }
            }
            let events = world.drain_events();
            if events.is_empty() {
                break;
            }
            for event in &events {
                match event {
                    EntityEvent::Registered(id) if world.contains(*id) => self.notify_entity_registered(world, *id),
                    EntityEvent::Changed(id) if world.contains(*id) => self.notify_entity_changed(world, *id),
                    EntityEvent::Removed(entity) => {
                        self.notify_entity_removed(world, entity);
                        world.release_links(entity.id());
                    }
                    EntityEvent::Registered(_) | EntityEvent::Changed(_) => {}
                }
            }
        }
    }

    /// Call every system's `on_entity_registered` hook. Systems registered
    /// earlier in the current frame are included.
    pub fn notify_entity_registered(&mut self, world: &mut EntityRegistry, entity: EntityId) {
        self.fan_out(world, Stage::EntityRegistered, |system, ctx| {
            system.on_entity_registered(ctx, entity)
        });
    }

    /// Call every system's `on_entity_changed` hook.
    pub fn notify_entity_changed(&mut self, world: &mut EntityRegistry, entity: EntityId) {
        self.fan_out(world, Stage::EntityChanged, |system, ctx| system.on_entity_changed(ctx, entity));
    }

    /// Call every system's `on_entity_removed` hook.
    pub fn notify_entity_removed(&mut self, world: &mut EntityRegistry, entity: &Entity) {
        self.fan_out(world, Stage::EntityRemoved, |system, ctx| system.on_entity_removed(ctx, entity));
    }

    fn fan_out<F>(&mut self, world: &mut EntityRegistry, stage: Stage, work: F)
    where
        F: Fn(&mut dyn System, &mut Context<'_>) -> anyhow::Result<()>,
    {
        let modules: Vec<ModuleId> = self
            .systems
            .iter()
            .chain(&self.pending_add)
            .map(|s| s.module)
            .collect();
        for module in modules {
            self.dispatch(world, module, stage, Duration::ZERO, &work);
        }
    }

    /// Call into one system behind the isolation boundary.
    fn dispatch<F>(&mut self, world: &mut EntityRegistry, module: ModuleId, stage: Stage, delta: Duration, work: F)
    where
        F: FnOnce(&mut dyn System, &mut Context<'_>) -> anyhow::Result<()>,
    {
        let name = self.bus.name_of(module).unwrap_or_default().to_owned();
        let Some(mut body) = self.bus.take_body(module) else {
            tracing::debug!(system = %name, %stage, "skipping re-entrant dispatch");
            return;
        };
        let catch_panics = self.config.catch_panics;
        let result = match &mut body {
            ModuleBody::System(system) => {
                let mut ctx = Context::new(
                    world,
                    &mut self.bus,
                    &mut self.after_system,
                    delta,
                    Some(module),
                    catch_panics,
                );
                isolate(&name, stage, catch_panics, || work(&mut **system, &mut ctx))
            }
            ModuleBody::Plain(_) => Ok(()),
        };
        self.bus.restore_body(module, body);
        if let Err(err) = result {
            self.last_diagnostics.failures.push(err.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
