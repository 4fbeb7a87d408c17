//! Headless demo of per-system frame rates, messaging and queries.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example frame_rates -p keel-engine
//!
//! Two seconds of simulated time are stepped in 5 ms increments. `Physics`
//! runs every tick, `Spawner` twice a second and `Reporter` once a second.

use std::time::Duration;

use keel_engine::prelude::*;

// ---------------------------------------------------------------------------
// Components and messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
struct Position {
    x: f32,
    y: f32,
}

impl Component for Position {
    fn attributes(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        attributes_of(self)
    }
}

#[derive(Debug, Clone)]
struct Velocity {
    dx: f32,
    dy: f32,
}

impl Component for Velocity {}

/// Broadcast by the spawner for every new entity.
struct Spawned(EntityId);

/// Asks physics how far the fastest entity has travelled.
#[derive(Default)]
struct FarthestQuery {
    sender: Option<ModuleId>,
}

#[derive(Debug, Clone)]
struct Farthest {
    name: String,
    distance: f32,
}

impl Query for FarthestQuery {
    type Response = Farthest;

    fn set_sender(&mut self, sender: ModuleId) {
        self.sender = Some(sender);
    }
}

// ---------------------------------------------------------------------------
// Systems
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Physics {
    steps: u64,
}

impl Module for Physics {
    fn subscriptions(subs: &mut Subscriptions<Self>) {
        subs.on(|_: &mut Physics, ctx, query: &FarthestQuery| {
            let farthest = ctx
                .world()
                .query::<(Position,)>()
                .map(|(id, (pos,))| (id, (pos.x * pos.x + pos.y * pos.y).sqrt()))
                .max_by(|a, b| a.1.total_cmp(&b.1));
            let (Some(sender), Some((id, distance))) = (query.sender, farthest) else {
                return Ok(());
            };
            let name = ctx.world().entity(id)?.name().to_owned();
            ctx.send_to(sender, Farthest { name, distance })?;
            Ok(())
        });
    }
}

impl System for Physics {
    fn frame_rate(&self) -> Option<u32> {
        Some(0)
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        let dt = ctx.delta_seconds();
        for id in ctx.world().entity_ids_with::<(Position, Velocity)>() {
            let entity = ctx.world_mut().entity_mut(id)?;
            let vel = entity.get::<Velocity>()?.clone();
            let pos = entity.get_mut::<Position>()?;
            pos.x += vel.dx * dt;
            pos.y += vel.dy * dt;
        }
        self.steps += 1;
        Ok(())
    }
}

#[derive(Default)]
struct Spawner {
    spawned: u32,
}

impl Module for Spawner {}

impl System for Spawner {
    fn frame_rate(&self) -> Option<u32> {
        Some(2)
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        let speed = 1.0 + self.spawned as f32;
        let id = ctx.world_mut().create_entity(None, |e| {
            e.attach(Position { x: 0.0, y: 0.0 });
            e.attach(Velocity { dx: speed, dy: 0.5 });
        })?;
        self.spawned += 1;
        ctx.send(Spawned(id));
        Ok(())
    }
}

#[derive(Default)]
struct Reporter {
    announced: u32,
}

impl Module for Reporter {
    fn subscriptions(subs: &mut Subscriptions<Self>) {
        subs.on(|reporter: &mut Reporter, ctx, spawned: &Spawned| {
            reporter.announced += 1;
            let name = ctx.world().entity(spawned.0)?.name().to_owned();
            tracing::debug!(%name, "spawn announced");
            Ok(())
        });
    }
}

impl System for Reporter {
    fn frame_rate(&self) -> Option<u32> {
        Some(1)
    }

    fn execute(&mut self, ctx: &mut Context<'_>) -> anyhow::Result<()> {
        let physics_steps = ctx.system::<Physics>()?.steps;
        match ctx.query(FarthestQuery::default()) {
            Ok(Farthest { name, distance }) => {
                tracing::info!(physics_steps, announced = self.announced, %name, distance, "report");
            }
            Err(err) => tracing::info!(physics_steps, %err, "nothing to report yet"),
        }
        Ok(())
    }

    fn on_entity_removed(&mut self, _ctx: &mut Context<'_>, entity: &Entity) -> anyhow::Result<()> {
        tracing::info!(entity = %entity.describe(), "entity removed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config: EngineConfig = serde_json::from_str(r#"{ "speed": 1.0, "default_frame_rate": 30 }"#)?;
    let clock = ManualClock::new();
    let mut engine = Engine::with_clock(config, clock.clone());

    engine.register_system(Physics::default())?;
    engine.register_system(Spawner::default())?;
    engine.register_system(Reporter::default())?;

    // Background work hands its result back to the frame loop.
    let mut loader = engine.run_async("level-loader", || vec!["rock", "tree", "well"])?;

    let step = Duration::from_millis(5);
    for _ in 0..400 {
        engine.execute();
        if let Some(props) = loader.try_take() {
            for prop in props? {
                engine.create_entity(Some(prop), |e| {
                    e.attach(Position { x: 0.0, y: 0.0 });
                })?;
            }
        }
        clock.advance(step);
    }

    engine.remove_entity_named("entity0")?;

    let scheduler = engine.scheduler();
    println!(
        "{} frames, physics ran {} times, spawner created {} entities, {} entities alive",
        scheduler.tick_count(),
        engine.system::<Physics>()?.steps,
        engine.system::<Spawner>()?.spawned,
        engine.world().len(),
    );
    Ok(())
}
