//! Demo scene: a spinning emitter that spawns short-lived drifting motes
//!
//! Motes are created from the emitter's per-frame update, so they join the
//! live set on the following frame, and destroy themselves from their own
//! update once their lifetime runs out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use cadence_core::{GameTime, Transform};
use cadence_ecs::{
    Component, Context, Entity, EntityBuilder, EntityError, EntityManager, FrameStats, Hooks,
    NotificationCenter,
};
use cadence_scene::{Hierarchy, SharedHierarchy, TransformComponent};
use glam::{Quat, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::settings::DemoSettings;

/// Posted when the emitter spawns a mote
#[derive(Debug, Clone)]
pub struct Spawned {
    pub name: String,
}

/// Posted when a mote runs out of time
#[derive(Debug, Clone)]
pub struct Expired {
    pub name: String,
    pub age: f32,
}

/// Counts demo notifications
#[derive(Debug, Default)]
pub struct Census {
    spawned: AtomicUsize,
    expired: AtomicUsize,
}

impl Census {
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn expired(&self) -> usize {
        self.expired.load(Ordering::Relaxed)
    }
}

/// Run `f` against the entity's transform component
fn with_transform<R>(
    entity: &Entity,
    f: impl FnOnce(&mut TransformComponent) -> R,
) -> Result<Option<R>, EntityError> {
    match entity.get_component::<TransformComponent>() {
        Some(handle) => handle.with::<TransformComponent, _>(f).map(Some),
        None => Ok(None),
    }
}

// ---- Components ----

struct Emitter {
    hierarchy: SharedHierarchy,
    notifications: Arc<NotificationCenter>,
    settings: DemoSettings,
    rng: StdRng,
    elapsed: f32,
    spawned: usize,
}

impl Emitter {
    fn spawn(&mut self, ctx: &Context<'_>) -> Result<()> {
        let name = format!("mote-{}", self.spawned);
        let mote = Entity::named(name.clone());

        let transform = mote.add_component(TransformComponent::new(&self.hierarchy, Transform::IDENTITY))?;
        if let Some(Some(parent)) = with_transform(ctx.entity(), |t| t.node())? {
            transform.with::<TransformComponent, _>(|t| t.set_parent(Some(parent)))??;
        }

        let velocity = Vec3::new(
            self.rng.gen_range(-1.0..1.0),
            self.rng.gen_range(0.5..1.5),
            self.rng.gen_range(-1.0..1.0),
        );
        mote.add_component(Drift { velocity })?;
        mote.add_component(Lifetime {
            lifetime: self.settings.lifetime,
            age: 0.0,
            notifications: self.notifications.clone(),
        })?;

        ctx.manager().register_entity(&mote)?;
        self.spawned += 1;
        self.notifications.post(ctx.entity(), Spawned { name });
        Ok(())
    }
}

impl Component for Emitter {
    fn hooks(&self) -> Hooks {
        Hooks::ATTACHED | Hooks::START | Hooks::UPDATE
    }

    fn start(&mut self, ctx: &Context<'_>) -> Result<()> {
        debug!("Emitter {} ready", ctx.entity());
        Ok(())
    }

    fn update(&mut self, ctx: &Context<'_>, time: &GameTime) -> Result<()> {
        if self.settings.spawn_interval <= 0.0 {
            return Ok(());
        }
        self.elapsed += time.delta_time;
        while self.elapsed >= self.settings.spawn_interval && self.spawned < self.settings.max_spawned {
            self.elapsed -= self.settings.spawn_interval;
            self.spawn(ctx)?;
        }
        Ok(())
    }
}

struct Spin {
    speed: f32,
}

impl Component for Spin {
    fn hooks(&self) -> Hooks {
        Hooks::ATTACHED | Hooks::UPDATE
    }

    fn update(&mut self, ctx: &Context<'_>, time: &GameTime) -> Result<()> {
        let rotation = Quat::from_rotation_y(self.speed * time.delta_time);
        if let Some(result) = with_transform(ctx.entity(), |t| t.rotate(rotation))? {
            result?;
        }
        Ok(())
    }
}

struct Drift {
    velocity: Vec3,
}

impl Component for Drift {
    fn hooks(&self) -> Hooks {
        Hooks::ATTACHED | Hooks::UPDATE
    }

    fn update(&mut self, ctx: &Context<'_>, time: &GameTime) -> Result<()> {
        let offset = self.velocity * time.delta_time;
        if let Some(result) = with_transform(ctx.entity(), |t| t.translate(offset))? {
            result?;
        }
        Ok(())
    }
}

struct Lifetime {
    lifetime: f32,
    age: f32,
    notifications: Arc<NotificationCenter>,
}

impl Component for Lifetime {
    fn hooks(&self) -> Hooks {
        Hooks::ATTACHED | Hooks::UPDATE
    }

    fn update(&mut self, ctx: &Context<'_>, time: &GameTime) -> Result<()> {
        self.age += time.delta_time;
        if self.age < self.lifetime {
            return Ok(());
        }
        let name = ctx.entity().name().unwrap_or("mote").to_string();
        self.notifications.post(
            ctx.entity(),
            Expired {
                name,
                age: self.age,
            },
        );
        ctx.destroy_entity()?;
        Ok(())
    }
}

// ---- Scene ----

/// The demo scene and everything needed to drive it
pub struct Demo {
    pub manager: EntityManager,
    pub hierarchy: SharedHierarchy,
    pub notifications: Arc<NotificationCenter>,
    pub census: Arc<Census>,
    pub emitter: Entity,
}

impl Demo {
    pub fn build(settings: &DemoSettings) -> Result<Self> {
        let manager = EntityManager::new();
        let hierarchy = Hierarchy::shared();
        let notifications = Arc::new(NotificationCenter::new());
        let census = Arc::new(Census::default());

        let counter = census.clone();
        notifications.observe::<Spawned, _>(move |_| {
            counter.spawned.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        let counter = census.clone();
        notifications.observe::<Expired, _>(move |posted| {
            counter.expired.fetch_add(1, Ordering::Relaxed);
            debug!("{} expired after {:.2}s", posted.notification.name, posted.notification.age);
            Ok(())
        });

        let mut builder = EntityBuilder::new(&manager);
        let emitter = builder.create_entity_with(Some("emitter"), |entity| {
            entity.add_component(TransformComponent::new(
                &hierarchy,
                Transform::from_position(Vec3::new(0.0, 1.0, 0.0)),
            ))?;
            entity.add_component(Spin { speed: 1.5 })?;
            entity.add_component(Emitter {
                hierarchy: hierarchy.clone(),
                notifications: notifications.clone(),
                settings: settings.clone(),
                rng: StdRng::seed_from_u64(settings.seed),
                elapsed: 0.0,
                spawned: 0,
            })?;
            Ok(())
        })?;
        builder.create_entity_with(Some("origin"), |entity| {
            entity.add_component(TransformComponent::new(&hierarchy, Transform::IDENTITY))?;
            Ok(())
        })?;
        let staged = builder.register_entities()?;
        info!("Demo scene built with {} entities staged", staged.len());

        Ok(Self {
            manager,
            hierarchy,
            notifications,
            census,
            emitter,
        })
    }

    /// Run one frame
    pub fn step(&self, time: &GameTime) -> Result<FrameStats, EntityError> {
        let stats = self.manager.update(time)?;
        self.notifications.tick(time);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> DemoSettings {
        DemoSettings {
            spawn_interval: 0.1,
            lifetime: 0.25,
            max_spawned: 5,
            seed: 1,
        }
    }

    fn run(demo: &Demo, frames: usize) -> GameTime {
        let mut time = GameTime::default();
        for _ in 0..frames {
            time.update(1.0 / 60.0);
            demo.step(&time).unwrap();
        }
        time
    }

    #[test]
    fn scene_is_live_after_first_frame() {
        let demo = Demo::build(&quick()).unwrap();
        assert_eq!(demo.manager.entity_count(), 0);
        run(&demo, 1);
        assert_eq!(demo.manager.entity_count(), 2);
        assert!(demo.manager.find("emitter").is_some());
        assert_eq!(demo.hierarchy.lock().len(), 2);
    }

    #[test]
    fn motes_spawn_drift_and_expire() {
        let demo = Demo::build(&quick()).unwrap();
        run(&demo, 120);

        assert_eq!(demo.census.spawned(), 5);
        assert_eq!(demo.census.expired(), 5);
        assert_eq!(demo.manager.entity_count(), 2);
        // Every mote took its node with it.
        assert_eq!(demo.hierarchy.lock().len(), 2);
    }

    #[test]
    fn motes_hang_off_the_emitter() {
        let demo = Demo::build(&quick()).unwrap();
        run(&demo, 12);

        let mote = demo.manager.find("mote-0").unwrap();
        let emitter_node = TransformComponent::node_of(&demo.emitter);
        let mote_node = TransformComponent::node_of(&mote).unwrap();
        assert_eq!(demo.hierarchy.lock().parent(mote_node).unwrap(), emitter_node);
    }
}
