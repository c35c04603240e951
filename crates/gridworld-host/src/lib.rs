//! Host-side embedding surface for gridworld simulations.
//!
//! [`Simulation`] wraps the core world behind the byte-oriented boundary a
//! host drives: lifecycle, stepping, whole-state snapshots, and entity
//! transfer. Everything observable stays typed on the inside; only the
//! boundary speaks buffers.

use gridworld_core::{
    CoProcessorPolicy, CoProcessorRegistry, EntityKind, TickReport, WorldConfig, WorldError,
    WorldState,
};
use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors surfaced by host-level operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// The underlying world rejected the operation.
    #[error(transparent)]
    World(#[from] WorldError),
    /// Snapshot file I/O failed.
    #[error("snapshot file error: {0}")]
    Io(#[from] std::io::Error),
}

/// One simulation instance behind the host boundary.
pub struct Simulation {
    world: WorldState,
}

impl Simulation {
    /// Build a simulation with the default update rule.
    pub fn new(config: WorldConfig) -> Result<Self, HostError> {
        Ok(Self {
            world: WorldState::new(config)?,
        })
    }

    /// Build a simulation whose agents are decided by a co-processor backend.
    ///
    /// Attachment is negotiated once, here. When the backend cannot be
    /// attached the simulation comes up on the default rule instead; the
    /// failure is logged, not fatal.
    pub fn with_coprocessor(
        config: WorldConfig,
        registry: &CoProcessorRegistry,
        key: u64,
    ) -> Result<Self, HostError> {
        let mut rng = SmallRng::seed_from_u64(config.rng_seed.unwrap_or(0xC0DE_C0DE));
        match CoProcessorPolicy::attach(registry, &mut rng, key) {
            Ok(policy) => {
                info!(backend = policy.backend_kind(), "co-processor attached");
                Ok(Self {
                    world: WorldState::with_policy(config, Box::new(policy))?,
                })
            }
            Err(err) => {
                warn!(%err, "co-processor attach failed; using default rule");
                Self::new(config)
            }
        }
    }

    /// Borrow the underlying world.
    #[must_use]
    pub fn world(&self) -> &WorldState {
        &self.world
    }

    /// Mutably borrow the underlying world.
    #[must_use]
    pub fn world_mut(&mut self) -> &mut WorldState {
        &mut self.world
    }

    /// Exact byte size of a serialized snapshot of the current state.
    #[must_use]
    pub fn state_byte_size(&self) -> usize {
        self.world.state_byte_size()
    }

    /// Serialize the whole state into `buffer`; 0 means the buffer was too
    /// small and nothing was written.
    pub fn get_state(&self, buffer: &mut [u8]) -> usize {
        self.world.get_state(buffer)
    }

    /// Replace the whole state from snapshot bytes, atomically.
    pub fn set_state(&mut self, bytes: &[u8]) -> Result<(), HostError> {
        self.world.set_state(bytes)?;
        Ok(())
    }

    /// Enter the running state; idempotent.
    pub fn start(&mut self) {
        self.world.start();
    }

    /// Leave the running state; idempotent.
    pub fn stop(&mut self) {
        self.world.stop();
    }

    /// Whether the simulation is in the running state.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.world.is_running()
    }

    /// Advance exactly one tick, in either lifecycle state.
    pub fn step(&mut self) -> TickReport {
        self.world.step()
    }

    /// Offer an externally sourced entity; `false` means it was not admitted.
    pub fn transfer_entity_in(&mut self, bytes: &[u8]) -> bool {
        self.world.transfer_in(bytes)
    }

    /// Byte size of the pending emigrant, or 0 when none is flagged.
    #[must_use]
    pub fn pending_transfer_out_size(&self) -> usize {
        self.world.pending_transfer_out_size()
    }

    /// Collect the pending emigrant into `buffer`; 0 leaves it pending.
    pub fn transfer_entity_out(&mut self, buffer: &mut [u8]) -> usize {
        self.world.transfer_out(buffer)
    }

    /// Write the current snapshot to `path`, returning bytes written.
    pub fn save_snapshot(&self, path: &Path) -> Result<usize, HostError> {
        let needed = self.world.state_byte_size();
        let mut buffer = vec![0u8; needed];
        let written = self.world.get_state(&mut buffer);
        debug_assert_eq!(written, needed);
        std::fs::write(path, &buffer[..written])?;
        info!(path = %path.display(), bytes = written, "snapshot saved");
        Ok(written)
    }

    /// Restore the whole state from a snapshot file.
    pub fn load_snapshot(&mut self, path: &Path) -> Result<(), HostError> {
        let bytes = std::fs::read(path)?;
        self.world.set_state(&bytes)?;
        info!(path = %path.display(), bytes = bytes.len(), "snapshot loaded");
        Ok(())
    }
}

/// Move the pending emigrant, if any, from `source` into `dest`.
///
/// Returns `true` when an entity changed worlds. When `dest` refuses
/// admission the entity is dropped, mirroring the best-effort transfer
/// contract; callers that cannot afford loss should inspect
/// [`Simulation::pending_transfer_out_size`] and carry the bytes themselves.
pub fn relay_emigrant(source: &mut Simulation, dest: &mut Simulation) -> bool {
    let needed = source.pending_transfer_out_size();
    if needed == 0 {
        return false;
    }
    let mut buffer = vec![0u8; needed];
    if source.transfer_entity_out(&mut buffer) != needed {
        return false;
    }
    let admitted = dest.transfer_entity_in(&buffer);
    if !admitted {
        warn!(bytes = needed, "emigrant rejected by destination; dropped");
    }
    admitted
}

/// Point-in-time summary of one simulation, for logs and status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationStatus {
    pub world_id: Uuid,
    pub tick: u64,
    pub running: bool,
    pub policy: String,
    pub width: u32,
    pub height: u32,
    pub agents: usize,
    pub barriers: usize,
    pub resources: usize,
    pub soil_blocks: usize,
    pub signal_markers: usize,
    pub conduits: usize,
    pub rocks: usize,
    pub pending_transfer_out: bool,
}

impl From<&Simulation> for SimulationStatus {
    fn from(sim: &Simulation) -> Self {
        let world = sim.world();
        Self {
            world_id: world.world_id(),
            tick: world.tick().0,
            running: world.is_running(),
            policy: world.policy_name().to_string(),
            width: world.grid().width(),
            height: world.grid().height(),
            agents: world.entity_count(EntityKind::MobileAgent),
            barriers: world.entity_count(EntityKind::Barrier),
            resources: world.entity_count(EntityKind::Resource),
            soil_blocks: world.entity_count(EntityKind::SoilBlock),
            signal_markers: world.entity_count(EntityKind::SignalMarker),
            conduits: world.entity_count(EntityKind::Conduit),
            rocks: world.entity_count(EntityKind::Rock),
            pending_transfer_out: world.pending_out().is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridworld_core::{
        CellPos, Direction, EmigrationPolicy, EntityData, EntityId, EntityStore, Tick,
    };
    use gridworld_coproc::register_wander;

    fn seeded_sim(seed: u64) -> Simulation {
        let config = WorldConfig {
            width: 12,
            height: 12,
            rng_seed: Some(seed),
            world_id: Some(Uuid::from_u128(u128::from(seed))),
            ..WorldConfig::default()
        };
        Simulation::new(config).expect("simulation")
    }

    #[test]
    fn lifecycle_is_idempotent_and_stepping_ignores_it() {
        let mut sim = seeded_sim(1);
        assert!(!sim.is_running());
        sim.step();
        sim.start();
        sim.start();
        assert!(sim.is_running());
        sim.step();
        sim.stop();
        sim.stop();
        assert!(!sim.is_running());
        assert_eq!(sim.world().tick(), Tick(2));
    }

    #[test]
    fn snapshot_buffer_contract_holds_through_the_facade() {
        let mut sim = seeded_sim(2);
        sim.world_mut()
            .spawn(
                EntityKind::MobileAgent,
                EntityData::facing(CellPos::new(3, 3), Direction::South),
            )
            .expect("agent");

        let needed = sim.state_byte_size();
        assert!(needed > 0);
        let mut short = vec![0u8; needed - 1];
        assert_eq!(sim.get_state(&mut short), 0);

        let mut buffer = vec![0u8; needed];
        assert_eq!(sim.get_state(&mut buffer), needed);

        let mut other = seeded_sim(3);
        other.set_state(&buffer).expect("set_state");
        assert_eq!(other.world().snapshot(), sim.world().snapshot());
    }

    #[test]
    fn snapshot_files_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("world.gwsn");

        let mut sim = seeded_sim(4);
        sim.world_mut()
            .spawn(EntityKind::Rock, EntityData::at(CellPos::new(6, 6)))
            .expect("rock");
        for _ in 0..9 {
            sim.step();
        }
        let written = sim.save_snapshot(&path).expect("save");
        assert_eq!(written, sim.state_byte_size());

        let mut restored = seeded_sim(5);
        restored.load_snapshot(&path).expect("load");
        assert_eq!(restored.world().tick(), Tick(9));
        assert_eq!(restored.world().snapshot(), sim.world().snapshot());

        let err = restored.load_snapshot(&dir.path().join("missing.gwsn"));
        assert!(matches!(err, Err(HostError::Io(_))));
    }

    struct FirstAgentLeaves;

    impl EmigrationPolicy for FirstAgentLeaves {
        fn select(&mut self, store: &EntityStore, _tick: Tick) -> Option<(EntityKind, EntityId)> {
            store
                .arena(EntityKind::MobileAgent)
                .iter()
                .next()
                .map(|(id, _)| (EntityKind::MobileAgent, id))
        }
    }

    #[test]
    fn relay_moves_an_emigrant_between_simulations() {
        let mut source = seeded_sim(6);
        let mut dest = seeded_sim(7);
        source
            .world_mut()
            .spawn(
                EntityKind::MobileAgent,
                EntityData::facing(CellPos::new(5, 5), Direction::East),
            )
            .expect("agent");
        source.world_mut().set_emigration(Box::new(FirstAgentLeaves));

        assert!(!relay_emigrant(&mut source, &mut dest), "nothing pending yet");
        source.step();
        assert!(source.pending_transfer_out_size() > 0);
        assert!(relay_emigrant(&mut source, &mut dest));
        assert_eq!(source.pending_transfer_out_size(), 0);
        assert_eq!(source.world().entity_count(EntityKind::MobileAgent), 0);
        assert_eq!(dest.world().entity_count(EntityKind::MobileAgent), 1);
    }

    #[test]
    fn coprocessor_attach_falls_back_to_the_default_rule() {
        let registry = CoProcessorRegistry::new();
        let config = WorldConfig {
            rng_seed: Some(8),
            ..WorldConfig::default()
        };
        // Key 0 is not registered; the simulation must still come up.
        let sim = Simulation::with_coprocessor(config.clone(), &registry, 0).expect("simulation");
        assert_eq!(sim.world().policy_name(), "forward-or-rotate");

        let mut registry = registry;
        let key = register_wander(&mut registry);
        let sim = Simulation::with_coprocessor(config, &registry, key).expect("simulation");
        assert_eq!(sim.world().policy_name(), "co-processor");
    }

    #[test]
    fn status_reflects_the_world() {
        let mut sim = seeded_sim(9);
        sim.world_mut()
            .spawn(
                EntityKind::MobileAgent,
                EntityData::facing(CellPos::new(2, 2), Direction::West),
            )
            .expect("agent");
        sim.world_mut()
            .spawn(EntityKind::Resource, EntityData::at(CellPos::new(4, 4)))
            .expect("resource");
        sim.start();
        sim.step();

        let status = SimulationStatus::from(&sim);
        assert_eq!(status.tick, 1);
        assert!(status.running);
        assert_eq!(status.agents, 1);
        assert_eq!(status.resources, 1);
        assert_eq!(status.width, 12);
        assert_eq!(status.policy, "forward-or-rotate");
        assert!(!status.pending_transfer_out);

        let json = serde_json::to_string(&status).expect("serialize");
        assert!(json.contains("\"tick\":1"));
    }
}
