//! Baseline co-processor backends for gridworld agents.
//!
//! Both backends speak the fixed-frame byte protocol negotiated at attach
//! time: a 9-byte input frame (heading index, then per-direction open flags),
//! an opaque state frame owned by the engine, and a 1-byte action frame.

use gridworld_core::{
    COPROC_INPUT_LEN, COPROC_OUTPUT_LEN, CoProcessor, CoProcessorError, CoProcessorRegistry,
};
use rand::RngCore;

// Knuth's MMIX multiplier/increment.
const LCG_MUL: u64 = 6364136223846793005;
const LCG_ADD: u64 = 1442695040888963407;

const ACTION_HOLD: u8 = 0;
const ACTION_ADVANCE: u8 = 1;
const ACTION_TURN_CW: u8 = 2;
const ACTION_TURN_CCW: u8 = 3;

/// Stateless backend that emits one fixed action code every cycle.
///
/// Useful as a probe when wiring up hosts: the world's reaction to a known,
/// constant decision is easy to predict.
#[derive(Debug, Clone, Copy)]
pub struct FixedProcessor {
    code: u8,
}

impl FixedProcessor {
    /// Backend identifier used in registries and logs.
    pub const KIND: &'static str = "fixed.action";

    /// Backend that always holds position.
    #[must_use]
    pub const fn hold() -> Self {
        Self { code: ACTION_HOLD }
    }

    /// Backend that always advances.
    #[must_use]
    pub const fn advance() -> Self {
        Self {
            code: ACTION_ADVANCE,
        }
    }

    /// Backend that always turns clockwise.
    #[must_use]
    pub const fn turn_cw() -> Self {
        Self {
            code: ACTION_TURN_CW,
        }
    }
}

impl CoProcessor for FixedProcessor {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn input_len(&self) -> usize {
        COPROC_INPUT_LEN
    }

    fn state_len(&self) -> usize {
        0
    }

    fn output_len(&self) -> usize {
        COPROC_OUTPUT_LEN
    }

    fn load_state(&mut self, frame: &[u8]) -> Result<(), CoProcessorError> {
        if !frame.is_empty() {
            return Err(CoProcessorError::FrameLength {
                expected: 0,
                actual: frame.len(),
            });
        }
        Ok(())
    }

    fn store_state(&self, _frame: &mut [u8]) -> Result<usize, CoProcessorError> {
        Ok(0)
    }

    fn write_input(&mut self, frame: &[u8]) -> Result<(), CoProcessorError> {
        if frame.len() != COPROC_INPUT_LEN {
            return Err(CoProcessorError::FrameLength {
                expected: COPROC_INPUT_LEN,
                actual: frame.len(),
            });
        }
        Ok(())
    }

    fn cycle(&mut self) -> Result<(), CoProcessorError> {
        Ok(())
    }

    fn read_output(&self, frame: &mut [u8]) -> Result<usize, CoProcessorError> {
        let Some(slot) = frame.first_mut() else {
            return Err(CoProcessorError::FrameLength {
                expected: COPROC_OUTPUT_LEN,
                actual: 0,
            });
        };
        *slot = self.code;
        Ok(COPROC_OUTPUT_LEN)
    }
}

/// Deterministic roaming backend driven by an 8-byte linear congruential
/// state frame.
///
/// Blocked agents always turn; open agents advance, with an occasional
/// course change so walks do not trace the perimeter forever. The input
/// frame is folded into the state each cycle, so agents in different
/// surroundings follow different streams even though every state frame
/// starts zeroed.
#[derive(Debug, Clone)]
pub struct WanderProcessor {
    state: u64,
    input: [u8; COPROC_INPUT_LEN],
    output: u8,
}

impl WanderProcessor {
    /// Backend identifier used in registries and logs.
    pub const KIND: &'static str = "wander.lcg";

    /// Construct a backend; per-agent streams come from engine state frames,
    /// so construction takes no seed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: 0,
            input: [0; COPROC_INPUT_LEN],
            output: ACTION_HOLD,
        }
    }

    fn fold_input(&self) -> u64 {
        let mut mixed = self.state;
        for byte in self.input {
            mixed = mixed.rotate_left(8) ^ u64::from(byte);
        }
        mixed
    }
}

impl Default for WanderProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl CoProcessor for WanderProcessor {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn input_len(&self) -> usize {
        COPROC_INPUT_LEN
    }

    fn state_len(&self) -> usize {
        8
    }

    fn output_len(&self) -> usize {
        COPROC_OUTPUT_LEN
    }

    fn load_state(&mut self, frame: &[u8]) -> Result<(), CoProcessorError> {
        let Ok(bytes) = <[u8; 8]>::try_from(frame) else {
            return Err(CoProcessorError::FrameLength {
                expected: 8,
                actual: frame.len(),
            });
        };
        self.state = u64::from_le_bytes(bytes);
        Ok(())
    }

    fn store_state(&self, frame: &mut [u8]) -> Result<usize, CoProcessorError> {
        let Some(slot) = frame.get_mut(..8) else {
            return Err(CoProcessorError::FrameLength {
                expected: 8,
                actual: frame.len(),
            });
        };
        slot.copy_from_slice(&self.state.to_le_bytes());
        Ok(8)
    }

    fn write_input(&mut self, frame: &[u8]) -> Result<(), CoProcessorError> {
        let Ok(bytes) = <[u8; COPROC_INPUT_LEN]>::try_from(frame) else {
            return Err(CoProcessorError::FrameLength {
                expected: COPROC_INPUT_LEN,
                actual: frame.len(),
            });
        };
        self.input = bytes;
        Ok(())
    }

    fn cycle(&mut self) -> Result<(), CoProcessorError> {
        self.state = self
            .fold_input()
            .wrapping_mul(LCG_MUL)
            .wrapping_add(LCG_ADD);
        let heading = self.input[0] as usize;
        let forward_open = self
            .input
            .get(1 + heading)
            .is_some_and(|flag| *flag != 0);
        let turn = if self.state & (1 << 32) == 0 {
            ACTION_TURN_CCW
        } else {
            ACTION_TURN_CW
        };
        self.output = if !forward_open {
            turn
        } else if self.state >> 59 == 0 {
            // Roughly one voluntary course change every 32 open cycles.
            turn
        } else {
            ACTION_ADVANCE
        };
        Ok(())
    }

    fn read_output(&self, frame: &mut [u8]) -> Result<usize, CoProcessorError> {
        let Some(slot) = frame.first_mut() else {
            return Err(CoProcessorError::FrameLength {
                expected: COPROC_OUTPUT_LEN,
                actual: 0,
            });
        };
        *slot = self.output;
        Ok(COPROC_OUTPUT_LEN)
    }
}

/// Register a [`FixedProcessor`] factory, returning its registry key.
pub fn register_fixed(registry: &mut CoProcessorRegistry, backend: FixedProcessor) -> u64 {
    registry.register(FixedProcessor::KIND, move |_rng: &mut dyn RngCore| {
        Ok(Box::new(backend) as Box<dyn CoProcessor>)
    })
}

/// Register a [`WanderProcessor`] factory, returning its registry key.
pub fn register_wander(registry: &mut CoProcessorRegistry) -> u64 {
    registry.register(WanderProcessor::KIND, |_rng: &mut dyn RngCore| {
        Ok(Box::new(WanderProcessor::new()) as Box<dyn CoProcessor>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridworld_core::{
        CellPos, CoProcessorPolicy, Direction, EntityData, EntityKind, WorldConfig, WorldState,
    };
    use rand::{SeedableRng, rngs::SmallRng};

    fn open_frame(heading: u8) -> [u8; COPROC_INPUT_LEN] {
        let mut frame = [1u8; COPROC_INPUT_LEN];
        frame[0] = heading;
        frame
    }

    fn blocked_frame(heading: u8) -> [u8; COPROC_INPUT_LEN] {
        let mut frame = open_frame(heading);
        frame[1 + heading as usize] = 0;
        frame
    }

    fn run_cycle(processor: &mut WanderProcessor, state: &mut [u8; 8], input: &[u8]) -> u8 {
        processor.load_state(state).expect("load");
        processor.write_input(input).expect("input");
        processor.cycle().expect("cycle");
        let mut output = [0u8; COPROC_OUTPUT_LEN];
        assert_eq!(processor.read_output(&mut output).expect("output"), 1);
        assert_eq!(processor.store_state(state).expect("store"), 8);
        output[0]
    }

    #[test]
    fn fixed_backend_reports_negotiated_frame_lengths() {
        let backend = FixedProcessor::advance();
        assert_eq!(backend.input_len(), COPROC_INPUT_LEN);
        assert_eq!(backend.state_len(), 0);
        assert_eq!(backend.output_len(), COPROC_OUTPUT_LEN);

        let mut backend = backend;
        assert!(backend.load_state(&[]).is_ok());
        assert!(matches!(
            backend.load_state(&[1]),
            Err(CoProcessorError::FrameLength { .. })
        ));
        assert!(matches!(
            backend.write_input(&[0; 4]),
            Err(CoProcessorError::FrameLength { .. })
        ));
    }

    #[test]
    fn fixed_backend_always_emits_its_code() {
        let mut backend = FixedProcessor::turn_cw();
        let mut output = [0u8; COPROC_OUTPUT_LEN];
        for heading in 0..8 {
            backend.write_input(&open_frame(heading)).expect("input");
            backend.cycle().expect("cycle");
            backend.read_output(&mut output).expect("output");
            assert_eq!(output[0], ACTION_TURN_CW);
        }
    }

    #[test]
    fn wander_streams_are_deterministic() {
        let mut left = WanderProcessor::new();
        let mut right = WanderProcessor::new();
        let mut state_left = [0u8; 8];
        let mut state_right = [0u8; 8];

        for cycle in 0..64 {
            let input = open_frame((cycle % 8) as u8);
            let a = run_cycle(&mut left, &mut state_left, &input);
            let b = run_cycle(&mut right, &mut state_right, &input);
            assert_eq!(a, b, "streams diverged at cycle {cycle}");
        }
        assert_eq!(state_left, state_right);
        assert_ne!(state_left, [0u8; 8], "state frame must evolve");
    }

    #[test]
    fn wander_turns_whenever_forward_is_blocked() {
        let mut backend = WanderProcessor::new();
        let mut state = [0u8; 8];
        for cycle in 0..32 {
            let action = run_cycle(&mut backend, &mut state, &blocked_frame((cycle % 8) as u8));
            assert!(
                action == ACTION_TURN_CW || action == ACTION_TURN_CCW,
                "blocked cycle {cycle} produced {action}"
            );
        }
    }

    #[test]
    fn wander_mostly_advances_on_open_ground() {
        let mut backend = WanderProcessor::new();
        let mut state = [0u8; 8];
        let mut advances = 0;
        for _ in 0..64 {
            if run_cycle(&mut backend, &mut state, &open_frame(0)) == ACTION_ADVANCE {
                advances += 1;
            }
        }
        assert!(advances > 48, "only {advances} advances in 64 open cycles");
    }

    #[test]
    fn surroundings_split_otherwise_identical_streams() {
        let mut north = WanderProcessor::new();
        let mut south = WanderProcessor::new();
        let mut state_north = [0u8; 8];
        let mut state_south = [0u8; 8];
        run_cycle(&mut north, &mut state_north, &open_frame(2));
        run_cycle(&mut south, &mut state_south, &open_frame(6));
        assert_ne!(state_north, state_south);
    }

    #[test]
    fn hold_backend_pins_agents_through_the_policy() {
        let mut registry = CoProcessorRegistry::new();
        let key = register_fixed(&mut registry, FixedProcessor::hold());
        let mut rng = SmallRng::seed_from_u64(0);
        let policy = CoProcessorPolicy::attach(&registry, &mut rng, key).expect("attach");
        assert_eq!(policy.backend_kind(), FixedProcessor::KIND);

        let config = WorldConfig {
            rng_seed: Some(9),
            ..WorldConfig::default()
        };
        let mut world = WorldState::with_policy(config, Box::new(policy)).expect("world");
        let id = world
            .spawn(
                EntityKind::MobileAgent,
                EntityData::facing(CellPos::new(5, 5), Direction::East),
            )
            .expect("agent");

        for _ in 0..10 {
            let report = world.step();
            assert_eq!(report.held, 1);
            assert_eq!(report.coproc_fallbacks, 0);
        }
        let data = world.entity(EntityKind::MobileAgent, id).expect("agent");
        assert_eq!(data.position, CellPos::new(5, 5));
        assert_eq!(data.heading, Direction::East);
    }

    #[test]
    fn wander_backend_roams_without_fallbacks() {
        let mut registry = CoProcessorRegistry::new();
        let key = register_wander(&mut registry);
        let mut rng = SmallRng::seed_from_u64(7);
        let policy = CoProcessorPolicy::attach(&registry, &mut rng, key).expect("attach");

        let config = WorldConfig {
            width: 12,
            height: 12,
            rng_seed: Some(7),
            ..WorldConfig::default()
        };
        let mut world = WorldState::with_policy(config, Box::new(policy)).expect("world");
        for x in [2u32, 6, 9] {
            world
                .spawn(
                    EntityKind::MobileAgent,
                    EntityData::facing(CellPos::new(x, 6), Direction::North),
                )
                .expect("agent");
        }

        let mut moved = 0;
        for _ in 0..50 {
            let report = world.step();
            assert_eq!(report.coproc_fallbacks, 0);
            moved += report.moved;
        }
        assert!(moved > 0, "wandering agents never moved");
        for (_, data) in world.store().arena(EntityKind::MobileAgent).iter() {
            assert!(world.grid().in_bounds(data.position));
        }
    }
}
