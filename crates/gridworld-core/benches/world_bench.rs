use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use gridworld_core::{CellPos, Direction, EntityData, EntityKind, WorldConfig, WorldState};
use std::time::Duration;

fn bench_world_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_step");
    // Increase iteration time for more stable results and allow env overrides
    let samples: usize = std::env::var("GW_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30);
    let warm: u64 = std::env::var("GW_BENCH_WARMUP_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(2);
    let measure: u64 = std::env::var("GW_BENCH_MEASURE_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10);
    group.sample_size(samples);
    group.warm_up_time(Duration::from_secs(warm));
    group.measurement_time(Duration::from_secs(measure));
    // Steps per bench iteration (can override via GW_BENCH_STEPS)
    let steps: usize = std::env::var("GW_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64);
    let agents_list: Vec<u32> = std::env::var("GW_BENCH_AGENTS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<u32>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![500, 2000, 8000]);
    for &agents in &agents_list {
        group.bench_function(format!("steps{steps}_agents{agents}"), |b| {
            b.iter_batched(
                || {
                    let side = 256;
                    let config = WorldConfig {
                        width: side,
                        height: side,
                        rng_seed: Some(0xBEEF),
                        marker_decay_interval: 16,
                        ..WorldConfig::default()
                    };
                    let mut world = WorldState::new(config).expect("world");
                    // Deterministic scatter; collisions fall through harmlessly.
                    for seed in 0..agents {
                        let pos = CellPos::new(seed % side, (seed * 37) % side);
                        let heading = Direction::ALL[(seed % 8) as usize];
                        let _ = world.spawn(
                            EntityKind::MobileAgent,
                            EntityData::facing(pos, heading),
                        );
                    }
                    for seed in 0..agents / 8 {
                        let pos = CellPos::new((seed * 13) % side, (seed * 29) % side);
                        let _ = world.spawn(EntityKind::Rock, EntityData::at(pos));
                    }
                    world
                },
                |mut world| {
                    for _ in 0..steps {
                        world.step();
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_snapshot_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    group.sample_size(30);
    group.bench_function("encode_decode_4k_entities", |b| {
        let side = 128;
        let config = WorldConfig {
            width: side,
            height: side,
            rng_seed: Some(0xFEED),
            ..WorldConfig::default()
        };
        let mut world = WorldState::new(config).expect("world");
        for seed in 0..4096u32 {
            let pos = CellPos::new(seed % side, (seed / side) % side);
            let kind = EntityKind::ALL[(seed % 7) as usize];
            let _ = world.spawn(kind, EntityData::at(pos));
        }
        let needed = world.state_byte_size();
        let mut buffer = vec![0u8; needed];
        b.iter(|| {
            let written = world.get_state(&mut buffer);
            assert_eq!(written, needed);
            let mut restored = WorldState::new(WorldConfig::default()).expect("world");
            restored.set_state(&buffer).expect("set_state");
            restored.total_entities()
        });
    });
    group.finish();
}

criterion_group!(benches, bench_world_steps, bench_snapshot_round_trip);
criterion_main!(benches);
