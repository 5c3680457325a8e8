//! Determinism testing utilities.
//!
//! Provides a harness for verifying that the match simulation produces
//! identical results given identical inputs.
//!
//! # Testing Strategy
//!
//! Lockstep multiplayer requires the simulation to be 100% deterministic.
//! Sources of non-determinism include:
//!
//! - **HashMap iteration order**: Rust's default hasher is randomized.
//!   The core only iterates ordered containers (`Vec`, `BTreeMap`).
//!
//! - **Floating-point math**: the core uses integer arithmetic
//!   exclusively, so there is nothing to drift.
//!
//! - **System randomness**: no `rand()` anywhere in the core.
//!
//! # Test Levels
//!
//! 1. **Unit tests**: individual subsystem determinism
//! 2. **Property tests**: random inputs must still produce deterministic
//!    outputs
//! 3. **Integration tests**: full match scenarios are reproducible
//! 4. **Parallel tests**: N simulations run in parallel all match

use std::thread;

use vox_core::engine::MatchEngine;

use crate::fixtures::GridWorld;

/// Result of a determinism test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismResult {
    /// Whether all runs produced identical results.
    pub is_deterministic: bool,
    /// Hashes from each run.
    pub hashes: Vec<u64>,
    /// Number of ticks simulated.
    pub ticks: u64,
}

impl DeterminismResult {
    /// Get all unique hashes (should be 1 for a deterministic run).
    #[must_use]
    pub fn unique_hashes(&self) -> Vec<u64> {
        let mut unique: Vec<u64> = self.hashes.clone();
        unique.sort_unstable();
        unique.dedup();
        unique
    }

    /// Assert that the simulation was deterministic, with a detailed
    /// error message.
    ///
    /// # Panics
    ///
    /// Panics if the runs produced different hashes.
    pub fn assert_deterministic(&self) {
        if !self.is_deterministic {
            let unique = self.unique_hashes();
            panic!(
                "Simulation is non-deterministic!\n\
                 Runs: {}\n\
                 Ticks: {}\n\
                 Unique hashes: {} (expected 1)\n\
                 All hashes: {:?}",
                self.hashes.len(),
                self.ticks,
                unique.len(),
                self.hashes
            );
        }
    }
}

/// Run a simulation multiple times and verify determinism.
///
/// # Arguments
///
/// * `runs` - Number of times to run the simulation
/// * `ticks` - Number of ticks to simulate per run
/// * `setup` - Function to create initial state
/// * `step` - Function to advance the state by one tick
/// * `hash` - Function to compute the state hash
pub fn verify_determinism<S, Setup, Step, HashFn>(
    runs: usize,
    ticks: u64,
    setup: Setup,
    step: Step,
    hash: HashFn,
) -> DeterminismResult
where
    Setup: Fn() -> S,
    Step: Fn(&mut S),
    HashFn: Fn(&S) -> u64,
{
    let mut hashes = Vec::with_capacity(runs);

    for _ in 0..runs {
        let mut state = setup();
        for _ in 0..ticks {
            step(&mut state);
        }
        hashes.push(hash(&state));
    }

    let is_deterministic = hashes.windows(2).all(|w| w[0] == w[1]);

    DeterminismResult {
        is_deterministic,
        hashes,
        ticks,
    }
}

/// Simplified determinism verification for a grid-world match engine.
///
/// Runs the setup twice and compares final state hashes.
pub fn verify_engine_determinism<F>(setup_fn: F, num_ticks: u64) -> bool
where
    F: Fn() -> MatchEngine<GridWorld>,
{
    verify_determinism(
        2,
        num_ticks,
        &setup_fn,
        |engine| {
            engine.tick();
        },
        MatchEngine::state_hash,
    )
    .is_deterministic
}

/// Compare two runs tick-by-tick and return the first diverging tick.
///
/// `None` means the runs never diverged.
pub fn find_first_divergence<F>(setup_fn: F, num_ticks: u64) -> Option<u64>
where
    F: Fn() -> MatchEngine<GridWorld>,
{
    let mut first = setup_fn();
    let mut second = setup_fn();

    if first.state_hash() != second.state_hash() {
        return Some(0);
    }

    for tick in 1..=num_ticks {
        first.tick();
        second.tick();
        if first.state_hash() != second.state_hash() {
            tracing::debug!(tick, "simulation runs diverged");
            return Some(tick);
        }
    }

    None
}

/// Verify that a snapshot round-trip preserves state exactly.
///
/// Critical for save/rejoin and network synchronization.
pub fn verify_snapshot_determinism<F>(setup_fn: F, num_ticks: u64) -> bool
where
    F: Fn() -> MatchEngine<GridWorld>,
{
    let mut engine = setup_fn();
    for _ in 0..num_ticks {
        engine.tick();
    }
    let hash_before = engine.state_hash();

    let Ok(bytes) = engine.serialize() else {
        return false;
    };
    let Ok(restored) = MatchEngine::<GridWorld>::deserialize(&bytes) else {
        return false;
    };

    hash_before == restored.state_hash()
}

/// Run N simulations in parallel and verify they all agree.
///
/// Catches non-determinism that only manifests under thread scheduling
/// variations and memory layout differences.
pub fn run_parallel_simulations<F>(setup_fn: F, num_sims: usize, num_ticks: u64) -> DeterminismResult
where
    F: Fn() -> MatchEngine<GridWorld> + Sync,
{
    let hashes = thread::scope(|s| {
        let handles: Vec<_> = (0..num_sims)
            .map(|_| {
                s.spawn(|| {
                    let mut engine = setup_fn();
                    for _ in 0..num_ticks {
                        engine.tick();
                    }
                    engine.state_hash()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("simulation thread panicked"))
            .collect::<Vec<u64>>()
    });

    let is_deterministic = hashes.windows(2).all(|w| w[0] == w[1]);
    DeterminismResult {
        is_deterministic,
        hashes,
        ticks: num_ticks,
    }
}

/// Proptest strategies for determinism testing.
///
/// These generate random but reproducible inputs for property-based
/// testing of simulation determinism.
pub mod strategies {
    use proptest::prelude::*;
    use vox_core::command::{Command, CommandKind};
    use vox_core::coord::{Coordinate, Direction};
    use vox_core::world::VoxelId;

    /// Generate a weight-0 coordinate inside a `size` x `size` grid.
    pub fn arb_coordinate(size: i32) -> impl Strategy<Value = Coordinate> {
        (0..size, 0..size).prop_map(|(row, col)| Coordinate::new(row, col, 0, 0))
    }

    /// Generate a unit-step-connected path starting at `start`.
    pub fn arb_path(start: Coordinate, max_len: usize) -> impl Strategy<Value = Vec<Coordinate>> {
        proptest::collection::vec(0usize..4, 1..max_len).prop_map(move |turns| {
            let mut path = vec![start];
            for turn in turns {
                let next = path
                    .last()
                    .expect("path never empty")
                    .step(Direction::SCAN_ORDER[turn]);
                path.push(next);
            }
            path
        })
    }

    /// Generate a movement command for `unit` starting at `start`.
    pub fn arb_move_command(
        unit: VoxelId,
        start: Coordinate,
    ) -> impl Strategy<Value = Command> {
        arb_path(start, 6).prop_map(move |path| Command::new(unit, CommandKind::Move { path }))
    }

    /// Generate a non-movement command for `unit`.
    pub fn arb_action_command(unit: VoxelId) -> impl Strategy<Value = Command> {
        prop_oneof![
            Just(Command::new(unit, CommandKind::Grow)),
            Just(Command::new(unit, CommandKind::Split)),
            Just(Command::new(unit, CommandKind::RotateLeft)),
            Just(Command::new(unit, CommandKind::RotateRight)),
            Just(Command::new(unit, CommandKind::Cancel)),
            Just(Command::new(unit, CommandKind::Nop)),
        ]
    }

    /// Generate health values.
    pub fn arb_health() -> impl Strategy<Value = u32> {
        1u32..200
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vox_core::command::{Command, CommandKind};
    use vox_core::coord::Coordinate;
    use vox_core::unit::Capabilities;

    fn coord(row: i32, col: i32) -> Coordinate {
        Coordinate::new(row, col, 0, 0)
    }

    fn setup_skirmish() -> MatchEngine<GridWorld> {
        let mut engine = MatchEngine::new(GridWorld::new(16, 16), 2);
        let a = engine
            .spawn_unit(0, coord(1, 1), 100, Capabilities::actor())
            .unwrap();
        let b = engine
            .spawn_unit(1, coord(12, 12), 80, Capabilities::actor())
            .unwrap();
        engine
            .submit_command(
                0,
                Command::new(
                    a,
                    CommandKind::Move {
                        path: vec![coord(1, 1), coord(1, 2), coord(1, 3), coord(2, 3)],
                    },
                ),
            )
            .unwrap();
        engine
            .submit_command(1, Command::new(b, CommandKind::Split))
            .unwrap();
        engine
    }

    #[test]
    fn test_verify_determinism_simple() {
        let result = verify_determinism(3, 100, || 0u64, |n| *n += 1, |n| *n);
        assert!(result.is_deterministic);
        assert_eq!(result.hashes, vec![100, 100, 100]);
    }

    #[test]
    fn test_empty_engine_determinism() {
        assert!(verify_engine_determinism(
            || MatchEngine::new(GridWorld::new(8, 8), 1),
            100
        ));
    }

    #[test]
    fn test_skirmish_determinism() {
        let result = verify_determinism(
            5,
            50,
            setup_skirmish,
            |engine| {
                engine.tick();
            },
            MatchEngine::state_hash,
        );
        result.assert_deterministic();
    }

    #[test]
    fn test_no_divergence_in_skirmish() {
        assert_eq!(find_first_divergence(setup_skirmish, 100), None);
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_state() {
        assert!(verify_snapshot_determinism(setup_skirmish, 25));
    }

    #[test]
    fn test_parallel_simulations_agree() {
        let result = run_parallel_simulations(setup_skirmish, 4, 50);
        result.assert_deterministic();
    }

    proptest! {
        /// Any random spawn position must simulate deterministically.
        #[test]
        fn prop_random_spawns_are_deterministic(
            row in 0i32..16,
            col in 0i32..16,
            health in strategies::arb_health(),
        ) {
            let setup = move || {
                let mut engine = MatchEngine::new(GridWorld::new(16, 16), 1);
                engine
                    .spawn_unit(0, Coordinate::new(row, col, 0, 0), health, Capabilities::actor())
                    .unwrap();
                engine
            };
            prop_assert!(verify_engine_determinism(setup, 30));
        }

        /// Random command scripts must replay identically.
        #[test]
        fn prop_command_scripts_are_replayable(
            commands in proptest::collection::vec(
                strategies::arb_action_command(1),
                0..8,
            ),
        ) {
            let commands_clone = commands.clone();
            let setup = move || {
                let mut engine = MatchEngine::new(GridWorld::new(16, 16), 1);
                engine
                    .spawn_unit(0, Coordinate::new(8, 8, 0, 0), 100, Capabilities::actor())
                    .unwrap();
                for command in &commands_clone {
                    let _ = engine.submit_command(0, command.clone());
                }
                engine
            };
            prop_assert!(verify_engine_determinism(setup, 50));
        }

        /// Snapshots taken mid-run must restore to the identical state.
        #[test]
        fn prop_snapshot_roundtrip_is_exact(num_ticks in 0u64..40) {
            prop_assert!(verify_snapshot_determinism(setup_skirmish, num_ticks));
        }
    }
}
