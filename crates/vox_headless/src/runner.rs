//! Scenario execution and replay verification.

use serde::Serialize;

use vox_core::engine::MatchEngine;
use vox_core::replay::{Replay, ReplayPlayer};
use vox_core::world::VoxelId;
use vox_test_utils::fixtures::GridWorld;

use crate::scenario::Scenario;
use crate::HeadlessError;

/// Summary of a finished headless run, printed as JSON for CI.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Scenario name.
    pub scenario: String,
    /// Ticks simulated.
    pub ticks: u64,
    /// Final deterministic state hash.
    pub state_hash: u64,
    /// Live voxels at the end.
    pub voxels: usize,
    /// Commands recorded into the replay.
    pub commands: usize,
}

/// Runs one scenario to completion, optionally recording a replay.
#[derive(Debug)]
pub struct HeadlessRunner {
    engine: MatchEngine<GridWorld>,
    replay: Replay,
    /// Engine voxel id per scenario unit index, in spawn order.
    unit_ids: Vec<VoxelId>,
    scenario: Scenario,
}

impl HeadlessRunner {
    /// Build the initial world from a scenario.
    pub fn new(scenario: Scenario) -> Result<Self, HeadlessError> {
        let mut engine = MatchEngine::new(
            GridWorld::new(scenario.rows, scenario.cols),
            scenario.players,
        );
        let mut unit_ids = Vec::with_capacity(scenario.units.len());
        for unit in &scenario.units {
            let coord =
                vox_core::coord::Coordinate::new(unit.row, unit.col, 0, unit.weight);
            let id = engine.spawn_unit(
                unit.player,
                coord,
                unit.health,
                unit.variant.capabilities(),
            )?;
            unit_ids.push(id);
        }
        for asset in &scenario.assets {
            engine.spawn_asset(
                vox_core::coord::Coordinate::new(asset.row, asset.col, 0, 0),
                asset.health,
            )?;
        }
        let replay = Replay::new(scenario.name.clone(), &engine)?;
        Ok(Self {
            engine,
            replay,
            unit_ids,
            scenario,
        })
    }

    /// Run for `ticks` ticks, submitting the script at its recorded
    /// ticks, and return the summary.
    pub fn run(&mut self, ticks: u64) -> Result<RunSummary, HeadlessError> {
        for _ in 0..ticks {
            let now = self.engine.tick_count();
            for entry in &self.scenario.script {
                if entry.tick != now {
                    continue;
                }
                let Some(&unit) = self.unit_ids.get(entry.unit) else {
                    tracing::warn!(index = entry.unit, "script entry for unknown unit");
                    continue;
                };
                let spec = &self.scenario.units[entry.unit];
                let command = entry.action.to_command(unit, 0, spec.weight);
                self.replay.record_command(now, spec.player, command.clone());
                let status = self.engine.submit_command(spec.player, command)?;
                tracing::debug!(tick = now, unit, ?status, "script command submitted");
            }
            self.engine.tick();
        }

        let hash = self.engine.state_hash();
        self.replay.finalize(self.engine.tick_count(), hash);
        Ok(RunSummary {
            scenario: self.scenario.name.clone(),
            ticks: self.engine.tick_count(),
            state_hash: hash,
            voxels: self.engine.world().voxel_count(),
            commands: self.replay.command_count(),
        })
    }

    /// The recorded replay (valid after [`run`](Self::run)).
    #[must_use]
    pub const fn replay(&self) -> &Replay {
        &self.replay
    }

    /// The engine, for inspection.
    #[must_use]
    pub const fn engine(&self) -> &MatchEngine<GridWorld> {
        &self.engine
    }
}

/// Verify a replay file: re-run it and compare the final hash.
pub fn verify_replay(path: &std::path::Path) -> Result<bool, HeadlessError> {
    let replay = Replay::load(path)?;
    let mut player = ReplayPlayer::<GridWorld>::new(replay)?;
    Ok(player.verify()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_scenario_runs_and_hashes_stably() {
        let run = || {
            let mut runner = HeadlessRunner::new(Scenario::builtin_skirmish()).unwrap();
            runner.run(30).unwrap().state_hash
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_summary_reflects_script() {
        let mut runner = HeadlessRunner::new(Scenario::builtin_skirmish()).unwrap();
        let summary = runner.run(30).unwrap();
        assert_eq!(summary.ticks, 30);
        assert_eq!(summary.commands, 2);
        // The split sibling pair replaced the original: 2 spawned units
        // - 1 split + 2 siblings, and the food asset was eaten.
        assert_eq!(summary.voxels, 3);
    }

    #[test]
    fn test_recorded_replay_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.replay");

        let mut runner = HeadlessRunner::new(Scenario::builtin_skirmish()).unwrap();
        runner.run(30).unwrap();
        runner.replay().save(&path).unwrap();

        assert!(verify_replay(&path).unwrap());
    }
}
