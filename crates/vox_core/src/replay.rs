//! Replay system for recording and playing back matches.
//!
//! A replay stores the initial match snapshot and the linear log of
//! `(tick, player, command)` triples submitted during the game. Replaying
//! means resubmitting each command to a fresh engine at the recorded
//! tick - the determinism of the core is exactly what makes this valid.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::command::{Command, Tick};
use crate::engine::MatchEngine;
use crate::error::{Result, SimError};
use crate::world::{PlayerId, WorldOracle};

/// A single command record for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayCommand {
    /// Simulation tick when the command was submitted.
    pub tick: Tick,
    /// The submitting player.
    pub player: PlayerId,
    /// The command that was submitted.
    pub command: Command,
}

impl ReplayCommand {
    /// Create a new replay command record.
    #[must_use]
    pub const fn new(tick: Tick, player: PlayerId, command: Command) -> Self {
        Self {
            tick,
            player,
            command,
        }
    }
}

/// Replay file format version for compatibility.
pub const REPLAY_VERSION: u32 = 1;

/// Complete replay data structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replay {
    /// Replay format version.
    pub version: u32,
    /// Scenario identifier or name.
    pub scenario_id: String,
    /// Serialized initial match state.
    pub initial_state: Vec<u8>,
    /// Stream of commands in tick order.
    pub commands: Vec<ReplayCommand>,
    /// Final tick when the game ended.
    pub final_tick: Tick,
    /// Final state hash for verification.
    pub final_hash: u64,
}

impl Replay {
    /// Create a replay from an engine's initial state.
    pub fn new<W>(scenario_id: impl Into<String>, initial: &MatchEngine<W>) -> Result<Self>
    where
        W: WorldOracle + Serialize,
    {
        Ok(Self {
            version: REPLAY_VERSION,
            scenario_id: scenario_id.into(),
            initial_state: initial.serialize()?,
            commands: Vec::new(),
            final_tick: 0,
            final_hash: 0,
        })
    }

    /// Record a command for replay.
    pub fn record_command(&mut self, tick: Tick, player: PlayerId, command: Command) {
        self.commands.push(ReplayCommand::new(tick, player, command));
    }

    /// Finalize the replay with end-game state.
    pub fn finalize(&mut self, final_tick: Tick, final_hash: u64) {
        self.final_tick = final_tick;
        self.final_hash = final_hash;
    }

    /// Save the replay to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| SimError::InvalidState(format!("failed to serialize replay: {e}")))?;
        std::fs::write(path.as_ref(), bytes)
            .map_err(|e| SimError::InvalidState(format!("failed to write replay file: {e}")))?;
        Ok(())
    }

    /// Load a replay from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())
            .map_err(|e| SimError::InvalidState(format!("failed to read replay file: {e}")))?;
        let replay: Self = bincode::deserialize(&bytes)
            .map_err(|e| SimError::InvalidState(format!("failed to deserialize replay: {e}")))?;

        if replay.version != REPLAY_VERSION {
            return Err(SimError::InvalidState(format!(
                "replay version mismatch: expected {REPLAY_VERSION}, got {}",
                replay.version
            )));
        }

        Ok(replay)
    }

    /// Restore the initial match state for playback.
    pub fn restore_initial_state<W>(&self) -> Result<MatchEngine<W>>
    where
        W: WorldOracle + DeserializeOwned,
    {
        MatchEngine::deserialize(&self.initial_state)
    }

    /// Commands submitted on a specific tick.
    #[must_use]
    pub fn commands_at_tick(&self, tick: Tick) -> Vec<&ReplayCommand> {
        self.commands.iter().filter(|c| c.tick == tick).collect()
    }

    /// Total duration of the replay in ticks.
    #[must_use]
    pub const fn duration(&self) -> Tick {
        self.final_tick
    }

    /// Total number of recorded commands.
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }
}

/// Replay playback controller.
#[derive(Debug)]
pub struct ReplayPlayer<W: WorldOracle> {
    /// The replay being played.
    replay: Replay,
    /// Current match state.
    engine: MatchEngine<W>,
    /// Index into the command stream.
    command_index: usize,
}

impl<W> ReplayPlayer<W>
where
    W: WorldOracle + Serialize + DeserializeOwned,
{
    /// Create a player from a replay.
    pub fn new(replay: Replay) -> Result<Self> {
        let engine = replay.restore_initial_state()?;
        Ok(Self {
            replay,
            engine,
            command_index: 0,
        })
    }

    /// Advance the replay by one tick.
    ///
    /// Returns true if there are more ticks to play.
    pub fn advance(&mut self) -> bool {
        if self.engine.tick_count() >= self.replay.final_tick {
            return false;
        }

        // Resubmit every command recorded for the current tick.
        let now = self.engine.tick_count();
        while self.command_index < self.replay.commands.len() {
            let record = &self.replay.commands[self.command_index];
            if record.tick > now {
                break;
            }
            let _ = self
                .engine
                .submit_command(record.player, record.command.clone());
            self.command_index += 1;
        }

        self.engine.tick();
        self.engine.tick_count() < self.replay.final_tick
    }

    /// Seek to a specific tick by re-running from the initial state.
    pub fn seek(&mut self, target_tick: Tick) -> Result<()> {
        self.engine = self.replay.restore_initial_state()?;
        self.command_index = 0;
        while self.engine.tick_count() < target_tick
            && self.engine.tick_count() < self.replay.final_tick
        {
            self.advance();
        }
        Ok(())
    }

    /// Current playback tick.
    #[must_use]
    pub const fn current_tick(&self) -> Tick {
        self.engine.tick_count()
    }

    /// The current match state.
    #[must_use]
    pub const fn engine(&self) -> &MatchEngine<W> {
        &self.engine
    }

    /// The replay being played.
    #[must_use]
    pub const fn replay(&self) -> &Replay {
        &self.replay
    }

    /// Whether playback reached the end.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.engine.tick_count() >= self.replay.final_tick
    }

    /// Verify the replay reproduces the recorded final hash.
    pub fn verify(&mut self) -> Result<bool> {
        self.seek(self.replay.final_tick)?;
        Ok(self.engine.state_hash() == self.replay.final_hash)
    }
}
