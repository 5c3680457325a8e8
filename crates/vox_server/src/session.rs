//! Match session: player slots and per-tick bundle assembly.
//!
//! The session is the synchronous heart of the relay: submissions queue
//! up between ticks, and [`MatchSession::seal_tick`] turns them into the
//! next [`CommandsBundle`]. Bundles are sealed for every tick, including
//! empty ones - clients need the gap-free stream to advance their
//! schedulers.

use std::collections::BTreeMap;

use vox_core::command::{Command, CommandsBundle, PlayerCommands, Tick};
use vox_core::world::PlayerId;

use crate::{ServerConfig, ServerError};

/// One connected player slot.
#[derive(Debug, Clone)]
pub struct PlayerSlot {
    /// Slot index.
    pub player: PlayerId,
    /// Display name from the join message.
    pub name: String,
    /// Whether the slot is still connected.
    pub connected: bool,
}

/// Collects submissions and seals them into per-tick bundles.
#[derive(Debug)]
pub struct MatchSession {
    config: ServerConfig,
    slots: Vec<PlayerSlot>,
    /// Commands queued since the last sealed tick, per player.
    queued: BTreeMap<PlayerId, Vec<Command>>,
    tick: Tick,
    completed: bool,
}

impl MatchSession {
    /// Create an empty session.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            slots: Vec::new(),
            queued: BTreeMap::new(),
            tick: 0,
            completed: false,
        }
    }

    /// Next tick to be sealed.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Connected player count.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.slots.iter().filter(|s| s.connected).count()
    }

    /// Join a new player, returning the assigned slot index.
    pub fn join(&mut self, name: impl Into<String>) -> Result<PlayerId, ServerError> {
        if self.slots.len() >= usize::from(self.config.max_players) {
            return Err(ServerError::MatchFull(self.config.max_players));
        }
        let player = self.slots.len() as PlayerId;
        self.slots.push(PlayerSlot {
            player,
            name: name.into(),
            connected: true,
        });
        tracing::info!(player, "player joined");
        Ok(player)
    }

    /// Mark a player disconnected. Its queued commands are kept: they
    /// were validly submitted, and the simulation keeps advancing.
    pub fn leave(&mut self, player: PlayerId) {
        if let Some(slot) = self.slots.get_mut(usize::from(player)) {
            slot.connected = false;
            tracing::info!(player, "player left");
        }
    }

    /// Queue a command for the next tick.
    pub fn queue_command(&mut self, player: PlayerId, command: Command) -> Result<(), ServerError> {
        if usize::from(player) >= self.slots.len() {
            return Err(ServerError::Config(format!("unknown player {player}")));
        }
        self.queued.entry(player).or_default().push(command);
        Ok(())
    }

    /// Mark the match finished; the next sealed bundle carries the flag.
    pub fn complete(&mut self) {
        self.completed = true;
    }

    /// Whether the match has been marked finished.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completed
    }

    /// Seal the current tick: drain every queued submission into one
    /// bundle, in player-index order, and advance the tick counter.
    pub fn seal_tick(&mut self) -> CommandsBundle {
        let mut bundle = CommandsBundle::new(self.tick);
        for slot in &self.slots {
            let commands = self.queued.remove(&slot.player).unwrap_or_default();
            bundle.player_commands.push(PlayerCommands {
                player: slot.player,
                commands,
            });
        }
        bundle.game_completed = self.completed;
        self.tick += 1;
        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_core::command::CommandKind;

    fn session() -> MatchSession {
        MatchSession::new(ServerConfig {
            max_players: 2,
            ..ServerConfig::default()
        })
    }

    #[test]
    fn test_join_assigns_slots_in_order() {
        let mut session = session();
        assert_eq!(session.join("alpha").unwrap(), 0);
        assert_eq!(session.join("beta").unwrap(), 1);
        assert!(matches!(
            session.join("gamma"),
            Err(ServerError::MatchFull(2))
        ));
    }

    #[test]
    fn test_seal_produces_gap_free_tick_stream() {
        let mut session = session();
        session.join("alpha").unwrap();

        let first = session.seal_tick();
        let second = session.seal_tick();
        assert_eq!(first.tick, 0);
        assert_eq!(second.tick, 1);
        // Empty ticks still produce per-player entries.
        assert_eq!(first.player_commands.len(), 1);
        assert!(first.player_commands[0].commands.is_empty());
    }

    #[test]
    fn test_queued_commands_ride_the_next_bundle_only() {
        let mut session = session();
        let alpha = session.join("alpha").unwrap();
        let beta = session.join("beta").unwrap();

        session
            .queue_command(beta, Command::new(2, CommandKind::Grow))
            .unwrap();
        session
            .queue_command(alpha, Command::new(1, CommandKind::Nop))
            .unwrap();

        let bundle = session.seal_tick();
        // Player-index order regardless of submission order.
        assert_eq!(bundle.player_commands[0].player, alpha);
        assert_eq!(bundle.player_commands[0].commands.len(), 1);
        assert_eq!(bundle.player_commands[1].player, beta);
        assert_eq!(bundle.player_commands[1].commands.len(), 1);

        let next = session.seal_tick();
        assert!(next.is_empty());
    }

    #[test]
    fn test_unknown_player_submission_is_rejected() {
        let mut session = session();
        assert!(session
            .queue_command(5, Command::new(1, CommandKind::Nop))
            .is_err());
    }

    #[test]
    fn test_disconnect_keeps_simulation_running() {
        let mut session = session();
        let alpha = session.join("alpha").unwrap();
        session.leave(alpha);
        assert_eq!(session.player_count(), 0);
        // The stream keeps flowing and still carries the slot.
        let bundle = session.seal_tick();
        assert_eq!(bundle.player_commands.len(), 1);
    }

    #[test]
    fn test_completion_flag_on_final_bundle() {
        let mut session = session();
        session.join("alpha").unwrap();
        session.complete();
        assert!(session.seal_tick().game_completed);
    }
}
