//! # Vox Dedicated Server
//!
//! Headless dedicated server for multiplayer matches.
//!
//! The server is a lockstep relay: it collects every player's command
//! submissions, seals them into one [`CommandsBundle`] per tick, and
//! broadcasts the bundle stream back to all clients. Each client runs
//! the deterministic simulation locally; the server never needs to
//! render and only simulates when verifying state hashes.
//!
//! [`CommandsBundle`]: vox_core::command::CommandsBundle

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod codec;
pub mod network;
pub mod session;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,
    /// Maximum players per match.
    pub max_players: u8,
    /// Tick rate (must match the clients).
    pub tick_rate: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7777,
            max_players: 8,
            tick_rate: vox_core::command::TICK_RATE,
        }
    }
}

impl ServerConfig {
    /// Parse a configuration from RON text.
    pub fn from_ron(text: &str) -> Result<Self, ServerError> {
        ron::from_str(text).map_err(|e| ServerError::Config(e.to_string()))
    }
}

/// Server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire encoding/decoding failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// A frame exceeded the size limit.
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The match is full.
    #[error("match is full ({0} players)")]
    MatchFull(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_core_tick_rate() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_rate, vox_core::command::TICK_RATE);
        assert_eq!(config.port, 7777);
    }

    #[test]
    fn test_config_from_ron() {
        let config =
            ServerConfig::from_ron("(port: 9000, max_players: 4, tick_rate: 20)").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_players, 4);
        assert!(ServerConfig::from_ron("(port: \"oops\")").is_err());
    }
}
