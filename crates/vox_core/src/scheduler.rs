//! Client tick scheduler and bundle reconciliation.
//!
//! Keeps a client's logical tick aligned with the server-authoritative
//! bundle stream despite latency and jitter, without ever stalling the
//! local loop. The scheduler never drops a bundle: lateness surfaces as
//! a [`CommandStatus::HighPing`] stamp on the executed commands, not as
//! an abort.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::command::{CommandStatus, CommandsBundle, Tick};

/// Scheduler tuning knobs.
///
/// Both thresholds are configurable because the catch-up heuristic is
/// exactly that - a heuristic. See the convergence tests below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Assumed worst-case command latency, in ticks. A bundle arriving
    /// from further ahead than this forces the clock forward.
    pub max_ping: u64,
    /// Drift, in ticks, beyond which the clock free-runs forward one
    /// tick per step to catch up to a future bundle.
    pub catchup_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_ping: 10,
            catchup_threshold: 8,
        }
    }
}

/// Outcome of one [`TickScheduler::advance`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// No bundle was ready; the clock advanced speculatively.
    Idle,
    /// The clock is far behind the next bundle and advanced one extra
    /// step without executing anything.
    CatchUp,
    /// A bundle is due for execution.
    Execute {
        /// The dequeued bundle. If `late`, its commands are already
        /// stamped [`CommandStatus::HighPing`].
        bundle: CommandsBundle,
        /// Whether the bundle executed after its scheduled tick.
        late: bool,
    },
}

/// Aligns the local logical clock with the server bundle stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickScheduler {
    /// Current logical tick.
    tick: Tick,
    /// Received bundles, in arrival (= tick) order.
    queue: VecDeque<CommandsBundle>,
    /// Tuning knobs.
    config: SchedulerConfig,
}

impl TickScheduler {
    /// Create a scheduler starting at tick 0.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            tick: 0,
            queue: VecDeque::new(),
            config,
        }
    }

    /// Current logical tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Number of buffered bundles.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Buffer a received bundle.
    ///
    /// If the bundle's tick exceeds `tick + max_ping`, the measured
    /// latency was too optimistic: the clock jumps to
    /// `bundle.tick - max_ping` so catch-up drift stays bounded. The
    /// bundle is appended regardless.
    pub fn enqueue(&mut self, bundle: CommandsBundle) {
        if bundle.tick > self.tick + self.config.max_ping {
            let jumped = bundle.tick - self.config.max_ping;
            tracing::debug!(
                from = self.tick,
                to = jumped,
                bundle = bundle.tick,
                "tick clock jumped forward"
            );
            self.tick = jumped;
        }
        self.queue.push_back(bundle);
    }

    /// Advance the clock one fixed step, possibly yielding a bundle.
    ///
    /// Every enqueued bundle is eventually yielded exactly once, in tick
    /// order. A bundle whose tick has already passed is yielded
    /// immediately with its commands stamped `HighPing`.
    pub fn advance(&mut self) -> Advance {
        let Some(head_tick) = self.queue.front().map(|b| b.tick) else {
            self.tick += 1;
            return Advance::Idle;
        };

        if self.tick >= head_tick {
            let mut bundle = self.queue.pop_front().expect("peeked head");
            let late = self.tick > head_tick;
            if late {
                bundle.stamp_status(CommandStatus::HighPing);
            }
            self.tick += 1;
            return Advance::Execute { bundle, late };
        }

        // The head bundle is still in the future.
        self.tick += 1;
        if head_tick - (self.tick - 1) > self.config.catchup_threshold {
            Advance::CatchUp
        } else {
            Advance::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bundle(tick: Tick) -> CommandsBundle {
        CommandsBundle::new(tick)
    }

    fn drain_executed(scheduler: &mut TickScheduler, steps: usize) -> Vec<Tick> {
        let mut executed = Vec::new();
        for _ in 0..steps {
            if let Advance::Execute { bundle, .. } = scheduler.advance() {
                executed.push(bundle.tick);
            }
        }
        executed
    }

    #[test]
    fn test_empty_queue_advances_speculatively() {
        let mut scheduler = TickScheduler::new(SchedulerConfig::default());
        assert_eq!(scheduler.advance(), Advance::Idle);
        assert_eq!(scheduler.advance(), Advance::Idle);
        assert_eq!(scheduler.tick(), 2);
    }

    #[test]
    fn test_on_time_bundle_executes_at_its_tick() {
        let mut scheduler = TickScheduler::new(SchedulerConfig::default());
        scheduler.enqueue(bundle(2));

        assert_eq!(scheduler.advance(), Advance::Idle); // tick 0
        assert_eq!(scheduler.advance(), Advance::Idle); // tick 1
        match scheduler.advance() {
            Advance::Execute { bundle, late } => {
                assert_eq!(bundle.tick, 2);
                assert!(!late);
            }
            other => panic!("expected execution, got {other:?}"),
        }
        assert_eq!(scheduler.tick(), 3);
    }

    #[test]
    fn test_stale_bundle_executes_late_with_high_ping() {
        let mut scheduler = TickScheduler::new(SchedulerConfig::default());
        // Burn the clock past the bundle's tick first.
        for _ in 0..5 {
            scheduler.advance();
        }
        let mut stale = bundle(2);
        stale.player_commands.push(crate::command::PlayerCommands {
            player: 0,
            commands: vec![crate::command::Command::new(
                1,
                crate::command::CommandKind::Nop,
            )],
        });
        scheduler.enqueue(stale);

        match scheduler.advance() {
            Advance::Execute { bundle, late } => {
                assert!(late);
                assert_eq!(
                    bundle.player_commands[0].commands[0].status,
                    CommandStatus::HighPing
                );
            }
            other => panic!("expected late execution, got {other:?}"),
        }
    }

    #[test]
    fn test_lag_catchup_jump_rule() {
        // max_ping = 10: a bundle from tick 50 arriving at tick 0 jumps
        // the clock straight to 40.
        let mut scheduler = TickScheduler::new(SchedulerConfig {
            max_ping: 10,
            catchup_threshold: 8,
        });
        scheduler.enqueue(bundle(50));
        assert_eq!(scheduler.tick(), 40);

        // The remaining 10 ticks drain normally, then the bundle runs.
        let executed = drain_executed(&mut scheduler, 11);
        assert_eq!(executed, vec![50]);
        assert_eq!(scheduler.tick(), 51);
    }

    #[test]
    fn test_far_future_head_reports_catchup() {
        let mut scheduler = TickScheduler::new(SchedulerConfig {
            max_ping: 100,
            catchup_threshold: 8,
        });
        scheduler.enqueue(bundle(20));
        // 20 - 0 > 8: catch-up correction, one tick per step.
        assert_eq!(scheduler.advance(), Advance::CatchUp);
        assert_eq!(scheduler.tick(), 1);
        // Within threshold it degrades to a plain idle wait.
        for _ in 0..11 {
            scheduler.advance();
        }
        assert_eq!(scheduler.tick(), 12);
        assert_eq!(scheduler.advance(), Advance::Idle);
    }

    #[test]
    fn test_every_bundle_executes_exactly_once_in_order() {
        let mut scheduler = TickScheduler::new(SchedulerConfig::default());
        for tick in [3, 4, 7, 8] {
            scheduler.enqueue(bundle(tick));
        }
        let executed = drain_executed(&mut scheduler, 12);
        assert_eq!(executed, vec![3, 4, 7, 8]);
    }

    #[test]
    fn test_convergence_after_jitter_spike() {
        // A burst of bundles arriving all at once after a stall must all
        // execute, in order, and the clock must settle past the burst.
        let mut scheduler = TickScheduler::new(SchedulerConfig {
            max_ping: 4,
            catchup_threshold: 3,
        });
        for _ in 0..20 {
            scheduler.advance();
        }
        for tick in 5..15 {
            scheduler.enqueue(bundle(tick));
        }
        let executed = drain_executed(&mut scheduler, 10);
        assert_eq!(executed, (5..15).collect::<Vec<_>>());
        assert!(scheduler.tick() >= 30);
        assert_eq!(scheduler.pending(), 0);
    }

    proptest! {
        /// For any ordered bundle stream interleaved with any number of
        /// advance calls, the executed sequence is exactly the enqueued
        /// sequence: non-decreasing ticks, nothing dropped, nothing
        /// duplicated.
        #[test]
        fn prop_tick_monotonicity(
            gaps in proptest::collection::vec(0u64..6, 1..20),
            stalls in proptest::collection::vec(0usize..4, 1..20),
            max_ping in 1u64..20,
            catchup_threshold in 1u64..16,
        ) {
            let mut scheduler = TickScheduler::new(SchedulerConfig {
                max_ping,
                catchup_threshold,
            });

            // Build a strictly ordered stream from the gap list.
            let mut next_tick = 0u64;
            let mut stream = Vec::new();
            for gap in &gaps {
                next_tick += gap;
                stream.push(next_tick);
                next_tick += 1;
            }

            let mut executed = Vec::new();
            let mut stall_iter = stalls.iter().cycle();
            for &tick in &stream {
                scheduler.enqueue(bundle(tick));
                for _ in 0..*stall_iter.next().unwrap() {
                    if let Advance::Execute { bundle, .. } = scheduler.advance() {
                        executed.push(bundle.tick);
                    }
                }
            }
            // Drain whatever is left.
            while scheduler.pending() > 0 {
                if let Advance::Execute { bundle, .. } = scheduler.advance() {
                    executed.push(bundle.tick);
                }
            }

            prop_assert_eq!(executed, stream);
        }
    }
}
