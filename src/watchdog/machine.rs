//! Watchdog transition table.
//!
//! Pure: every input carries its own `now`, and the result says what the
//! runtime should do next. Nothing here sleeps, spawns or touches a process.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use super::policy::CrashPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WatchdogState {
    Offline { fatal: bool },
    Launching,
    Online,
    /// Online, with failed probes still below the threshold.
    Degraded { failures: u32 },
    Restarting { attempt: u32 },
    Stopping,
}

impl WatchdogState {
    pub fn is_running(&self) -> bool {
        matches!(self, WatchdogState::Online | WatchdogState::Degraded { .. })
    }
}

impl fmt::Display for WatchdogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchdogState::Offline { fatal: false } => write!(f, "offline"),
            WatchdogState::Offline { fatal: true } => write!(f, "offline (fatal)"),
            WatchdogState::Launching => write!(f, "launching"),
            WatchdogState::Online => write!(f, "online"),
            WatchdogState::Degraded { failures } => write!(f, "degraded ({} failed probes)", failures),
            WatchdogState::Restarting { attempt } => write!(f, "restarting (attempt {})", attempt),
            WatchdogState::Stopping => write!(f, "stopping"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Launched,
    LaunchFailed,
    ProbeSucceeded,
    ProbeFailed,
    ProcessExited,
    RestartSucceeded,
    RestartFailed,
    /// A staged session was promoted; the new active one starts with a clean slate.
    Swapped,
    Stop,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// A session just became active; watch it.
    Monitor,
    /// Discard the dead session and launch a replacement after `delay`.
    Restart { delay: Duration },
    /// Restart budget exhausted: tear everything down and alert.
    GiveUp,
    /// Run the shutdown sequence.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub from: WatchdogState,
    pub to: WatchdogState,
    pub action: Action,
    /// The step detected a crash (fatal or not).
    pub crashed: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{trigger:?} is not valid while {state}")]
pub struct TransitionError {
    pub state: WatchdogState,
    pub trigger: Trigger,
}

#[derive(Debug, Clone)]
pub struct Machine {
    state: WatchdogState,
    policy: CrashPolicy,
    consecutive_failures: u32,
    failed_restarts: u32,
    restarts: VecDeque<Instant>,
}

impl Machine {
    pub fn new(policy: CrashPolicy) -> Self {
        Self {
            state: WatchdogState::Offline { fatal: false },
            policy,
            consecutive_failures: 0,
            failed_restarts: 0,
            restarts: VecDeque::new(),
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    pub fn policy(&self) -> &CrashPolicy {
        &self.policy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Restart attempts still inside the rolling window as of `now`.
    pub fn restarts_in_window(&self, now: Instant) -> usize {
        self.restarts
            .iter()
            .filter(|at| now.saturating_duration_since(**at) < self.policy.restart_window)
            .count()
    }

    pub fn fire(&mut self, trigger: Trigger, now: Instant) -> Result<Step, TransitionError> {
        use Trigger as T;
        use WatchdogState as S;

        let from = self.state;
        let (to, action, crashed) = match (from, trigger) {
            (S::Offline { .. }, T::Start) => {
                // An explicit start is operator intervention: forget old history.
                self.consecutive_failures = 0;
                self.failed_restarts = 0;
                self.restarts.clear();
                (S::Launching, Action::None, false)
            }
            (S::Launching, T::Launched) => (S::Online, Action::Monitor, false),
            (S::Launching, T::LaunchFailed) => (S::Offline { fatal: false }, Action::None, false),

            (S::Online | S::Degraded { .. }, T::ProbeSucceeded | T::Swapped) => {
                self.consecutive_failures = 0;
                (S::Online, Action::None, false)
            }
            (S::Online | S::Degraded { .. }, T::ProbeFailed) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.policy.failure_threshold {
                    self.crash(now)
                } else {
                    (
                        S::Degraded {
                            failures: self.consecutive_failures,
                        },
                        Action::None,
                        false,
                    )
                }
            }
            (S::Online | S::Degraded { .. }, T::ProcessExited) => self.crash(now),

            (S::Restarting { .. }, T::RestartSucceeded) => {
                self.consecutive_failures = 0;
                self.failed_restarts = 0;
                (S::Online, Action::Monitor, false)
            }
            (S::Restarting { .. }, T::RestartFailed) => {
                self.failed_restarts += 1;
                self.crash(now)
            }
            // The episode is already being handled.
            (S::Restarting { .. }, T::ProbeSucceeded | T::ProbeFailed | T::ProcessExited) => {
                (from, Action::None, false)
            }

            (S::Launching | S::Online | S::Degraded { .. } | S::Restarting { .. }, T::Stop) => {
                (S::Stopping, Action::Shutdown, false)
            }
            (S::Stopping, T::Stopped) => {
                self.consecutive_failures = 0;
                (S::Offline { fatal: false }, Action::None, false)
            }
            (S::Stopping, T::Stop) | (S::Offline { .. }, T::Stop | T::Stopped) => {
                (from, Action::None, false)
            }
            // Late results from work that was in flight when we stopped.
            (
                S::Stopping | S::Offline { .. },
                T::ProbeSucceeded
                | T::ProbeFailed
                | T::ProcessExited
                | T::Launched
                | T::LaunchFailed
                | T::RestartSucceeded
                | T::RestartFailed,
            ) => (from, Action::None, false),

            (state, trigger) => return Err(TransitionError { state, trigger }),
        };

        self.state = to;
        Ok(Step {
            from,
            to,
            action,
            crashed,
        })
    }

    /// Crash handling: either schedule a restart or give up when the
    /// rolling window already holds `restart_ceiling` attempts.
    fn crash(&mut self, now: Instant) -> (WatchdogState, Action, bool) {
        while let Some(oldest) = self.restarts.front() {
            if now.saturating_duration_since(*oldest) >= self.policy.restart_window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        if self.restarts.len() as u32 >= self.policy.restart_ceiling {
            return (WatchdogState::Offline { fatal: true }, Action::GiveUp, true);
        }

        self.restarts.push_back(now);
        let delay = if self.failed_restarts == 0 {
            Duration::ZERO
        } else {
            self.policy.backoff_delay(self.failed_restarts)
        };
        (
            WatchdogState::Restarting {
                attempt: self.restarts.len() as u32,
            },
            Action::Restart { delay },
            true,
        )
    }
}
