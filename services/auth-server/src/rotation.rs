//! Scheduled signing key rotation
//!
//! Pure state machine: receives events, returns (new_state, action).
//! [`spawn_rotation_task`] executes the I/O implied by each action.
//!
//! A failed rotation is retried with `2^retries` second delays; after
//! `MAX_ROTATION_RETRIES` consecutive failures the job stops. Already-issued
//! tokens stay verifiable either way since the active key is left in place.

use std::sync::Arc;
use std::time::Duration;

use stack_auth::KeyStore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics;

/// Rotation job states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationState {
    /// Waiting for the next scheduled tick
    Idle,
    /// A rotation failed; `retries` retries have been scheduled so far
    Retrying { retries: u32 },
    /// Gave up after too many failures
    Stopped,
}

/// Events that drive state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationEvent {
    /// Rotation interval elapsed
    Tick,
    /// New key installed
    Rotated,
    /// Another writer changed the key set first
    Skipped,
    /// Key generation or install failed
    Failed(String),
    /// Retry backoff expired
    RetryTimer,
}

/// Actions the caller should execute after a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationAction {
    Rotate,
    ScheduleRetry { delay: Duration },
    Wait,
    Stop,
}

/// Maximum consecutive retries before the job stops
pub const MAX_ROTATION_RETRIES: u32 = 5;

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: RotationState, event: RotationEvent) -> (RotationState, RotationAction) {
    match (state, event) {
        (RotationState::Stopped, _) => (RotationState::Stopped, RotationAction::Stop),

        (RotationState::Idle, RotationEvent::Tick) => (RotationState::Idle, RotationAction::Rotate),

        (_, RotationEvent::Rotated | RotationEvent::Skipped) => {
            (RotationState::Idle, RotationAction::Wait)
        }

        (RotationState::Idle, RotationEvent::Failed(_)) => (
            RotationState::Retrying { retries: 1 },
            RotationAction::ScheduleRetry {
                delay: Duration::from_secs(1),
            },
        ),

        (RotationState::Retrying { retries }, RotationEvent::Failed(_))
            if retries < MAX_ROTATION_RETRIES =>
        {
            (
                RotationState::Retrying {
                    retries: retries + 1,
                },
                RotationAction::ScheduleRetry {
                    delay: Duration::from_secs(2u64.pow(retries)),
                },
            )
        }

        (RotationState::Retrying { .. }, RotationEvent::Failed(_)) => {
            (RotationState::Stopped, RotationAction::Stop)
        }

        (RotationState::Retrying { retries }, RotationEvent::RetryTimer) => (
            RotationState::Retrying { retries },
            RotationAction::Rotate,
        ),

        // A tick during backoff waits for the retry already scheduled.
        (state, _) => (state, RotationAction::Wait),
    }
}

/// Spawn the background rotation job.
///
/// Runs every `interval` until `cancel` fires or the state machine stops.
pub fn spawn_rotation_task(
    keys: Arc<KeyStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; a key was installed at start-up
        ticker.tick().await;

        let mut state = RotationState::Idle;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("rotation task cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let (next, mut action) = handle_event(state, RotationEvent::Tick);
            state = next;

            loop {
                let event = match action {
                    RotationAction::Wait => break,
                    RotationAction::Stop => {
                        error!(
                            max_retries = MAX_ROTATION_RETRIES,
                            "key rotation keeps failing, stopping rotation job"
                        );
                        return;
                    }
                    RotationAction::Rotate => rotate_once(&keys).await,
                    RotationAction::ScheduleRetry { delay } => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => RotationEvent::RetryTimer,
                        }
                    }
                };
                let (next, next_action) = handle_event(state, event);
                state = next;
                action = next_action;
            }
        }
    })
}

/// One compare-and-swap rotation attempt.
async fn rotate_once(keys: &KeyStore) -> RotationEvent {
    let version = keys.version().await;
    match keys.rotate_from(version).await {
        Ok(Some(key)) => {
            metrics::record_key_rotation("success");
            info!(kid = %key.kid(), "scheduled key rotation completed");
            RotationEvent::Rotated
        }
        Ok(None) => {
            metrics::record_key_rotation("skipped");
            RotationEvent::Skipped
        }
        Err(e) => {
            metrics::record_key_rotation("failure");
            warn!(error = %e, "scheduled key rotation failed");
            RotationEvent::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stack_auth::ManualClock;

    #[test]
    fn tick_triggers_rotation() {
        let (state, action) = handle_event(RotationState::Idle, RotationEvent::Tick);
        assert_eq!(state, RotationState::Idle);
        assert_eq!(action, RotationAction::Rotate);

        let (state, action) = handle_event(state, RotationEvent::Rotated);
        assert_eq!(state, RotationState::Idle);
        assert_eq!(action, RotationAction::Wait);
    }

    #[test]
    fn failures_back_off_exponentially_then_stop() {
        let mut state = RotationState::Idle;
        let mut delays = vec![];
        loop {
            let (next, action) = handle_event(state, RotationEvent::Failed("boom".into()));
            state = next;
            match action {
                RotationAction::ScheduleRetry { delay } => {
                    delays.push(delay.as_secs());
                    let (next, action) = handle_event(state, RotationEvent::RetryTimer);
                    assert_eq!(action, RotationAction::Rotate);
                    state = next;
                }
                RotationAction::Stop => break,
                other => panic!("unexpected action {other:?}"),
            }
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(state, RotationState::Stopped);
    }

    #[test]
    fn success_after_retry_resets_backoff() {
        let (state, _) = handle_event(RotationState::Idle, RotationEvent::Failed("x".into()));
        let (state, _) = handle_event(state, RotationEvent::Failed("x".into()));
        assert_eq!(state, RotationState::Retrying { retries: 2 });

        let (state, action) = handle_event(state, RotationEvent::Rotated);
        assert_eq!(state, RotationState::Idle);
        assert_eq!(action, RotationAction::Wait);
    }

    #[test]
    fn tick_during_backoff_is_ignored() {
        let state = RotationState::Retrying { retries: 1 };
        let (state, action) = handle_event(state, RotationEvent::Tick);
        assert_eq!(state, RotationState::Retrying { retries: 1 });
        assert_eq!(action, RotationAction::Wait);
    }

    #[test]
    fn stopped_is_terminal() {
        for event in [RotationEvent::Tick, RotationEvent::Rotated, RotationEvent::RetryTimer] {
            let (state, action) = handle_event(RotationState::Stopped, event);
            assert_eq!(state, RotationState::Stopped);
            assert_eq!(action, RotationAction::Stop);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn task_rotates_on_interval_until_cancelled() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let keys = Arc::new(KeyStore::new(Duration::from_secs(3600), clock));
        let first = keys.rotate().await.unwrap();
        let cancel = CancellationToken::new();

        let task = spawn_rotation_task(keys.clone(), Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(keys.version().await, 2);
        let second = keys.current_signing_key().await.unwrap();
        assert_ne!(second.kid(), first.kid());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(keys.version().await, 3);

        cancel.cancel();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(keys.version().await, 3);
    }
}
