//! Command/response correlation.
//!
//! Protocols with an authenticated request/response exchange register a
//! waiter per outgoing command code. The first matching response or the
//! timeout — whichever comes first — completes the waiter exactly once;
//! registration and timeout firing are serialized against each other so a
//! response racing a timeout can never complete a waiter twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::soh::SohFrame;

struct PendingCommand {
    generation: u64,
    tx: oneshot::Sender<Result<SohFrame>>,
    timeout_task: tokio::task::JoinHandle<()>,
}

/// Correlates outgoing command codes to pending callers with timeouts.
pub struct CommandRouter {
    pending: Arc<Mutex<HashMap<u8, PendingCommand>>>,
    generation: Arc<Mutex<u64>>,
}

impl CommandRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(Mutex::new(0)),
        }
    }

    /// Register a waiter for `command` with the given timeout.
    ///
    /// A previous waiter for the same code is failed immediately; the
    /// engine keeps at most one outstanding waiter per command code.
    pub fn register(
        &self,
        command: u8,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<SohFrame>> {
        let (tx, rx) = oneshot::channel();

        let generation = {
            let mut counter = self.generation.lock();
            *counter += 1;
            *counter
        };

        let pending = self.pending.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            // Remove only if this registration still owns the slot; a newer
            // waiter for the same code must not be failed by a stale timer.
            let entry = {
                let mut map = pending.lock();
                match map.get(&command) {
                    Some(p) if p.generation == generation => map.remove(&command),
                    _ => None,
                }
            };

            if let Some(entry) = entry {
                warn!("Command {:#04x} timed out", command);
                let _ = entry.tx.send(Err(Error::CommandTimeout { command }));
            }
        });

        let superseded = self.pending.lock().insert(
            command,
            PendingCommand {
                generation,
                tx,
                timeout_task,
            },
        );

        if let Some(old) = superseded {
            debug!("Superseding waiter for command {:#04x}", command);
            old.timeout_task.abort();
            let _ = old
                .tx
                .send(Err(Error::Internal(format!(
                    "command {:#04x} superseded by a newer request",
                    command
                ))));
        }

        rx
    }

    /// Complete the waiter registered for the frame's command code.
    ///
    /// Returns `true` when a waiter was completed. Unmatched responses are
    /// reported to the caller so they can be handled as unsolicited data.
    pub fn complete(&self, frame: SohFrame) -> bool {
        let entry = self.pending.lock().remove(&frame.command);

        match entry {
            Some(entry) => {
                entry.timeout_task.abort();
                let _ = entry.tx.send(Ok(frame));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding waiter immediately.
    ///
    /// Used on connection teardown; waiters observe `ConnectionLost`
    /// without waiting for their timeouts.
    pub fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut map = self.pending.lock();
            map.drain().collect()
        };

        for (command, entry) in drained {
            debug!("Failing waiter for command {:#04x} on teardown", command);
            entry.timeout_task.abort();
            let _ = entry.tx.send(Err(Error::ConnectionLost));
        }
    }

    /// Number of outstanding waiters.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CommandRouter {
    fn drop(&mut self) {
        self.fail_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::soh::{CMD_READ_SETTINGS, STATUS_OK};

    fn reply(command: u8) -> SohFrame {
        SohFrame {
            command,
            status: STATUS_OK,
            payload: vec![],
        }
    }

    #[tokio::test]
    async fn test_response_completes_waiter() {
        let router = CommandRouter::new();
        let rx = router.register(CMD_READ_SETTINGS, Duration::from_secs(2));

        assert!(router.complete(reply(CMD_READ_SETTINGS)));

        let result = rx.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_exactly_once() {
        let router = CommandRouter::new();
        let rx = router.register(CMD_READ_SETTINGS, Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(3)).await;

        let result = rx.await.unwrap();
        assert!(matches!(
            result,
            Err(Error::CommandTimeout {
                command: CMD_READ_SETTINGS
            })
        ));

        // The waiter is gone; a late response completes nothing.
        assert!(!router.complete(reply(CMD_READ_SETTINGS)));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_after_completion_is_unmatched() {
        let router = CommandRouter::new();
        let rx = router.register(CMD_READ_SETTINGS, Duration::from_secs(2));

        assert!(router.complete(reply(CMD_READ_SETTINGS)));
        assert!(!router.complete(reply(CMD_READ_SETTINGS)));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_register_supersedes_previous_waiter() {
        let router = CommandRouter::new();
        let rx1 = router.register(CMD_READ_SETTINGS, Duration::from_secs(2));
        let rx2 = router.register(CMD_READ_SETTINGS, Duration::from_secs(2));

        assert!(matches!(rx1.await.unwrap(), Err(Error::Internal(_))));

        assert!(router.complete(reply(CMD_READ_SETTINGS)));
        assert!(rx2.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fail_all_on_teardown() {
        let router = CommandRouter::new();
        let rx = router.register(CMD_READ_SETTINGS, Duration::from_secs(60));

        router.fail_all();

        assert!(matches!(rx.await.unwrap(), Err(Error::ConnectionLost)));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_response_reported() {
        let router = CommandRouter::new();
        assert!(!router.complete(reply(0x77)));
    }
}
