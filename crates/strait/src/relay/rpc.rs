use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use parking_lot::Mutex;
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::config::TimeoutPolicy;
use crate::error::{RelayError, TimeoutError};

/// Correlation field carried by bridge requests and echoed by replies.
pub const RPC_FIELD: &str = "rpc";

pub(crate) fn rpc_id(value: &Value) -> Option<u64> {
    value.get(RPC_FIELD).and_then(Value::as_u64)
}

#[derive(Debug)]
enum Outcome {
    Reply(Value),
    /// Another call timed out under [`TimeoutPolicy::All`].
    Collateral,
}

struct Waiting {
    operation: &'static str,
    tx: Sender<Outcome>,
}

/// Outstanding bridge calls keyed by correlation id.
///
/// The two halves of a bridge draw ids of opposite parity, so a datagram
/// carrying one of our ids is always a reply and never a request from the
/// other side.
pub(crate) struct PendingCalls {
    parity: u64,
    next: AtomicU64,
    waiting: Mutex<HashMap<u64, Waiting>>,
}

pub(crate) struct Call {
    pub id: u64,
    operation: &'static str,
    rx: Receiver<Outcome>,
}

impl PendingCalls {
    /// `parity` is 0 or 1.
    pub fn new(parity: u64) -> Self {
        Self {
            parity: parity & 1,
            next: AtomicU64::new(parity & 1),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_own(&self, id: u64) -> bool {
        id & 1 == self.parity
    }

    pub fn register(&self, operation: &'static str) -> Call {
        let id = self.next.fetch_add(2, Ordering::Relaxed) + 2;
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.waiting.lock().insert(id, Waiting { operation, tx });
        Call { id, operation, rx }
    }

    /// Hands `reply` to its waiting caller. `false` if nobody waits for it.
    pub fn resolve(&self, id: u64, reply: Value) -> bool {
        let Some(waiting) = self.waiting.lock().remove(&id) else {
            return false;
        };
        waiting.tx.send(Outcome::Reply(reply)).is_ok()
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Drops every waiting caller; their waits end with [`RelayError::Closed`].
    pub fn clear(&self) {
        self.waiting.lock().clear();
    }

    fn forget(&self, id: u64) {
        self.waiting.lock().remove(&id);
    }

    fn fail_all(&self) {
        let waiting: Vec<Waiting> = self.waiting.lock().drain().map(|(_, w)| w).collect();
        for entry in waiting {
            tracing::warn!(target = "strait::relay", operation = entry.operation, "pending bridge call failed by timeout policy");
            let _ = entry.tx.send(Outcome::Collateral);
        }
    }

    /// Blocks until `call` is answered, the relay stops or the policy gives up.
    pub fn wait(
        &self,
        call: Call,
        timeout: Duration,
        policy: TimeoutPolicy,
        stop: &CancelToken,
    ) -> Result<Value, RelayError> {
        let outcome = match policy {
            TimeoutPolicy::None => select! {
                recv(call.rx) -> outcome => outcome.map_err(|_| RelayError::Closed)?,
                recv(stop.receiver()) -> _ => return Err(RelayError::Closed),
            },
            TimeoutPolicy::Critical | TimeoutPolicy::All => select! {
                recv(call.rx) -> outcome => outcome.map_err(|_| RelayError::Closed)?,
                recv(stop.receiver()) -> _ => return Err(RelayError::Closed),
                default(timeout) => {
                    self.forget(call.id);
                    tracing::warn!(
                        target = "strait::relay",
                        operation = call.operation,
                        rpc = call.id,
                        ?timeout,
                        ?policy,
                        "bridge call timed out"
                    );
                    if policy == TimeoutPolicy::All {
                        self.fail_all();
                    }
                    return Err(TimeoutError::Expired {
                        operation: call.operation,
                        after: timeout,
                    }
                    .into());
                }
            },
        };
        match outcome {
            Outcome::Reply(reply) => Ok(reply),
            Outcome::Collateral => Err(TimeoutError::Collateral {
                operation: call.operation,
            }
            .into()),
        }
    }
}
