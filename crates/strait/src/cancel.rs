use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

/// Cloneable cancellation handle.
///
/// Cancelling drops the only sender, so every clone's [`CancelToken::receiver`]
/// turns disconnected at once. Blocking waits put the receiver in a
/// `crossbeam_channel::select!` next to whatever they are waiting for.
#[derive(Clone, Debug)]
pub struct CancelToken {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal: rx,
        }
    }

    pub fn cancel(&self) {
        if self.trigger.lock().take().is_some() {
            tracing::debug!(target = "strait::cancel", "cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Receiver that disconnects when the token is cancelled. Never yields a value.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.signal
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn cancel_wakes_a_blocked_select() {
        let token = CancelToken::new();
        let remote = token.clone();
        let (_keep, never) = crossbeam_channel::unbounded::<u32>();
        let waiter = std::thread::spawn(move || {
            let started = Instant::now();
            crossbeam_channel::select! {
                recv(never) -> _ => unreachable!(),
                recv(remote.receiver()) -> _ => started.elapsed(),
                default(Duration::from_secs(10)) => panic!("cancel was not observed"),
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!token.is_cancelled());
        token.cancel();
        let waited = waiter.join().unwrap();
        assert!(waited < Duration::from_secs(5));
        assert!(token.is_cancelled());
    }
}
