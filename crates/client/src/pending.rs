//! Request correlation: one parked waiter per outstanding request id.
//!
//! The receive loop resolves waiters by id as responses arrive; the
//! sender removes its entry on every exit path (success, protocol
//! failure, timeout), so the table never leaks. Tearing the connection
//! down fails every remaining waiter at once.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use oc_protocol::ResponseFrame;

#[derive(Default)]
pub(crate) struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<ResponseFrame>>>,
}

impl PendingRequests {
    /// Park a waiter for the given request id.
    pub fn register(&self, id: &str) -> oneshot::Receiver<ResponseFrame> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id.to_owned(), tx);
        rx
    }

    /// Resolve the waiter matching this response. Returns `false` for
    /// unmatched responses (late arrivals after a timeout), which the
    /// caller logs and drops.
    pub fn resolve(&self, response: ResponseFrame) -> bool {
        let waiter = self.waiters.lock().remove(&response.id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop the waiter for an id, if still present.
    pub fn remove(&self, id: &str) {
        self.waiters.lock().remove(id);
    }

    /// Fail every outstanding waiter by dropping its sender; receivers
    /// observe the closed channel as a connection-lost error.
    pub fn fail_all(&self) -> usize {
        let mut waiters = self.waiters.lock();
        let count = waiters.len();
        waiters.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}
