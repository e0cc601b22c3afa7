//! Response-pending table (§3, §4.F `SendRequest`).
//!
//! One entry per outstanding request, keyed by request id. A concurrent map
//! (§5: readers/writers take no external lock); completion, timeout, or
//! invalidation all remove the entry exactly once.

use dashmap::DashMap;
use tokio::sync::oneshot;
use vmnx_core::{Message, MessageId};

/// Table of requests awaiting a correlated response.
pub struct ResponseTable {
    pending: DashMap<MessageId, oneshot::Sender<Message>>,
}

impl ResponseTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Register a new pending request, returning the receiver half the
    /// caller awaits.
    pub fn register(&self, request_id: MessageId) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);
        rx
    }

    /// Resolve a pending request with its response. Returns `true` if a
    /// waiter was found (and the entry removed); `false` if the
    /// `request_id` was unknown (late, duplicate, or already timed out —
    /// dropped per §7 protocol-structural policy).
    pub fn resolve(&self, request_id: MessageId, response: Message) -> bool {
        if let Some((_, tx)) = self.pending.remove(&request_id) {
            // Receiver may already be gone if the caller's own timeout fired
            // first; that's fine, nothing to deliver to.
            let _ = tx.send(response);
            true
        } else {
            false
        }
    }

    /// Remove a pending entry without resolving it (caller's timeout fired,
    /// or the response was invalid).
    pub fn remove(&self, request_id: MessageId) {
        self.pending.remove(&request_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for ResponseTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmnx_core::ResponsePayload;

    #[tokio::test]
    async fn resolve_delivers_response_to_waiter() {
        let table = ResponseTable::new();
        let req_id = MessageId::generate();
        let rx = table.register(req_id);

        let response = Message::new_response(req_id, ResponsePayload::Pong { nonce: 1 });
        assert!(table.resolve(req_id, response.clone()));

        let received = rx.await.unwrap();
        assert_eq!(received.id(), response.id());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_noop() {
        let table = ResponseTable::new();
        let response = Message::new_response(MessageId::generate(), ResponsePayload::RekeyAcknowledged);
        assert!(!table.resolve(MessageId::generate(), response));
    }

    #[tokio::test]
    async fn remove_drops_without_resolving() {
        let table = ResponseTable::new();
        let req_id = MessageId::generate();
        let rx = table.register(req_id);
        table.remove(req_id);
        assert_eq!(table.len(), 0);
        assert!(rx.await.is_err());
    }
}
