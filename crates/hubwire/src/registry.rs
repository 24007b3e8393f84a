//! Tracks invocations that are waiting for the server.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{HubError, Subject};

/// What to do with the server's answer to one invocation.
pub(crate) enum PendingInvocation {
    /// An `invoke`: resolved by the Completion.
    Invoke(oneshot::Sender<Result<Value, HubError>>),
    /// A `stream`: fed by StreamItems, ended by the Completion.
    Stream(Subject<Value>),
}

impl PendingInvocation {
    /// Fails the invocation with `error`.
    pub(crate) fn reject(self, error: HubError) {
        match self {
            Self::Invoke(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Stream(subject) => subject.error(error),
        }
    }
}

/// Pending invocations keyed by invocation id.
///
/// Ids come from one counter that starts at `0` and only goes up for the
/// lifetime of the connection, reconnects included, so an id is never
/// handed out twice.
#[derive(Default)]
pub(crate) struct InvocationRegistry {
    next_id: u64,
    pending: HashMap<String, PendingInvocation>,
}

impl InvocationRegistry {
    /// Reserves the next invocation id.
    pub(crate) fn next_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }

    pub(crate) fn insert(&mut self, id: String, pending: PendingInvocation) {
        self.pending.insert(id, pending);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<PendingInvocation> {
        self.pending.remove(id)
    }

    /// The subject feeding a streaming invocation.
    pub(crate) fn stream(&self, id: &str) -> Option<Subject<Value>> {
        match self.pending.get(id) {
            Some(PendingInvocation::Stream(subject)) => Some(subject.clone()),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Removes every pending invocation.
    pub(crate) fn drain(&mut self) -> Vec<PendingInvocation> {
        self.pending.drain().map(|(_, pending)| pending).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_ids_strictly_increase() {
        let mut registry = InvocationRegistry::default();
        let ids: Vec<u64> = (0..5)
            .map(|_| registry.next_id().parse().unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_registry_ids_not_reused_after_drain() {
        let mut registry = InvocationRegistry::default();
        let first = registry.next_id();
        let (tx, _rx) = oneshot::channel();
        registry.insert(first.clone(), PendingInvocation::Invoke(tx));
        assert_eq!(registry.drain().len(), 1);

        let second = registry.next_id();
        assert_ne!(first, second);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_reject_resolves_invoke_with_error() {
        let (tx, rx) = oneshot::channel();
        PendingInvocation::Invoke(tx).reject(HubError::ConnectionClosed(None));
        assert!(matches!(rx.await, Ok(Err(HubError::ConnectionClosed(None)))));
    }

    #[test]
    fn test_stream_lookup_ignores_invokes() {
        let mut registry = InvocationRegistry::default();
        let (tx, _rx) = oneshot::channel();
        registry.insert("0".into(), PendingInvocation::Invoke(tx));
        registry.insert("1".into(), PendingInvocation::Stream(Subject::new()));

        assert!(registry.stream("0").is_none());
        assert!(registry.stream("1").is_some());
        assert!(registry.contains("0"));
        assert!(!registry.contains("2"));
    }
}
