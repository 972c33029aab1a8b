//! Fan-out of completed transactions to registered consumers.

use crate::model::Transaction;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener queue is full")]
    QueueFull,
    #[error("listener is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// Consumer of completed transactions.
///
/// Called synchronously, after the response has been written to the client.
/// Implementations that need to do slow work should hand the transaction to
/// their own task.
pub trait TransactionListener: Send + Sync {
    fn on_transaction(&self, txn: &Transaction) -> Result<(), ListenerError>;

    fn name(&self) -> &str {
        "listener"
    }
}

/// Adapter for plain closures.
pub struct FnListener<F> {
    name: String,
    func: F,
}

impl<F> FnListener<F>
where
    F: Fn(&Transaction) + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> TransactionListener for FnListener<F>
where
    F: Fn(&Transaction) + Send + Sync,
{
    fn on_transaction(&self, txn: &Transaction) -> Result<(), ListenerError> {
        (self.func)(txn);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Ordered listener registry.
///
/// Registration may happen while requests are in flight: `notify` clones the
/// list under the read lock and invokes listeners outside of it.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn TransactionListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn TransactionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Invoke every listener in registration order.
    ///
    /// A listener that errors or panics is logged and skipped; the remaining
    /// listeners still run. Returns the number of listeners that succeeded.
    pub fn notify(&self, txn: &Transaction) -> usize {
        let listeners: Vec<Arc<dyn TransactionListener>> = self.listeners.read().clone();
        let mut delivered = 0;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_transaction(txn))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(
                        listener = listener.name(),
                        request_id = %txn.id,
                        "Listener failed: {}", e
                    );
                }
                Err(panic) => {
                    warn!(
                        listener = listener.name(),
                        request_id = %txn.id,
                        "Listener panicked: {}",
                        panic_message(&panic)
                    );
                }
            }
        }
        delivered
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .listeners
            .read()
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        f.debug_struct("ListenerSet").field("listeners", &names).finish()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResponseRecord;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    fn txn() -> Transaction {
        Transaction {
            id: "req_0_1".into(),
            timestamp: Utc::now(),
            method: "POST".into(),
            url: "/hook".into(),
            remote_addr: "127.0.0.1:9".into(),
            headers: HashMap::new(),
            body: "{}".into(),
            response: ResponseRecord::default(),
            duration: Duration::from_millis(2),
            user_agent: String::new(),
            content_type: "application/json".into(),
            size: 2,
            status_code: 200,
            aborted: false,
        }
    }

    struct Failing;

    impl TransactionListener for Failing {
        fn on_transaction(&self, _txn: &Transaction) -> Result<(), ListenerError> {
            Err(ListenerError::Other("boom".into()))
        }
    }

    #[test]
    fn test_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let set = ListenerSet::new();
        for i in 0..3 {
            let seen = seen.clone();
            set.add(Arc::new(FnListener::new(format!("l{}", i), move |_| {
                seen.lock().push(i)
            })));
        }
        assert_eq!(set.notify(&txn()), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failures_are_isolated() {
        let calls = Arc::new(Mutex::new(0));
        let set = ListenerSet::new();
        set.add(Arc::new(FnListener::new("panics", |_| panic!("listener bug"))));
        set.add(Arc::new(Failing));
        let c = calls.clone();
        set.add(Arc::new(FnListener::new("counts", move |_| *c.lock() += 1)));

        assert_eq!(set.notify(&txn()), 1);
        assert_eq!(set.notify(&txn()), 1);
        assert_eq!(*calls.lock(), 2);
    }

    #[test]
    fn test_listener_may_register_during_notify() {
        let set = Arc::new(ListenerSet::new());
        let inner = set.clone();
        set.add(Arc::new(FnListener::new("registers", move |_| {
            inner.add(Arc::new(FnListener::new("late", |_| {})));
        })));
        set.notify(&txn());
        assert_eq!(set.len(), 2);
    }
}
