//! Bounded in-memory window of recent transactions.

use crate::model::Transaction;
use parking_lot::RwLock;
use std::collections::VecDeque;

/// FIFO ring of the most recent transactions.
///
/// Writers hold the lock only for append + evict; readers copy the contents
/// out before releasing it.
#[derive(Debug)]
pub struct TransactionLog {
    capacity: usize,
    entries: RwLock<VecDeque<Transaction>>,
}

impl TransactionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, txn: Transaction) {
        let mut entries = self.entries.write();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(txn);
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResponseRecord;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::time::Duration;

    fn txn(id: usize) -> Transaction {
        Transaction {
            id: format!("req_0_{}", id),
            timestamp: Utc::now(),
            method: "GET".into(),
            url: format!("/item/{}", id),
            remote_addr: "127.0.0.1:1".into(),
            headers: HashMap::new(),
            body: String::new(),
            response: ResponseRecord::default(),
            duration: Duration::from_millis(1),
            user_agent: String::new(),
            content_type: String::new(),
            size: -1,
            status_code: 200,
            aborted: false,
        }
    }

    #[test]
    fn test_evicts_oldest() {
        let log = TransactionLog::new(3);
        for i in 1..=5 {
            log.push(txn(i));
        }
        let ids: Vec<String> = log.snapshot().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["req_0_3", "req_0_4", "req_0_5"]);
        assert_eq!(log.len(), 3);
        assert_eq!(log.capacity(), 3);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let log = TransactionLog::new(10);
        log.push(txn(1));
        let snapshot = log.snapshot();
        log.push(txn(2));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let log = TransactionLog::new(0);
        log.push(txn(1));
        log.push(txn(2));
        assert_eq!(log.len(), 1);
        assert_eq!(log.snapshot()[0].id, "req_0_2");
    }
}
