use chrono::Utc;
use proptest::prelude::*;
use proxy_core::stats::{FIVE_MINUTE_SAMPLES, ONE_MINUTE_SAMPLES, OVERALL_SAMPLES};
use proxy_core::{ResponseRecord, StatsTracker, Transaction, TransactionLog};
use std::collections::HashMap;
use std::time::Duration;

fn txn(n: usize) -> Transaction {
    Transaction {
        id: format!("req_0_{}", n),
        timestamp: Utc::now(),
        method: "GET".to_string(),
        url: format!("/{}", n),
        remote_addr: "127.0.0.1:0".to_string(),
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

proptest! {
    #[test]
    fn ring_holds_the_last_min_k_n(capacity in 1usize..64, inserts in 0usize..200) {
        let log = TransactionLog::new(capacity);
        for n in 0..inserts {
            log.push(txn(n));
        }
        let expected: Vec<String> = (inserts.saturating_sub(capacity)..inserts)
            .map(|n| format!("req_0_{}", n))
            .collect();
        let held: Vec<String> = log.snapshot().into_iter().map(|t| t.id).collect();
        prop_assert_eq!(held.len(), inserts.min(capacity));
        prop_assert_eq!(held, expected);
    }

    #[test]
    fn windows_never_exceed_their_caps(samples in prop::collection::vec(0u64..5_000, 0..1_200)) {
        let tracker = StatsTracker::new();
        for ms in &samples {
            tracker.record_sample(Duration::from_millis(*ms));
        }
        let (one, five, overall) = tracker.window_sizes();
        prop_assert_eq!(one, samples.len().min(ONE_MINUTE_SAMPLES));
        prop_assert_eq!(five, samples.len().min(FIVE_MINUTE_SAMPLES));
        prop_assert_eq!(overall, samples.len().min(OVERALL_SAMPLES));
        prop_assert_eq!(tracker.total_connections(), samples.len() as u64);
    }

    #[test]
    fn percentiles_use_the_floor_index(samples in prop::collection::vec(1u64..10_000, 1..500)) {
        let tracker = StatsTracker::new();
        for ms in &samples {
            tracker.record_sample(Duration::from_millis(*ms));
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let snap = tracker.snapshot();
        prop_assert_eq!(snap.p50_response_time, sorted[sorted.len() * 50 / 100] as f64);
        prop_assert_eq!(snap.p90_response_time, sorted[sorted.len() * 90 / 100] as f64);
        prop_assert!(snap.p50_response_time <= snap.p90_response_time);
    }

    #[test]
    fn one_minute_average_tracks_latest_sixty(
        early in prop::collection::vec(1u64..1_000, 0..100),
        recent in prop::collection::vec(1u64..1_000, 60..61),
    ) {
        let tracker = StatsTracker::new();
        for ms in early.iter().chain(recent.iter()) {
            tracker.record_sample(Duration::from_millis(*ms));
        }
        let mean = recent.iter().sum::<u64>() as f64 / recent.len() as f64;
        let snap = tracker.snapshot();
        prop_assert!((snap.avg_response_time_1m - mean).abs() < 1e-6);
    }
}
