#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tracing::info;

    // Throughput (cumulative)
    static CONNECTIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
    static REQUESTS_RECEIVED: AtomicU64 = AtomicU64::new(0);
    static REQUESTS_FORWARDED: AtomicU64 = AtomicU64::new(0);
    static RESPONSES_SENT: AtomicU64 = AtomicU64::new(0);
    // Failures (cumulative)
    static BAD_REQUESTS: AtomicU64 = AtomicU64::new(0);
    static REQUESTS_DROPPED: AtomicU64 = AtomicU64::new(0);
    static CONNECTION_FAILURES: AtomicU64 = AtomicU64::new(0);

    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub connections_accepted: u64,
        pub requests_received: u64,
        pub requests_forwarded: u64,
        pub responses_sent: u64,
        pub bad_requests: u64,
        pub requests_dropped: u64,
        pub connection_failures: u64,
    }

    pub fn inc_connections_accepted() {
        CONNECTIONS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_received() {
        REQUESTS_RECEIVED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_forwarded() {
        REQUESTS_FORWARDED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_responses_sent() {
        RESPONSES_SENT.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_bad_requests() {
        BAD_REQUESTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_dropped() {
        REQUESTS_DROPPED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connection_failures() {
        CONNECTION_FAILURES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: CONNECTIONS_ACCEPTED.load(Ordering::Relaxed),
            requests_received: REQUESTS_RECEIVED.load(Ordering::Relaxed),
            requests_forwarded: REQUESTS_FORWARDED.load(Ordering::Relaxed),
            responses_sent: RESPONSES_SENT.load(Ordering::Relaxed),
            bad_requests: BAD_REQUESTS.load(Ordering::Relaxed),
            requests_dropped: REQUESTS_DROPPED.load(Ordering::Relaxed),
            connection_failures: CONNECTION_FAILURES.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        std::thread::spawn(|| {
            let mut last = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                info!(
                    interval_secs = INTERVAL_SECS,
                    accepted = snap.connections_accepted - last.connections_accepted,
                    received = snap.requests_received - last.requests_received,
                    forwarded = snap.requests_forwarded - last.requests_forwarded,
                    sent = snap.responses_sent - last.responses_sent,
                    bad = snap.bad_requests - last.bad_requests,
                    dropped = snap.requests_dropped - last.requests_dropped,
                    conn_failures = snap.connection_failures - last.connection_failures,
                    "metrics delta"
                );
                last = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub connections_accepted: u64,
        pub requests_received: u64,
        pub requests_forwarded: u64,
        pub responses_sent: u64,
        pub bad_requests: u64,
        pub requests_dropped: u64,
        pub connection_failures: u64,
    }

    pub fn inc_connections_accepted() {}
    pub fn inc_requests_received() {}
    pub fn inc_requests_forwarded() {}
    pub fn inc_responses_sent() {}
    pub fn inc_bad_requests() {}
    pub fn inc_requests_dropped() {}
    pub fn inc_connection_failures() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: 0,
            requests_received: 0,
            requests_forwarded: 0,
            responses_sent: 0,
            bad_requests: 0,
            requests_dropped: 0,
            connection_failures: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
