//! Choosing a processing worker for an inbound request.

/// Maps a raw request to a bucket; the bucket is reduced modulo the pool size.
pub type Classifier = fn(&[u8]) -> usize;

#[derive(Debug, Clone, Copy)]
pub enum RoutingPolicy {
    /// `request counter mod pool size`.
    RoundRobin,
    ContentClassified(Classifier),
    /// Always the processing worker with the dispatch worker's own index.
    Affinity,
}

impl RoutingPolicy {
    /// Pick a processing worker. `counter` is the dispatch worker's request count including this
    /// request; `pool_size` must be non-zero.
    pub fn select(
        &self,
        counter: u64,
        dispatch_index: usize,
        payload: &[u8],
        pool_size: usize,
    ) -> usize {
        debug_assert!(pool_size > 0, "routing over an empty pool");
        match self {
            RoutingPolicy::RoundRobin => (counter % pool_size as u64) as usize,
            RoutingPolicy::ContentClassified(classify) => classify(payload) % pool_size,
            RoutingPolicy::Affinity => dispatch_index % pool_size,
        }
    }
}

/// 1 if the request line (up to the first CRLF) has a third space-delimited token containing
/// `HTTP`, else 0.
pub fn classify_request_line(payload: &[u8]) -> usize {
    let Some(end) = payload.windows(2).position(|w| w == b"\r\n") else {
        return 0;
    };
    match payload[..end].split(|&b| b == b' ').nth(2) {
        Some(version) if version.windows(4).any(|w| w == b"HTTP") => 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_visits_each_worker_k_times_in_cyclic_order() {
        let pool = 3;
        let k = 4;
        let picks: Vec<usize> = (1..=(k * pool) as u64)
            .map(|counter| RoutingPolicy::RoundRobin.select(counter, 0, b"", pool))
            .collect();

        for worker in 0..pool {
            assert_eq!(picks.iter().filter(|&&w| w == worker).count(), k);
        }
        for pair in picks.windows(2) {
            assert_eq!(pair[1], (pair[0] + 1) % pool);
        }
    }

    #[test]
    fn affinity_uses_dispatch_index() {
        for index in 0..4 {
            assert_eq!(RoutingPolicy::Affinity.select(99, index, b"", 4), index);
        }
    }

    #[test]
    fn content_classifier_is_reduced_modulo_pool() {
        let policy = RoutingPolicy::ContentClassified(classify_request_line);
        assert_eq!(policy.select(0, 0, b"GET / HTTP/1.1\r\n\r\n", 2), 1);
        assert_eq!(policy.select(0, 0, b"GET / HTTP/1.1\r\n\r\n", 1), 0);
        assert_eq!(policy.select(0, 0, b"garbage", 2), 0);
    }

    #[test]
    fn classifier_requires_crlf_and_http_third_token() {
        assert_eq!(classify_request_line(b"GET /index.html HTTP/1.0\r\n"), 1);
        assert_eq!(classify_request_line(b"GET /index.html HTTP/1.0"), 0);
        assert_eq!(classify_request_line(b"GET /index.html\r\n"), 0);
        assert_eq!(classify_request_line(b"GET /index.html FTP/1.0\r\n"), 0);
    }
}
