//! Metrics sink configuration and counters.
//!
//! Pure configuration glue: the session counts scan events against a
//! bounded queue and flushes them through the log facade. The wire
//! protocol to an actual metrics daemon is out of scope.

use std::collections::VecDeque;

use log::debug;
use parking_lot::Mutex;

const DEFAULT_PORT: u16 = 8125;
const DEFAULT_HOST: &str = "localhost";

/// Destination and bounded counter queue for scan metrics.
#[derive(Debug)]
pub struct MetricsSink {
    host: String,
    port: u16,
    max_queue_size: usize,
    queue: Mutex<VecDeque<(String, u64)>>,
}

impl MetricsSink {
    /// Parse a `host:port` address. The port defaults to 8125 when omitted
    /// or empty; the host defaults to localhost when the string starts
    /// with ':'.
    pub fn parse(addr: &str, max_queue_size: usize) -> MetricsSink {
        let (host, port) = match addr.find(':') {
            None => (addr.to_string(), DEFAULT_PORT),
            Some(0) => (
                DEFAULT_HOST.to_string(),
                addr[1..].parse().unwrap_or(DEFAULT_PORT),
            ),
            Some(i) => {
                let port = if i == addr.len() - 1 {
                    DEFAULT_PORT
                } else {
                    addr[i + 1..].parse().unwrap_or(DEFAULT_PORT)
                };
                (addr[..i].to_string(), port)
            }
        };
        MetricsSink {
            host,
            port,
            max_queue_size,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Queue a counter increment, flushing when the queue is full.
    pub fn count(&self, name: &str, value: u64) {
        let mut queue = self.queue.lock();
        queue.push_back((name.to_string(), value));
        if queue.len() >= self.max_queue_size {
            Self::flush_queue(&self.host, self.port, &mut queue);
        }
    }

    /// Flush any queued counters.
    pub fn flush(&self) {
        let mut queue = self.queue.lock();
        Self::flush_queue(&self.host, self.port, &mut queue);
    }

    fn flush_queue(host: &str, port: u16, queue: &mut VecDeque<(String, u64)>) {
        for (name, value) in queue.drain(..) {
            debug!("metric [{host}:{port}] {name}+={value}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let sink = MetricsSink::parse("stats.internal:9125", 10);
        assert_eq!(sink.host(), "stats.internal");
        assert_eq!(sink.port(), 9125);
    }

    #[test]
    fn test_parse_defaults() {
        let sink = MetricsSink::parse("statshost", 10);
        assert_eq!(sink.host(), "statshost");
        assert_eq!(sink.port(), 8125);

        let sink = MetricsSink::parse(":9125", 10);
        assert_eq!(sink.host(), "localhost");
        assert_eq!(sink.port(), 9125);

        let sink = MetricsSink::parse("statshost:", 10);
        assert_eq!(sink.host(), "statshost");
        assert_eq!(sink.port(), 8125);
    }

    #[test]
    fn test_queue_bound() {
        let sink = MetricsSink::parse("h:1", 3);
        sink.count("seek", 1);
        sink.count("next", 1);
        assert_eq!(sink.queue.lock().len(), 2);
        sink.count("next", 1); // hits the bound, flushes
        assert_eq!(sink.queue.lock().len(), 0);
    }
}
