//! Telemetry utilities for unit timing and span construction.

use std::time::{Duration, Instant};

/// Guard timing one unit of work on the loop or in the invoker.
///
/// Records latency when dropped and warns if the unit ran longer than
/// the configured threshold.
pub struct UnitTimer<'a> {
    site: &'static str,
    name: &'a str,
    threshold: Duration,
    start: Instant,
}

impl<'a> UnitTimer<'a> {
    pub fn new(site: &'static str, name: &'a str, threshold: Duration) -> Self {
        Self {
            site,
            name,
            threshold,
            start: Instant::now(),
        }
    }
}

impl Drop for UnitTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let long = elapsed > self.threshold;
        if long {
            tracing::warn!(
                site = self.site,
                unit = %self.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Long unit"
            );
        }
        crate::metrics::record_unit(self.site, elapsed.as_secs_f64(), long);
    }
}

/// Standardized span constructors.
pub mod spans {
    use std::net::SocketAddr;
    use tracing::{Span, debug_span, info_span};

    /// Create a span for a client connection.
    pub fn connection(connection_id: u64, addr: &SocketAddr) -> Span {
        info_span!("connection", id = connection_id, addr = %addr)
    }

    /// Create a span for an authenticated session.
    pub fn session(username: &str, connection_id: u64) -> Span {
        info_span!("session", user = %username, connection = connection_id)
    }

    /// Create a span for one unit of work off the loop.
    pub fn unit(site: &'static str, name: &str) -> Span {
        debug_span!("unit", site, name = %name)
    }
}
