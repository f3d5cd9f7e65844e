use std::time::Duration;

pub mod interval_history;
pub mod phi_accrual;

/// A [FailureDetector] tracks a single remote node. It is told about every piece of traffic
///  that is provably from that node, and it turns the timing of that traffic into a continuous
///  suspicion score rather than a binary up / down decision.
#[cfg_attr(test, mockall::automock)]
pub trait FailureDetector: Send + Sync {
    /// record that traffic from the tracked node was observed just now
    fn report(&mut self);

    /// current suspicion score. It grows with the time elapsed since the most recent report,
    ///  so it is recomputed on every call and must not be cached.
    fn phi(&self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureDetectorConfig {
    /// expected interval between reports, used to seed the statistics on the first report
    ///  before any actual interval was measured
    pub first_heartbeat_estimate: Duration,
    /// lower bound for the standard deviation of report intervals. Very regular traffic would
    ///  otherwise cause tiny delays to be treated as failures.
    pub min_std_dev: Duration,
    /// reports closer together than this are treated as a single observation
    pub burst_window: Duration,
}

impl FailureDetectorConfig {
    pub fn new(first_heartbeat_estimate: Duration) -> FailureDetectorConfig {
        FailureDetectorConfig {
            first_heartbeat_estimate,
            min_std_dev: Duration::from_millis(500),
            burst_window: Duration::from_millis(100),
        }
    }
}
