use std::cmp::max;
use std::f64::consts::LN_10;
use std::time::Duration;

use ordered_float::OrderedFloat;
use tokio::time::Instant;

use crate::failure_detector::interval_history::IntervalHistory;
use crate::failure_detector::{FailureDetector, FailureDetectorConfig};

/// The [PhiAccrualDetector] assumes that intervals between two observed pieces of traffic
///  follow a Gaussian distribution, and it fits mean and standard deviation over a sliding
///  window of actually measured intervals.
///
/// For the time elapsed since the last report, phi is `-log10` of the probability that traffic
///  would still arrive if we waited long enough. Phi 1 means a 10% chance that the node is
///  merely slow, phi 8 a chance of 10^-8.
///
/// The approach follows https://oneofus.la/have-emacs-will-hack/files/HDY04.pdf, using the
///  logistic approximation of the cumulative normal distribution.
///
/// Before the first report there is no basis for suspicion, and phi is 0.
pub struct PhiAccrualDetector {
    intervals: IntervalHistory<256>,
    last_report: Option<Instant>,
    first_heartbeat_estimate: Duration,
    min_std_dev: f64,
    burst_window: Duration,
}

impl PhiAccrualDetector {
    pub fn new(config: &FailureDetectorConfig) -> PhiAccrualDetector {
        PhiAccrualDetector {
            intervals: IntervalHistory::new(),
            last_report: None,
            first_heartbeat_estimate: config.first_heartbeat_estimate,
            min_std_dev: config.min_std_dev.as_secs_f64(),
            burst_window: config.burst_window,
        }
    }
}

impl FailureDetector for PhiAccrualDetector {
    fn report(&mut self) {
        let now = Instant::now();
        match self.last_report.replace(now) {
            Some(previous) => {
                let interval = now.duration_since(previous);
                if interval >= self.burst_window {
                    self.intervals.add(interval.as_secs_f64());
                }
            }
            None => {
                // we start with values scattered around the expected interval to avoid being
                //  overly picky before actual measurements come in
                let estimate = self.first_heartbeat_estimate.as_secs_f64();
                self.intervals.add(estimate * 0.5);
                self.intervals.add(estimate);
                self.intervals.add(estimate * 1.5);
            }
        }
    }

    fn phi(&self) -> f64 {
        let Some(last_report) = self.last_report else {
            return 0.0;
        };

        let std_dev = max(OrderedFloat(self.intervals.std_dev()), OrderedFloat(self.min_std_dev)).0;
        phi(last_report.elapsed().as_secs_f64(), self.intervals.mean(), std_dev)
    }
}

/// `-log10(1 - F(elapsed))` for the normal distribution `F` with the given mean and standard
///  deviation.
///
/// With the logistic approximation `1 - F = 1 / (1 + e^a)`, phi is `ln(1 + e^a) / ln(10)`. That
///  is evaluated in a form that neither overflows nor becomes infinite, so phi stays finite and
///  monotonic for arbitrarily long silence.
fn phi(elapsed: f64, mean: f64, std_dev: f64) -> f64 {
    if std_dev < 1e-9 {
        return if elapsed <= mean { 0.0 } else { f64::MAX };
    }

    let y = (elapsed - mean) / std_dev;
    let a = y * (1.5976 + 0.070566 * y * y);

    let softplus = if a > 0.0 {
        a + (-a).exp().ln_1p()
    }
    else {
        a.exp().ln_1p()
    };
    softplus / LN_10
}
