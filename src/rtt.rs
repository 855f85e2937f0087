use std::time::Duration;

/// Smoothed RTT and retransmission timeout, computed per Jacobson's algorithm with
///  Karn's rule applied by the caller (samples are only fed in for segments that were
///  never retransmitted).
///
/// `rto = srtt + max(G, 4 * rttvar)` with a clock granularity G of 10ms; the first
///  sample seeds `srtt = R`, `rttvar = R/2`, later samples are folded in with gains
///  alpha = 1/8 and beta = 1/4. The RTO is clamped to the configured range, and doubles
///  on every retransmission until a fresh unambiguous sample re-seeds it.
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    rto_min: Duration,
    rto_max: Duration,
}

const GRANULARITY: Duration = Duration::from_millis(10);

impl RttEstimator {
    pub fn new(rto_initial: Duration, rto_min: Duration, rto_max: Duration) -> RttEstimator {
        RttEstimator {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: rto_initial.clamp(rto_min, rto_max),
            rto_min,
            rto_max,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Fold in an unambiguous RTT sample. Per Karn's rule the caller must never measure
    ///  a retransmitted segment - the sample would be ambiguous between transmissions.
    pub fn on_sample(&mut self, r: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(r);
                self.rttvar = r / 2;
            }
            Some(srtt) => {
                let deviation = if srtt > r { srtt - r } else { r - srtt };
                // rttvar = 3/4 * rttvar + 1/4 * |srtt - r|
                self.rttvar = self.rttvar * 3 / 4 + deviation / 4;
                // srtt = 7/8 * srtt + 1/8 * r
                self.srtt = Some(srtt * 7 / 8 + r / 8);
            }
        }

        let srtt = self.srtt.expect("seeded above");
        self.rto = (srtt + std::cmp::max(GRANULARITY, 4 * self.rttvar))
            .clamp(self.rto_min, self.rto_max);
    }

    /// Exponential backoff on retransmission.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(self.rto_max);
    }
}
