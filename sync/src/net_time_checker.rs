use log::warn;
use std::collections::VecDeque;

const TOLERANT_OFFSET: u64 = 7_200_000;
const MIN_SAMPLES: usize = 5;
const MAX_SAMPLES: usize = 11;

/// Collect and check clock-offset samples against peer-reported time.
///
/// Every `version` message contributes one sample (`remote clock − ours`).
/// Once the rolling median drifts past the tolerant offset, the operator is
/// warned; nothing else in the node consumes the offset.
pub struct NetTimeChecker {
    /// Local clock should have less offset than this value.
    tolerant_offset: u64,
    max_samples: usize,
    min_samples: usize,
    samples: VecDeque<i64>,
}

impl NetTimeChecker {
    pub fn new(min_samples: usize, max_samples: usize, tolerant_offset: u64) -> Self {
        NetTimeChecker {
            min_samples,
            max_samples,
            tolerant_offset,
            samples: VecDeque::with_capacity(max_samples + 1),
        }
    }

    pub fn add_sample(&mut self, offset: i64) {
        self.samples.push_back(offset);
        if self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    fn median_offset(&self) -> Option<i64> {
        if self.samples.is_empty() || self.samples.len() < self.min_samples {
            return None;
        }
        let mut samples = self.samples.iter().cloned().collect::<Vec<_>>();
        samples.sort_unstable();
        if samples.len() % 2 == 0 {
            let i = samples.len() / 2;
            Some((samples[i - 1] + samples[i]) / 2)
        } else {
            samples.get(samples.len() / 2).cloned()
        }
    }

    pub fn check(&self) -> Result<(), i64> {
        let network_offset = match self.median_offset() {
            Some(offset) => offset,
            None => return Ok(()),
        };
        if network_offset.unsigned_abs() > self.tolerant_offset {
            return Err(network_offset);
        }
        Ok(())
    }

    /// Record a sample and warn when the median goes out of tolerance.
    pub fn observe(&mut self, offset: i64) {
        self.add_sample(offset);
        if let Err(median) = self.check() {
            warn!(
                target: "net",
                "local clock is {}ms away from the network median; \
                 check the system time",
                median
            );
        }
    }
}

impl Default for NetTimeChecker {
    fn default() -> Self {
        NetTimeChecker::new(MIN_SAMPLES, MAX_SAMPLES, TOLERANT_OFFSET)
    }
}
