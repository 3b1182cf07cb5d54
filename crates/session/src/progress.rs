/// Decides when transferred bytes are worth persisting.
///
/// Progress is only written when the integer percentage advances, so a
/// large file costs at most a hundred repository writes.
#[derive(Debug, Clone)]
pub struct ProgressBuckets {
    total: u64,
    last_percent: u64,
}

impl ProgressBuckets {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            last_percent: 0,
        }
    }

    pub fn percent(&self, position: u64) -> u64 {
        if self.total == 0 {
            return 0;
        }
        (position.min(self.total) as u128 * 100 / self.total as u128) as u64
    }

    /// Returns `true` when `position` lands in a new bucket.
    pub fn advance(&mut self, position: u64) -> bool {
        let percent = self.percent(position);
        if percent > self.last_percent {
            self.last_percent = percent;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_once_per_bucket() {
        let mut buckets = ProgressBuckets::new(1000);
        assert!(!buckets.advance(5));
        assert!(buckets.advance(10));
        assert!(!buckets.advance(19));
        assert!(buckets.advance(500));
        assert!(!buckets.advance(500));
        assert!(buckets.advance(1000));
        assert_eq!(buckets.percent(2000), 100);
    }

    #[test]
    fn zero_total_never_emits() {
        let mut buckets = ProgressBuckets::new(0);
        assert!(!buckets.advance(10));
    }

    #[test]
    fn write_count_is_bounded() {
        let total = 10_000_000;
        let mut buckets = ProgressBuckets::new(total);
        let writes = (0..=total)
            .step_by(997)
            .filter(|&p| buckets.advance(p))
            .count();
        assert!(writes <= 100);
    }
}
