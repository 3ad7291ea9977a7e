use std::collections::HashMap;

use savd_proto::Observation;

/// Sliding-window flood detector.
///
/// Buckets are keyed by the raw packet timestamp (bit pattern, never
/// rounded), so only captures with exactly equal timestamps coalesce.
/// Each pass aggregates surviving buckets into a per-(src, dst) baseline,
/// flags baselines above the threshold, then advances the window and
/// resets the baseline: a pass only reports that epoch's excess.
pub struct DdosDetector {
    count_array: HashMap<(String, String, u64), u64>,
    baseline: HashMap<(String, String), u64>,
    window_left: f64,
    window_right: f64,
    threshold: u64,
}

impl DdosDetector {
    pub fn new(threshold: u64) -> Self {
        Self {
            count_array: HashMap::new(),
            baseline: HashMap::new(),
            window_left: 0.0,
            window_right: 0.0,
            threshold,
        }
    }

    /// Ingests one batch and returns the (src, dst) pairs whose baseline
    /// exceeded the threshold this pass. Order follows map iteration;
    /// callers must not rely on it.
    pub fn detect(
        &mut self,
        batch: &[Observation],
    ) -> Vec<(String, String)> {
        for row in batch {
            let timestamp = row.timestamp;
            if self.window_left == 0.0 {
                self.window_left = timestamp;
            }
            if timestamp > self.window_right {
                self.window_right = timestamp;
            }

            if row.src_ip.is_empty() || row.dst_ip.is_empty() {
                continue;
            }

            let key =
                (row.src_ip.clone(), row.dst_ip.clone(), timestamp.to_bits());
            *self.count_array.entry(key).or_insert(0) += 1;
        }

        let window_left = self.window_left;
        let baseline = &mut self.baseline;
        self.count_array.retain(|(src, dst, ts_bits), count| {
            if f64::from_bits(*ts_bits) < window_left {
                return false;
            }
            *baseline.entry((src.clone(), dst.clone())).or_insert(0) += *count;
            true
        });

        let mut flagged = Vec::new();
        for ((src, dst), total) in &self.baseline {
            if *total > self.threshold {
                flagged.push((src.clone(), dst.clone()));
            }
        }

        self.window_left = self.window_right;
        self.baseline.clear();
        flagged
    }

    #[cfg(test)]
    fn bucket_count(
        &self,
        src: &str,
        dst: &str,
        timestamp: f64,
    ) -> u64 {
        self.count_array
            .get(&(src.to_string(), dst.to_string(), timestamp.to_bits()))
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn window(&self) -> (f64, f64) {
        (self.window_left, self.window_right)
    }
}

#[cfg(test)]
mod tests {
    use savd_proto::{Observation, Protocol};

    use super::DdosDetector;

    fn row(
        src: &str,
        dst: &str,
        timestamp: f64,
    ) -> Observation {
        Observation {
            src_ip: src.to_string(),
            dst_ip: dst.to_string(),
            src_port: 80,
            dst_port: 80,
            protocol: Protocol::Tcp,
            flags: Some("SYN".to_string()),
            timestamp,
            length: 100,
        }
    }

    #[test]
    fn identical_keys_accumulate_in_one_bucket() {
        let mut detector = DdosDetector::new(1000);
        let batch: Vec<_> =
            (0..5).map(|_| row("10.0.0.1", "10.0.0.2", 1_000.0)).collect();

        detector.detect(&batch);
        assert_eq!(detector.bucket_count("10.0.0.1", "10.0.0.2", 1_000.0), 5);

        detector.detect(&batch);
        assert_eq!(detector.bucket_count("10.0.0.1", "10.0.0.2", 1_000.0), 10);
    }

    #[test]
    fn distinct_timestamps_never_coalesce() {
        let mut detector = DdosDetector::new(1000);
        let batch = vec![
            row("10.0.0.1", "10.0.0.2", 1_000.0),
            row("10.0.0.1", "10.0.0.2", 1_000.000001),
        ];

        detector.detect(&batch);
        assert_eq!(detector.bucket_count("10.0.0.1", "10.0.0.2", 1_000.0), 1);
        assert_eq!(
            detector.bucket_count("10.0.0.1", "10.0.0.2", 1_000.000001),
            1
        );
    }

    #[test]
    fn threshold_crossing_flags_the_pair() {
        let mut detector = DdosDetector::new(100);
        let batch: Vec<_> = (0..150)
            .map(|_| row("10.0.0.1", "10.0.0.2", 1_000_000.0))
            .collect();

        let flagged = detector.detect(&batch);
        assert_eq!(
            flagged,
            vec![("10.0.0.1".to_string(), "10.0.0.2".to_string())]
        );
    }

    #[test]
    fn count_at_threshold_is_not_flagged() {
        let mut detector = DdosDetector::new(100);
        let batch: Vec<_> = (0..100)
            .map(|_| row("10.0.0.1", "10.0.0.2", 1_000_000.0))
            .collect();

        assert!(detector.detect(&batch).is_empty());
    }

    #[test]
    fn stale_buckets_are_dropped_before_the_next_pass() {
        let mut detector = DdosDetector::new(1000);

        detector.detect(&[row("10.0.0.1", "10.0.0.2", 100.0)]);
        // window is now [100, 100]; the old bucket survives the next pass
        detector.detect(&[row("10.0.0.1", "10.0.0.2", 200.0)]);
        assert_eq!(detector.bucket_count("10.0.0.1", "10.0.0.2", 100.0), 1);

        // window advanced to 200; the 100 bucket is pruned on this pass
        detector.detect(&[row("10.0.0.1", "10.0.0.2", 300.0)]);
        assert_eq!(detector.bucket_count("10.0.0.1", "10.0.0.2", 100.0), 0);
        assert_eq!(detector.bucket_count("10.0.0.1", "10.0.0.2", 200.0), 1);
    }

    #[test]
    fn baseline_resets_between_passes_but_buckets_persist() {
        let mut detector = DdosDetector::new(100);
        let batch: Vec<_> = (0..60)
            .map(|_| row("10.0.0.1", "10.0.0.2", 1_000.0))
            .collect();

        assert!(detector.detect(&batch).is_empty());
        // the surviving bucket now holds 120 and the aggregated baseline
        // crosses the threshold on this pass
        let flagged = detector.detect(&batch);
        assert_eq!(
            flagged,
            vec![("10.0.0.1".to_string(), "10.0.0.2".to_string())]
        );
    }

    #[test]
    fn empty_endpoints_are_skipped_but_still_move_the_window() {
        let mut detector = DdosDetector::new(10);
        let flagged = detector.detect(&[row("", "", 500.0)]);

        assert!(flagged.is_empty());
        assert_eq!(detector.window(), (500.0, 500.0));
        assert_eq!(detector.bucket_count("", "", 500.0), 0);
    }

    #[test]
    fn window_right_is_monotone() {
        let mut detector = DdosDetector::new(10);
        detector.detect(&[row("10.0.0.1", "10.0.0.2", 900.0)]);
        detector.detect(&[row("10.0.0.1", "10.0.0.2", 400.0)]);
        let (_, right) = detector.window();
        assert_eq!(right, 900.0);
    }
}
