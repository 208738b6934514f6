//! Small statistics used by scenario analysis

use std::time::Duration;

/// Percentile on a sorted copy: index `floor(len * p)` clamped to the last
/// element. Empty input yields zero.
pub fn percentile(samples: &[Duration], p: f64) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let index = ((sorted.len() as f64) * p.clamp(0.0, 1.0)).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

pub fn mean_duration(samples: &[Duration]) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let total: Duration = samples.iter().sum();
    average(total, samples.len())
}

fn average(total: Duration, count: usize) -> Duration {
    total.div_f64(count as f64)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation over mean; 0 when the mean is 0.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    let mean = mean(values);
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mean
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    #[test]
    fn test_percentile_sorts_and_clamps() {
        let samples = secs(&[9, 1, 5, 3, 7, 2, 8, 4, 6, 10]);
        assert_eq!(percentile(&samples, 0.5), Duration::from_secs(6));
        assert_eq!(percentile(&samples, 0.95), Duration::from_secs(10));
        assert_eq!(percentile(&samples, 1.0), Duration::from_secs(10));
        assert_eq!(percentile(&samples, 0.0), Duration::from_secs(1));
        assert_eq!(percentile(&[], 0.95), Duration::ZERO);
        assert_eq!(percentile(&secs(&[42]), 0.99), Duration::from_secs(42));
    }

    #[test]
    fn test_mean_duration() {
        assert_eq!(mean_duration(&secs(&[2, 4, 6])), Duration::from_secs(4));
        assert_eq!(mean_duration(&[]), Duration::ZERO);
        assert_eq!(mean_duration(&secs(&[1, 2])), Duration::from_millis(1500));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_average_beyond_u32_samples() {
        let count = u32::MAX as usize + 1;
        assert_eq!(average(Duration::from_secs(2 * count as u64), count), Duration::from_secs(2));
    }

    #[test]
    fn test_coefficient_of_variation() {
        assert_eq!(coefficient_of_variation(&[5.0, 5.0, 5.0]), 0.0);
        assert_eq!(coefficient_of_variation(&[]), 0.0);
        assert_eq!(coefficient_of_variation(&[0.0, 0.0]), 0.0);
        // moyenne 5, écart-type 2
        let cv = coefficient_of_variation(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((cv - 0.4).abs() < 1e-9);
    }
}
