use super::AnalyzeError;

/// A simple series of observations for baseline statistics.
pub struct TimeSeries {
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        sum_sq_diff / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Z = (value - mean) / std_dev, against a baseline of at least
    /// `min_samples` points.
    ///
    /// A constant baseline makes any deviation infinitely anomalous.
    pub fn z_score(&self, value: f64, min_samples: usize) -> Result<f64, AnalyzeError> {
        let needed = min_samples.max(1);
        if self.values.len() < needed {
            return Err(AnalyzeError::InsufficientBaseline {
                needed,
                have: self.values.len(),
            });
        }
        let std = self.std_dev();
        let diff = value - self.mean();
        if std == 0.0 {
            if diff.abs() > f64::EPSILON {
                return Ok(diff.signum() * f64::INFINITY);
            }
            return Ok(0.0);
        }
        Ok(diff / std)
    }
}

/// Pearson correlation of two equally long series.
///
/// `None` when the series are too short or either one is constant.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let ta = TimeSeries::new(a.to_vec());
    let tb = TimeSeries::new(b.to_vec());
    let (ma, mb) = (ta.mean(), tb.mean());

    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        cov += (x - ma) * (y - mb);
        va += (x - ma).powi(2);
        vb += (y - mb).powi(2);
    }
    if va == 0.0 || vb == 0.0 {
        return None;
    }
    Some((cov / (va.sqrt() * vb.sqrt())).clamp(-1.0, 1.0))
}

/// Highest correlation of `a` leading `b` or `b` leading `a` by up to
/// `max_lag` steps.
pub fn max_lagged_correlation(a: &[f64], b: &[f64], max_lag: usize) -> Option<f64> {
    let n = a.len().min(b.len());
    let mut best: Option<f64> = None;
    for lag in 0..=max_lag {
        if n < lag + 2 {
            break;
        }
        let candidates = [
            pearson(&a[..n - lag], &b[lag..n]),
            pearson(&b[..n - lag], &a[lag..n]),
        ];
        for r in candidates.into_iter().flatten() {
            best = Some(best.map_or(r, |cur: f64| cur.max(r)));
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats() {
        let ts = TimeSeries::new(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(ts.mean(), 3.0);
        // Population variance of 1..5 is 2.0.
        assert!((ts.variance() - 2.0).abs() < 1e-9);
        let z = ts.z_score(10.0, 3).unwrap();
        assert!(z > 4.9);
    }

    #[test]
    fn test_z_score_needs_baseline() {
        let ts = TimeSeries::new(vec![1.0, 2.0]);
        assert!(matches!(
            ts.z_score(5.0, 3),
            Err(AnalyzeError::InsufficientBaseline { needed: 3, have: 2 })
        ));
    }

    #[test]
    fn test_z_score_constant_baseline() {
        let ts = TimeSeries::new(vec![0.0; 5]);
        assert_eq!(ts.z_score(0.0, 3).unwrap(), 0.0);
        assert_eq!(ts.z_score(2.0, 3).unwrap(), f64::INFINITY);
    }

    #[test]
    fn test_pearson() {
        let r = pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]).unwrap();
        assert!((r - 1.0).abs() < 1e-9);
        let r = pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]).unwrap();
        assert!((r + 1.0).abs() < 1e-9);
        assert!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]).is_none());
        assert!(pearson(&[1.0], &[1.0]).is_none());
    }

    #[test]
    fn test_lagged_correlation_finds_shift() {
        let a = [0.0, 3.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0];
        let b = [0.0, 0.0, 3.0, 0.0, 0.0, 2.0, 0.0, 0.0];
        let unlagged = pearson(&a, &b).unwrap();
        let best = max_lagged_correlation(&a, &b, 2).unwrap();
        assert!(unlagged < 0.5);
        assert!(best > 0.99);
    }
}
