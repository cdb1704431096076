use anyhow::Result;

use crate::checkpoint::Table;
use crate::math::log_sum_exp;

/// Normalized weights from log weights, `None` if no weight is positive.
///
/// Entries of `-inf` (rejected samples) get weight zero.
pub fn normalize_log_weights(log_weights: &[f64]) -> Option<Vec<f64>> {
    let total = log_sum_exp(log_weights);
    if !total.is_finite() {
        return None;
    }
    Some(log_weights.iter().map(|&lw| (lw - total).exp()).collect())
}

/// `exp(H) / N` with the Shannon entropy `H` of the normalized weights.
pub fn perplexity(weights: &[f64]) -> f64 {
    if weights.is_empty() {
        return 0.0;
    }
    let entropy: f64 = -weights
        .iter()
        .filter(|&&w| w > 0.0)
        .map(|&w| w * w.ln())
        .sum::<f64>();
    entropy.exp() / weights.len() as f64
}

/// `1 / (N Σ w²)` of the normalized weights.
pub fn effective_sample_size(weights: &[f64]) -> f64 {
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if sum_sq > 0.0 {
        1.0 / (weights.len() as f64 * sum_sq)
    } else {
        0.0
    }
}

/// Log of the mean importance weight, an estimate of the log evidence.
pub fn log_evidence(log_weights: &[f64]) -> f64 {
    log_sum_exp(log_weights) - (log_weights.len() as f64).ln()
}

/// Statistics of one chunk of importance samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkStatistics {
    pub step: usize,
    pub perplexity: f64,
    pub effective_sample_size: f64,
    pub log_evidence: f64,
    pub samples: usize,
    pub live_components: usize,
}

impl ChunkStatistics {
    pub fn from_log_weights(
        step: usize,
        log_weights: &[f64],
        weights: &[f64],
        live_components: usize,
    ) -> Self {
        Self {
            step,
            perplexity: perplexity(weights),
            effective_sample_size: effective_sample_size(weights),
            log_evidence: log_evidence(log_weights),
            samples: weights.len(),
            live_components,
        }
    }

    pub(crate) fn to_table(self, converged: bool) -> Result<Table> {
        let mut table = Table::new(&[
            ("perplexity", 1),
            ("effective sample size", 1),
            ("evidence", 1),
        ])
        .with_attribute("step", self.step as f64)
        .with_attribute("converged", if converged { 1.0 } else { 0.0 })
        .with_attribute("samples", self.samples as f64)
        .with_attribute("live components", self.live_components as f64);
        table.push(&[
            &[self.perplexity],
            &[self.effective_sample_size],
            &[self.log_evidence],
        ])?;
        Ok(table)
    }

    pub(crate) fn from_table(table: &Table) -> Result<Self> {
        Ok(Self {
            step: table.require_attribute("step")? as usize,
            perplexity: table.scalar(0, "perplexity")?,
            effective_sample_size: table.scalar(0, "effective sample size")?,
            log_evidence: table.scalar(0, "evidence")?,
            samples: table.attribute("samples").unwrap_or(0.0) as usize,
            live_components: table.attribute("live components").unwrap_or(0.0) as usize,
        })
    }
}

/// Summary of the sampler after a chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Status {
    pub iteration: usize,
    pub perplexity: f64,
    pub effective_sample_size: f64,
    pub log_evidence: f64,
    pub converged: bool,
}

impl Status {
    pub fn new(statistics: &ChunkStatistics, converged: bool) -> Self {
        Self {
            iteration: statistics.step,
            perplexity: statistics.perplexity,
            effective_sample_size: statistics.effective_sample_size,
            log_evidence: statistics.log_evidence,
            converged,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConvergenceCriteria {
    pub minimum_perplexity: f64,
    pub minimum_ess: f64,
    /// Number of chunks that have to be available before convergence is
    /// checked, also the length of the window for the stability test.
    pub minimum_steps: usize,
    pub maximum_relative_std_deviation: f64,
}

/// Converged once enough chunks have been drawn and either the latest
/// perplexity and ESS reach their minimum, or the perplexity of the last
/// `minimum_steps` chunks is stable.
pub fn check_convergence(history: &[ChunkStatistics], criteria: &ConvergenceCriteria) -> bool {
    let steps = criteria.minimum_steps.max(1);
    if history.len() < steps {
        return false;
    }
    let Some(last) = history.last() else {
        return false;
    };
    if last.perplexity >= criteria.minimum_perplexity
        && last.effective_sample_size >= criteria.minimum_ess
    {
        return true;
    }
    if steps < 2 {
        return false;
    }

    let window = &history[history.len() - steps..];
    let n = window.len() as f64;
    let mean = window.iter().map(|s| s.perplexity).sum::<f64>() / n;
    let variance = window
        .iter()
        .map(|s| (s.perplexity - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    mean > 0.0 && variance.sqrt() / mean < criteria.maximum_relative_std_deviation
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    use super::*;

    fn stats(step: usize, perplexity: f64, ess: f64) -> ChunkStatistics {
        ChunkStatistics {
            step,
            perplexity,
            effective_sample_size: ess,
            log_evidence: 0.0,
            samples: 100,
            live_components: 1,
        }
    }

    proptest! {
        #[test]
        fn weights_are_normalized(log_weights in proptest::collection::vec(-30f64..30f64, 1..200)) {
            let weights = normalize_log_weights(&log_weights).unwrap();
            let total: f64 = weights.iter().sum();
            prop_assert!((total - 1.0).abs() < 1e-9);
            let p = perplexity(&weights);
            let ess = effective_sample_size(&weights);
            prop_assert!(p > 0.0 && p <= 1.0 + 1e-12);
            prop_assert!(ess > 0.0 && ess <= 1.0 + 1e-12);
        }
    }

    #[test]
    fn uniform_weights_are_perfect() {
        let log_weights = vec![-2.0; 50];
        let weights = normalize_log_weights(&log_weights).unwrap();
        assert_abs_diff_eq!(perplexity(&weights), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(effective_sample_size(&weights), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(log_evidence(&log_weights), -2.0, epsilon = 1e-12);
    }

    #[test]
    fn rejected_samples() {
        let log_weights = [0.0, f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY];
        let weights = normalize_log_weights(&log_weights).unwrap();
        assert_eq!(weights, vec![0.5, 0.0, 0.5, 0.0]);
        assert_abs_diff_eq!(perplexity(&weights), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(effective_sample_size(&weights), 0.5, epsilon = 1e-12);
        assert!(normalize_log_weights(&[f64::NEG_INFINITY; 3]).is_none());
    }

    #[test]
    fn convergence_needs_history() {
        let criteria = ConvergenceCriteria {
            minimum_perplexity: 0.9,
            minimum_ess: 0.8,
            minimum_steps: 3,
            maximum_relative_std_deviation: 0.01,
        };
        let good = [stats(0, 0.95, 0.9), stats(1, 0.95, 0.9)];
        assert!(!check_convergence(&good, &criteria));
        let good = [stats(0, 0.2, 0.1), stats(1, 0.5, 0.4), stats(2, 0.95, 0.9)];
        assert!(check_convergence(&good, &criteria));

        let drifting = [stats(0, 0.2, 0.1), stats(1, 0.5, 0.4), stats(2, 0.6, 0.5)];
        assert!(!check_convergence(&drifting, &criteria));
        let stable = [stats(0, 0.6, 0.1), stats(1, 0.601, 0.1), stats(2, 0.6, 0.1)];
        assert!(check_convergence(&stable, &criteria));
    }

    #[test]
    fn table_round_trip() {
        let original = stats(4, 0.5, 0.25);
        let table = original.to_table(true).unwrap();
        assert_eq!(table.attribute("converged"), Some(1.0));
        assert_eq!(ChunkStatistics::from_table(&table).unwrap(), original);
    }
}
