//! Byzantine Fault Tolerant Krum Aggregation
//!
//! Implements the Krum algorithm (Blanchard et al., 2017) and its Multi-Krum
//! extension over flattened payload vectors.
//!
//! Reference: "Machine Learning with Adversaries: Byzantine Tolerant Gradient Descent"

use std::cmp::Ordering;

use ndarray::Array1;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::aggregation::BaseAggregator;
use crate::contribution::{AuxiliaryInfo, Contribution, Payload, PayloadLayout};
use crate::error::DefenseError;
use crate::math::squared_distance;
use crate::settings::DefenseSettings;

use super::{required, DefenseStrategy, DefenseType};

/// Check whether Krum's theoretical guarantee holds: `n >= 2f + 3`.
pub fn krum_condition_met(n: usize, f: usize) -> bool {
    n >= 2 * f + 3
}

/// Number of nearest neighbours summed into each score, `n - f - 2`.
///
/// Fails when fewer than one neighbour would remain.
pub fn neighbour_count(n: usize, f: usize) -> Result<usize, DefenseError> {
    match n.checked_sub(f + 2) {
        Some(k) if k >= 1 => Ok(k),
        _ => Err(DefenseError::config(format!(
            "krum needs n - f - 2 >= 1, got n={} and f={}",
            n, f
        ))),
    }
}

/// Krum scores: for each vector, the sum of squared distances to its
/// `k` nearest other vectors. NaN distances count as infinitely far.
pub fn krum_scores(vectors: &[Array1<f32>], k: usize) -> Vec<f64> {
    (0..vectors.len())
        .into_par_iter()
        .map(|i| {
            let mut distances: Vec<f64> = vectors
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, other)| squared_distance(vectors[i].view(), other.view()))
                .map(|d| if d.is_nan() { f64::INFINITY } else { d })
                .collect();
            distances.sort_by(|a, b| a.total_cmp(b));
            distances.iter().take(k).sum::<f64>()
        })
        .collect()
}

/// Indices ordered by ascending score, lowest index first among ties.
pub fn rank_by_score(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[a]
            .partial_cmp(&scores[b])
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });
    order
}

/// Krum selection, or Multi-Krum averaging of the `m` best contributions.
///
/// Multi-Krum only selects contributions with a positive weight.
#[derive(Clone, Debug)]
pub struct Krum {
    byzantine_client_num: usize,
    krum_param_m: usize,
}

impl Krum {
    /// Create the defense for `f` assumed Byzantine clients.
    ///
    /// `krum_param_m == 1` is plain Krum. When `expected_clients` is known,
    /// `n - f - 2 >= 1` and `m <= n` are checked now rather than at the
    /// first round.
    pub fn new(
        byzantine_client_num: usize,
        krum_param_m: usize,
        expected_clients: Option<usize>,
    ) -> Result<Self, DefenseError> {
        if krum_param_m < 1 {
            return Err(DefenseError::config("`krum_param_m` must be at least 1"));
        }
        let krum = Self {
            byzantine_client_num,
            krum_param_m,
        };
        if let Some(n) = expected_clients {
            krum.check_batch_size(n)?;
        }
        Ok(krum)
    }

    /// Build from `byzantine_client_num`, `krum_param_m` and `client_num_per_round`.
    pub fn from_settings(settings: &DefenseSettings) -> Result<Self, DefenseError> {
        let f = required(
            settings.byzantine_client_num,
            "byzantine_client_num",
            DefenseType::Krum,
        )?;
        Self::new(
            f,
            settings.krum_param_m.unwrap_or(1),
            settings.client_num_per_round,
        )
    }

    fn check_batch_size(&self, n: usize) -> Result<usize, DefenseError> {
        let k = neighbour_count(n, self.byzantine_client_num)?;
        if self.krum_param_m > n {
            return Err(DefenseError::config(format!(
                "`krum_param_m` {} exceeds the batch size {}",
                self.krum_param_m, n
            )));
        }
        Ok(k)
    }
}

impl DefenseStrategy for Krum {
    fn defense_type(&self) -> DefenseType {
        DefenseType::Krum
    }

    fn run(
        &self,
        batch: &[Contribution],
        base: &dyn BaseAggregator,
        _aux: &AuxiliaryInfo<'_>,
    ) -> Result<Payload, DefenseError> {
        let n = batch.len();
        let k = self.check_batch_size(n)?;
        if !krum_condition_met(n, self.byzantine_client_num) {
            warn!(
                n,
                f = self.byzantine_client_num,
                "Krum condition n >= 2f+3 not met, proceeding best-effort"
            );
        }

        let layout = PayloadLayout::of_batch(batch)?;
        let vectors = batch
            .iter()
            .map(|c| layout.flatten(&c.payload))
            .collect::<Result<Vec<_>, _>>()?;

        let scores = krum_scores(&vectors, k);
        let ranking = rank_by_score(&scores);
        debug!(n, k, selected = ranking[0], "krum scores computed");

        if self.krum_param_m == 1 {
            return Ok(batch[ranking[0]].payload.clone());
        }

        // Zero-weight contributions cannot move a weighted average
        let mut selected: Vec<usize> = ranking
            .iter()
            .copied()
            .filter(|&i| batch[i].weight > 0.0)
            .take(self.krum_param_m)
            .collect();
        if selected.is_empty() {
            return Err(DefenseError::ZeroTotalWeight);
        }
        selected.sort_unstable();
        let chosen: Vec<Contribution> = selected.iter().map(|&i| batch[i].clone()).collect();
        base.aggregate(&chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::WeightedMean;
    use ndarray::array;

    fn contribution(values: [f32; 2]) -> Contribution {
        let mut p = Payload::new();
        p.insert("w".to_string(), array![values[0], values[1]].into_dyn());
        Contribution::new(1.0, p)
    }

    fn run(krum: &Krum, batch: &[Contribution]) -> Result<Payload, DefenseError> {
        krum.run(batch, &WeightedMean, &AuxiliaryInfo::none())
    }

    #[test]
    fn test_krum_condition_met() {
        assert!(krum_condition_met(5, 1)); // 5 >= 2*1+3 = 5
        assert!(krum_condition_met(7, 2));
        assert!(!krum_condition_met(4, 1));
        assert!(!krum_condition_met(6, 2));
    }

    #[test]
    fn test_neighbour_count() {
        assert_eq!(neighbour_count(5, 1).unwrap(), 2);
        assert!(neighbour_count(4, 2).is_err());
        assert!(neighbour_count(1, 0).is_err());
    }

    #[test]
    fn test_krum_selects_honest() {
        let batch = vec![
            contribution([1.0, 1.1]),
            contribution([0.9, 1.0]),
            contribution([1.05, 0.95]),
            contribution([1.0, 1.0]),
            contribution([100.0, 100.0]), // Byzantine
        ];
        let krum = Krum::new(1, 1, None).unwrap();
        let result = run(&krum, &batch).unwrap();
        assert!(result["w"][[0]] < 2.0);
    }

    #[test]
    fn test_nan_contribution_rejected() {
        let mut batch = vec![contribution([f32::NAN, f32::NAN])];
        batch.extend(vec![contribution([1.0, 1.0]); 6]);
        let krum = Krum::new(1, 1, None).unwrap();
        assert!(matches!(
            run(&krum, &batch),
            Err(DefenseError::NonFiniteValue { index: 0, .. })
        ));
    }

    #[test]
    fn test_nan_vector_scores_worst() {
        let mut vectors = vec![array![f32::NAN, 0.0]];
        vectors.extend(vec![array![1.0f32, 1.0]; 4]);
        let scores = krum_scores(&vectors, 2);
        assert_eq!(scores[0], f64::INFINITY);
        assert_eq!(rank_by_score(&scores)[0], 1);
    }

    #[test]
    fn test_tie_break_lowest_index() {
        let scores = vec![3.0, 1.0, 1.0, 0.5, 0.5];
        assert_eq!(rank_by_score(&scores), vec![3, 4, 1, 2, 0]);
    }

    #[test]
    fn test_krum_determinism() {
        let batch = vec![
            contribution([1.0, 2.0]),
            contribution([1.1, 2.1]),
            contribution([0.9, 1.9]),
            contribution([1.05, 2.05]),
            contribution([50.0, 50.0]),
        ];
        let krum = Krum::new(1, 1, None).unwrap();
        let r1 = run(&krum, &batch).unwrap();
        let r2 = run(&krum, &batch).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn test_construction_rejects_small_expected_batch() {
        let err = Krum::new(2, 1, Some(4)).unwrap_err();
        assert!(err.is_configuration());
        assert!(Krum::new(1, 5, Some(4)).is_err());
        assert!(Krum::new(1, 0, None).is_err());
    }

    #[test]
    fn test_call_time_batch_check() {
        let krum = Krum::new(2, 1, None).unwrap();
        let batch = vec![contribution([1.0, 1.0]); 4];
        assert!(run(&krum, &batch).unwrap_err().is_configuration());
    }

    #[test]
    fn test_multi_krum_skips_zero_weight() {
        let mut batch = vec![Contribution::new(0.0, contribution([1.0, 1.0]).payload); 3];
        batch.push(contribution([1.1, 1.1]));
        batch.push(contribution([1.2, 1.2]));
        batch.push(contribution([80.0, 80.0]));
        let krum = Krum::new(1, 2, None).unwrap();
        let result = run(&krum, &batch).unwrap();
        assert!((result["w"][[0]] - 1.15).abs() < 1e-5);
    }

    #[test]
    fn test_multi_krum_averages_best() {
        let batch = vec![
            contribution([1.0, 1.0]),
            contribution([2.0, 2.0]),
            contribution([1.5, 1.5]),
            contribution([1.2, 1.2]),
            contribution([90.0, 90.0]),
        ];
        let krum = Krum::new(1, 3, None).unwrap();
        let result = run(&krum, &batch).unwrap();
        // Honest-only average, never touching the outlier
        assert!(result["w"][[0]] > 1.0 && result["w"][[0]] < 2.0);
    }
}
