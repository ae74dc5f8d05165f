//! Per-sweep evaluation of a network against encoded datasets.

use std::{ fs, path::Path };
use rayon::prelude::*;
use serde::{ Deserialize, Serialize };
use crate::{
    ComplexScalar,
    config::LabelMode,
    encoding::EncodedDataset,
    loss::{ LOG_FLOOR, Loss, real_loss, sample_weights },
    mps::{ MPS, MPSResult },
};

/// Scores of a network on a single dataset split.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitMetrics {
    /// The configured loss, weighted according to the label mode, evaluated
    /// on full-network outputs.
    pub loss: f64,
    /// Fraction of samples whose label has the largest |ŷ|².
    pub accuracy: f64,
    /// Mean of `-ln |ŷ_label|²`.
    pub divergence: f64,
}

impl SplitMetrics {
    /// Evaluate `mps` on every state of `dataset`, in parallel on `pool`.
    pub fn evaluate<A>(
        mps: &MPS<A>,
        dataset: &EncodedDataset<A>,
        loss: Loss,
        mode: LabelMode,
        pool: &rayon::ThreadPool,
    ) -> MPSResult<Self>
    where A: ComplexScalar
    {
        let weights = sample_weights(dataset, mode);
        let m = dataset.len().max(1) as f64;
        let (total, correct, div): (A, usize, f64) =
            pool.install(|| {
                dataset.states().par_iter().zip(weights.par_iter())
                    .map(|(s, w)| -> MPSResult<(A, usize, f64)> {
                        let yhat = mps.amplitudes(s)?;
                        let (l, _) = loss.sample_in(mode, &yhat, s.label());
                        let probs: Vec<f64> =
                            yhat.iter().map(|y| y.modulus_squared()).collect();
                        let pred =
                            probs.iter().enumerate()
                            .max_by(|(_, a), (_, b)| a.total_cmp(b))
                            .map(|(k, _)| k);
                        let hit = usize::from(pred == Some(s.label()));
                        let p = probs.get(s.label()).copied().unwrap_or(0.0);
                        Ok((l * A::from_re(*w), hit, -p.max(LOG_FLOOR).ln()))
                    })
                    .try_reduce(
                        || (A::zero(), 0, 0.0),
                        |a, b| Ok((a.0 + b.0, a.1 + b.1, a.2 + b.2)),
                    )
            })?;
        Ok(Self {
            loss: real_loss(total),
            accuracy: correct as f64 / m,
            divergence: div / m,
        })
    }
}

/// Where in a training run a row of metrics was recorded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Before the first sweep.
    Initial,
    /// After the given (1-based) full sweep.
    Sweep(usize),
    /// After the final normalization.
    Final,
}

/// Metrics for every provided split at one point of a training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepMetrics {
    pub stage: Stage,
    pub train: SplitMetrics,
    pub validation: Option<SplitMetrics>,
    pub test: Option<SplitMetrics>,
    /// Largest bond dimension of the network.
    pub max_bond_dim: usize,
    /// Norm of the network.
    pub norm: f64,
}

/// All metrics of a training run, in order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub rows: Vec<SweepMetrics>,
}

impl TrainingHistory {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, row: SweepMetrics) { self.rows.push(row); }

    pub fn len(&self) -> usize { self.rows.len() }

    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    pub fn first(&self) -> Option<&SweepMetrics> { self.rows.first() }

    pub fn last(&self) -> Option<&SweepMetrics> { self.rows.last() }

    /// Return the training loss of every row.
    pub fn train_loss(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.train.loss).collect()
    }

    /// Return the training accuracy of every row.
    pub fn train_accuracy(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.train.accuracy).collect()
    }

    /// Write the history to a JSON file.
    pub fn save<P>(&self, path: P) -> MPSResult<()>
    where P: AsRef<Path>
    {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray as nd;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::encoding::{ Basis, BasisArgs, Split };

    #[test]
    fn metrics_are_bounded() {
        let data = nd::Array2::from_shape_fn((8, 4), |(i, k)| ((i + k) % 5) as f64 / 5.0);
        let labels: Vec<usize> = (0..8).map(|i| i % 2).collect();
        let ds: EncodedDataset<f64> =
            EncodedDataset::encode(
                &data, &labels, &Basis::Angle, &BasisArgs::Empty, 2, Split::Test)
            .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mps: MPS<f64> = MPS::new_random(4, 2, 2, 2, &mut rng).unwrap();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let m = SplitMetrics::evaluate(&mps, &ds, Loss::Mse, LabelMode::Merged, &pool)
            .unwrap();
        assert!((0.0..=1.0).contains(&m.accuracy));
        assert!(m.loss >= 0.0);
        assert!(m.divergence >= 0.0);
    }

    #[test]
    fn history_serializes() {
        let mut h = TrainingHistory::new();
        h.push(SweepMetrics {
            stage: Stage::Initial,
            train: SplitMetrics { loss: 1.0, accuracy: 0.5, divergence: 2.0 },
            validation: None,
            test: None,
            max_bond_dim: 4,
            norm: 1.0,
        });
        let s = serde_json::to_string(&h).unwrap();
        let back: TrainingHistory = serde_json::from_str(&s).unwrap();
        assert_eq!(back, h);
        assert_eq!(h.train_loss(), vec![1.0]);
    }
}
