//! Loss functions and their gradients with respect to a bond tensor.
//!
//! With the environments of a bond fixed, the network output for sample *i*
//! is linear in the bond tensor *B*:
//!
//! <blockquote>
//!   <p style="font-size:20px">
//!     <i>ŷ</i><sub><i>l</i></sub> = Σ <i>B</i><sub><i>l</i>,…</sub>
//!       <i>φ̃</i><sub><i>i</i>,…</sub>
//!   </p>
//! </blockquote>
//!
//! where *φ̃<sub>i</sub>* is the *projected state*: the left and right
//! environments of the sample joined by the conjugated vectors of the two bond
//! sites. Every loss here has a gradient of the form *c* ⊗ conj(*φ̃*) for a
//! coefficient vector *c* over the label, which is what [`Loss::sample`]
//! returns. Coefficients are scaled so that *c* ⊗ conj(*φ̃*) is the gradient
//! of the reported loss with respect to the real and imaginary parts of *B*.
//!
//! In [`LabelMode::Separated`] a sample of class *c* only sees the one-hot
//! slice *B*·*e<sub>c</sub>* of the bond tensor, with target 1, so that it
//! contributes nothing to the slices of other classes.

use std::{ ops::Range, str::FromStr };
use rayon::prelude::*;
use serde::{ Deserialize, Serialize };
use tracing::warn;
use crate::{
    ComplexScalar,
    cache::EnvCache,
    config::{ ConfigError, LabelMode },
    encoding::EncodedDataset,
    mps::{ MPSIndex, MPSTensor },
    tensor::{ Idx, Tensor, TensorError, TensorResult },
};

/// Smallest value of |ŷ<sub>label</sub>|² admitted in the log loss.
pub const LOG_FLOOR: f64 = 1e-12;

/// Imaginary loss residuals larger than this are reported.
pub const IMAG_TOL: f64 = 1e-8;

/// Closed set of per-sample losses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Loss {
    /// `½ ‖ŷ - y‖²` against a one-hot target.
    Mse,
    /// Log loss `-ln |ŷ_label|²`, with |ŷ_label|² floored at [`LOG_FLOOR`].
    #[default]
    Kld,
    /// `Kld + alpha * Mse`.
    Mixed { alpha: f64 },
}

impl FromStr for Loss {
    type Err = ConfigError;

    /// Parse `mse`, `kld` (or `log`), or `mixed[:alpha]` (alpha defaults to
    /// 1).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.split_once(':') {
            None if lower == "mse" => Ok(Self::Mse),
            None if lower == "kld" || lower == "log" => Ok(Self::Kld),
            None if lower == "mixed" => Ok(Self::Mixed { alpha: 1.0 }),
            Some(("mixed", alpha)) => {
                let alpha: f64 = alpha.parse()
                    .map_err(|_| ConfigError::invalid_value("loss", format!("bad alpha in {s:?}")))?;
                Ok(Self::Mixed { alpha })
            },
            _ => Err(ConfigError::UnknownLoss(s.to_string())),
        }
    }
}

// clamp |z|² away from zero, keeping the phase
fn floored<A>(z: A) -> A
where A: ComplexScalar
{
    let min = LOG_FLOOR.sqrt();
    let m = z.modulus();
    if m >= min {
        z
    } else if m > 0.0 {
        z * A::from_re(min / m)
    } else {
        A::from_re(min)
    }
}

impl Loss {
    /// Return the loss of a single output vector `yhat` against class
    /// `label`, along with the gradient coefficients *c* (see the module
    /// docs).
    ///
    /// The loss is returned as a value of `A`; only its real part is
    /// meaningful.
    pub fn sample<A>(&self, yhat: &[A], label: usize) -> (A, Vec<A>)
    where A: ComplexScalar
    {
        let mse = || -> (A, Vec<A>) {
            let diff: Vec<A> =
                yhat.iter().enumerate()
                .map(|(l, y)| if l == label { *y - A::one() } else { *y })
                .collect();
            let loss: A =
                diff.iter().map(|z| z.conjugate() * *z).fold(A::zero(), |acc, z| acc + z)
                * A::from_re(0.5);
            (loss, diff)
        };
        let kld = || -> (A, Vec<A>) {
            let y = floored(yhat[label]);
            let loss = -(y.conjugate() * y).ln();
            let mut coeffs = vec![A::zero(); yhat.len()];
            coeffs[label] = -(y.conjugate() * A::from_re(0.5)).recip();
            (loss, coeffs)
        };
        match self {
            Self::Mse => mse(),
            Self::Kld => kld(),
            Self::Mixed { alpha } => {
                let a = A::from_re(*alpha);
                let (lk, ck) = kld();
                let (lm, cm) = mse();
                let coeffs = ck.into_iter().zip(cm).map(|(k, m)| k + a * m).collect();
                (lk + a * lm, coeffs)
            },
        }
    }

    /// Like [`sample`][Self::sample], but under a label mode.
    ///
    /// In [`LabelMode::Separated`] only the `label` entry of `yhat` is scored
    /// (against a target of 1) and the other coefficients are zero.
    pub fn sample_in<A>(&self, mode: LabelMode, yhat: &[A], label: usize) -> (A, Vec<A>)
    where A: ComplexScalar
    {
        match mode {
            LabelMode::Merged => self.sample(yhat, label),
            LabelMode::Separated => {
                let (l, c) = self.sample(&yhat[label..=label], 0);
                let mut coeffs = vec![A::zero(); yhat.len()];
                coeffs[label] = c[0];
                (l, coeffs)
            },
        }
    }
}

/// Return the weight of every sample in a dataset under a label mode.
///
/// In [`LabelMode::Merged`] every sample is weighted `1/M`. In
/// [`LabelMode::Separated`] samples of class *c* are weighted
/// `1/(n_c C)`, where `C` is the number of classes present, so that every
/// class contributes equally and a balanced dataset gets the same weights as
/// in merged mode.
pub fn sample_weights<A>(dataset: &EncodedDataset<A>, mode: LabelMode) -> Vec<f64>
where A: ComplexScalar
{
    let m = dataset.len();
    match mode {
        LabelMode::Merged => vec![1.0 / m as f64; m],
        LabelMode::Separated => {
            let present = dataset.classes_present() as f64;
            dataset.states().iter()
                .map(|s| {
                    let nc = dataset.class_range(s.label()).len() as f64;
                    1.0 / (nc * present)
                })
                .collect()
        },
    }
}

/// Reduce a complex-valued total loss to its real part, reporting any
/// imaginary residual.
pub fn real_loss<A>(total: A) -> f64
where A: ComplexScalar
{
    let (re, im) = total.components();
    if im.abs() > IMAG_TOL {
        warn!(re, im, "loss has a non-negligible imaginary part");
    }
    re
}

/// The local optimization problem posed by a single bond.
///
/// Projected states for every training sample are computed once up front, so
/// repeated evaluations only cost one contraction per sample.
pub struct BondProblem<'a, A>
where A: ComplexScalar
{
    projected: Vec<MPSTensor<A>>,
    labels: Vec<usize>,
    weights: Vec<f64>,
    class_ranges: Vec<Range<usize>>,
    nclasses: usize,
    loss: Loss,
    mode: LabelMode,
    pool: &'a rayon::ThreadPool,
}

impl<'a, A> BondProblem<'a, A>
where A: ComplexScalar
{
    /// Set up the problem for bond `bond`, reading environments from `cache`.
    ///
    /// The bond tensor to be optimized must carry the label index with
    /// dimension `nclasses`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bond: usize,
        nsites: usize,
        cache: &EnvCache<A>,
        dataset: &EncodedDataset<A>,
        nclasses: usize,
        loss: Loss,
        mode: LabelMode,
        pool: &'a rayon::ThreadPool,
    ) -> TensorResult<Self>
    {
        let states = dataset.states();
        let projected: Vec<MPSTensor<A>> =
            pool.install(|| {
                states.par_iter()
                    .map(|s| -> TensorResult<MPSTensor<A>> {
                        let sb = s.sites()[bond].conj();
                        let sb1 = s.sites()[bond + 1].conj();
                        let mut phi =
                            if bond > 0 {
                                cache.left(bond - 1, s.id()).contract(&sb)?
                            } else {
                                sb
                            };
                        phi = phi.contract(&sb1)?;
                        if bond + 2 < nsites {
                            phi = phi.contract(cache.right(bond + 2, s.id()))?;
                        }
                        Ok(phi)
                    })
                    .collect::<TensorResult<_>>()
            })?;
        Ok(Self {
            projected,
            labels: states.iter().map(|s| s.label()).collect(),
            weights: sample_weights(dataset, mode),
            class_ranges:
                (0..dataset.num_classes()).map(|c| dataset.class_range(c)).collect(),
            nclasses,
            loss,
            mode,
            pool,
        })
    }

    fn check(&self, bond_tensor: &MPSTensor<A>) -> TensorResult<()> {
        match bond_tensor.indices().first() {
            Some(idx @ MPSIndex::Label { .. }) if idx.dim() == self.nclasses => Ok(()),
            Some(idx @ MPSIndex::Label { .. }) => {
                Err(TensorError::IncompatibleDims(idx.label(), idx.dim(), self.nclasses))
            },
            _ => Err(TensorError::MissingIndex(MPSIndex::class(self.nclasses).label())),
        }
    }

    /// Compute the weighted total loss.
    pub fn loss(&self, bond_tensor: &MPSTensor<A>) -> TensorResult<f64> {
        self.check(bond_tensor)?;
        let total: A =
            self.pool.install(|| {
                self.projected.par_iter()
                    .zip(self.labels.par_iter().zip(self.weights.par_iter()))
                    .map(|(phi, (label, w))| -> TensorResult<A> {
                        let y = bond_tensor.contract(phi)?;
                        let (l, _) =
                            self.loss.sample_in(self.mode, y.elems().as_slice(), *label);
                        Ok(l * A::from_re(*w))
                    })
                    .try_reduce(A::zero, |a, b| Ok(a + b))
            })?;
        Ok(real_loss(total))
    }

    /// Compute the weighted total loss and its gradient, which carries the
    /// same indices as `bond_tensor`.
    pub fn loss_grad(&self, bond_tensor: &MPSTensor<A>)
        -> TensorResult<(f64, MPSTensor<A>)>
    {
        self.accumulate(bond_tensor, 0..self.projected.len())
    }

    /// Compute the part of [`loss_grad`][Self::loss_grad] contributed by the
    /// samples of class `class`. The per-class parts sum to the total.
    pub fn class_loss_grad(&self, bond_tensor: &MPSTensor<A>, class: usize)
        -> TensorResult<(f64, MPSTensor<A>)>
    {
        let range = self.class_ranges.get(class).cloned().unwrap_or(0..0);
        self.accumulate(bond_tensor, range)
    }

    // weighted loss and gradient over the samples with ids in `range`
    fn accumulate(&self, bond_tensor: &MPSTensor<A>, range: Range<usize>)
        -> TensorResult<(f64, MPSTensor<A>)>
    {
        self.check(bond_tensor)?;
        let label_idx = bond_tensor.indices()[0];
        let zero: MPSTensor<A> = Tensor::zeros(bond_tensor.indices().iter().copied())?;
        let projected = &self.projected[range.clone()];
        let labels = &self.labels[range.clone()];
        let weights = &self.weights[range];
        let (total, grad): (A, MPSTensor<A>) =
            self.pool.install(|| {
                projected.par_iter()
                    .zip(labels.par_iter().zip(weights.par_iter()))
                    .try_fold(
                        || (A::zero(), zero.clone()),
                        |(mut l_acc, mut g_acc), (phi, (label, w))|
                            -> TensorResult<(A, MPSTensor<A>)>
                        {
                            let y = bond_tensor.contract(phi)?;
                            let (l, coeffs) =
                                self.loss.sample_in(self.mode, y.elems().as_slice(), *label);
                            let c = Tensor::new([label_idx], |pos| coeffs[pos[0]])?;
                            let g = c.contract(&phi.conj())?;
                            g_acc.axpy(A::from_re(*w), &g)?;
                            l_acc += l * A::from_re(*w);
                            Ok((l_acc, g_acc))
                        },
                    )
                    .try_reduce(
                        || (A::zero(), zero.clone()),
                        |(la, mut ga), (lb, gb)| {
                            ga.axpy(A::one(), &gb)?;
                            Ok((la + lb, ga))
                        },
                    )
            })?;
        Ok((real_loss(total), grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray as nd;
    use num_complex::Complex64 as C64;
    use rand::{ Rng, SeedableRng, rngs::StdRng };
    use crate::{
        encoding::{ Basis, BasisArgs, Split },
        mps::{ Direction, MPS },
    };

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    // 4 sites, angle map, d = 2
    fn dataset<A>(labels: &[usize]) -> EncodedDataset<A>
    where A: ComplexScalar
    {
        let data = nd::Array2::from_shape_fn((labels.len(), 4), |(i, k)| {
            ((3 * i + 5 * k) % 11) as f64 / 10.0
        });
        EncodedDataset::encode(&data, labels, &Basis::Angle, &BasisArgs::Empty, 2, Split::Train)
            .unwrap()
    }

    // problem at the last bond of a random 2-class network, with its current
    // bond tensor
    fn setup<'a, A>(
        pool: &'a rayon::ThreadPool,
        labels: &[usize],
        loss: Loss,
        mode: LabelMode,
        seed: u64,
    ) -> (BondProblem<'a, A>, MPSTensor<A>)
    where A: ComplexScalar
    {
        let mut rng = StdRng::seed_from_u64(seed);
        let mps: MPS<A> = MPS::new_random(4, 2, 3, 2, &mut rng).unwrap();
        let ds = dataset::<A>(labels);
        let cache = EnvCache::build(&mps, &ds, Direction::Left).unwrap();
        let problem = BondProblem::new(2, 4, &cache, &ds, 2, loss, mode, pool).unwrap();
        (problem, mps.bond_tensor(2).unwrap())
    }

    // compare directional derivatives against central differences
    fn check_gradient<A>(loss: Loss, mode: LabelMode, seed: u64)
    where A: ComplexScalar
    {
        let pool = pool();
        let (problem, b) = setup::<A>(&pool, &[0, 0, 0, 1, 1], loss, mode, seed);
        let (l0, grad) = problem.loss_grad(&b).unwrap();
        assert_abs_diff_eq!(l0, problem.loss(&b).unwrap(), epsilon = 1e-12);
        let mut rng = StdRng::seed_from_u64(seed + 1);
        let h = 1e-6;
        for _ in 0..3 {
            let dir: MPSTensor<A> =
                Tensor::new(b.indices().iter().copied(), |_| {
                    A::from_components(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
                })
                .unwrap();
            let mut plus = b.clone();
            plus.axpy(A::from_re(h), &dir).unwrap();
            let mut minus = b.clone();
            minus.axpy(A::from_re(-h), &dir).unwrap();
            let fd =
                (problem.loss(&plus).unwrap() - problem.loss(&minus).unwrap()) / (2.0 * h);
            let analytic = grad.dotc(&dir).unwrap().real();
            assert!(
                (fd - analytic).abs() <= 1e-5 * analytic.abs().max(1.0),
                "{loss:?}, {mode:?}, complex = {}: {fd} vs {analytic}",
                A::IS_COMPLEX,
            );
        }
    }

    #[test]
    fn gradients_match_finite_differences() {
        let losses = [Loss::Mse, Loss::Kld, Loss::Mixed { alpha: 0.7 }];
        for (k, loss) in losses.into_iter().enumerate() {
            for mode in [LabelMode::Merged, LabelMode::Separated] {
                check_gradient::<f64>(loss, mode, 100 + k as u64);
                check_gradient::<C64>(loss, mode, 200 + k as u64);
            }
        }
    }

    #[test]
    fn separated_mode_leaves_other_slices_alone() {
        let pool = pool();
        let slice = |g: &MPSTensor<f64>, c: usize| -> f64 {
            g.contract(&Tensor::onehot(MPSIndex::class(2), c).unwrap()).unwrap().norm()
        };
        let (problem, b) =
            setup::<f64>(&pool, &[0, 0, 0], Loss::Mse, LabelMode::Separated, 7);
        let (_, grad) = problem.loss_grad(&b).unwrap();
        assert_eq!(slice(&grad, 1), 0.0);
        assert!(slice(&grad, 0) > 0.0);

        // merged MSE pushes the other slice towards zero
        let (problem, b) = setup::<f64>(&pool, &[0, 0, 0], Loss::Mse, LabelMode::Merged, 7);
        let (_, grad) = problem.loss_grad(&b).unwrap();
        assert!(slice(&grad, 1) > 0.0);
    }

    #[test]
    fn modes_coincide_for_log_loss_on_balanced_data() {
        let pool = pool();
        let labels = [0, 1, 1, 0];
        let (merged, b) = setup::<C64>(&pool, &labels, Loss::Kld, LabelMode::Merged, 11);
        let (separated, _) = setup::<C64>(&pool, &labels, Loss::Kld, LabelMode::Separated, 11);
        let (lm, mut gm) = merged.loss_grad(&b).unwrap();
        let (ls, gs) = separated.loss_grad(&b).unwrap();
        assert_abs_diff_eq!(lm, ls, epsilon = 1e-12);
        gm.axpy(C64::new(-1.0, 0.0), &gs).unwrap();
        assert!(gm.norm() < 1e-12);
    }

    #[test]
    fn class_parts_sum_to_total() {
        let pool = pool();
        let (problem, b) =
            setup::<C64>(
                &pool, &[0, 1, 0, 0, 1], Loss::Mixed { alpha: 0.5 }, LabelMode::Separated, 3);
        let (l, g) = problem.loss_grad(&b).unwrap();
        let (l0, mut g0) = problem.class_loss_grad(&b, 0).unwrap();
        let (l1, g1) = problem.class_loss_grad(&b, 1).unwrap();
        assert_abs_diff_eq!(l, l0 + l1, epsilon = 1e-12);
        g0.axpy(C64::new(1.0, 0.0), &g1).unwrap();
        g0.axpy(C64::new(-1.0, 0.0), &g).unwrap();
        assert!(g0.norm() < 1e-12);
        let (empty, g) = problem.class_loss_grad(&b, 5).unwrap();
        assert_eq!(empty, 0.0);
        assert_eq!(g.norm(), 0.0);
    }

    #[test]
    fn parse_losses() {
        assert_eq!("MSE".parse::<Loss>().unwrap(), Loss::Mse);
        assert_eq!("log".parse::<Loss>().unwrap(), Loss::Kld);
        assert_eq!("mixed:0.25".parse::<Loss>().unwrap(), Loss::Mixed { alpha: 0.25 });
        assert!(matches!("hinge".parse::<Loss>(), Err(ConfigError::UnknownLoss(_))));
    }

    #[test]
    fn mse_sample() {
        let (l, c) = Loss::Mse.sample(&[0.5, 0.25], 0);
        assert_abs_diff_eq!(l, 0.5 * (0.25 + 0.0625));
        assert_eq!(c, vec![-0.5, 0.25]);
    }

    #[test]
    fn kld_sample_is_floored() {
        let (l, c) = Loss::Kld.sample(&[C64::new(0.0, 0.5), C64::new(1.0, 0.0)], 0);
        assert_abs_diff_eq!(l.re, -(0.25_f64).ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(l.im, 0.0);
        // -2 / conj(0.5i) = -2 / (-0.5i) = -4i
        assert_abs_diff_eq!(c[0].im, -4.0, epsilon = 1e-12);
        assert_eq!(c[1], C64::new(0.0, 0.0));
        let (l, _) = Loss::Kld.sample(&[0.0_f64, 1.0], 0);
        assert!(l.is_finite());
        assert_abs_diff_eq!(l, -LOG_FLOOR.ln(), epsilon = 1e-6);
    }

    #[test]
    fn mixed_sample_combines() {
        let y = [0.6_f64, 0.3];
        let (lk, _) = Loss::Kld.sample(&y, 1);
        let (lm, _) = Loss::Mse.sample(&y, 1);
        let (l, _) = Loss::Mixed { alpha: 0.5 }.sample(&y, 1);
        assert_abs_diff_eq!(l, lk + 0.5 * lm, epsilon = 1e-12);
    }
}
