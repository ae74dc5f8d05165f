//! Local optimizers for bond tensors.
//!
//! All strategies work on the *real form* of a tensor: complex tensors are
//! mapped to real ones with an extra leading index of dimension 2 holding real
//! and imaginary parts ([`unroll`]), and mapped back afterwards ([`reroll`]).
//! Real tensors pass through without the extra index. The gradient supplied by
//! the loss is taken to be in the same form as the tensor itself, so that a
//! plain descent step `B - η g` means the same thing in either form.

use std::{ fmt, str::FromStr };
use nalgebra as na;
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use tracing::{ debug, trace };
use crate::{
    ComplexScalar,
    config::{ ConfigError, Rescale },
    mps::{ MPSIndex, MPSTensor },
    tensor::{ Idx, Tensor, TensorError, TensorResult },
};

#[derive(Debug, Error)]
pub enum OptimError {
    /// Returned when the loss evaluates to NaN or infinity.
    #[error("non-finite loss {0} encountered during optimization")]
    NonFinite(f64),

    #[error("tensor error: {0}")]
    TensorError(#[from] TensorError),
}
use OptimError::*;
pub type OptimResult<T> = Result<T, OptimError>;

/// Index of a tensor in real form.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Part<T> {
    /// Real (0) or imaginary (1) part.
    ReIm,
    /// An index of the original tensor.
    Orig(T),
}

impl<T> Idx for Part<T>
where T: Idx
{
    fn dim(&self) -> usize {
        match self {
            Self::ReIm => 2,
            Self::Orig(idx) => idx.dim(),
        }
    }

    fn label(&self) -> String {
        match self {
            Self::ReIm => "re/im".into(),
            Self::Orig(idx) => idx.label(),
        }
    }
}

/// A tensor in real form.
pub type RealTensor = Tensor<Part<MPSIndex>, f64>;

/// Map a tensor to its real form.
pub fn unroll<A>(t: &MPSTensor<A>) -> RealTensor
where A: ComplexScalar
{
    let orig = t.indices().iter().copied().map(Part::Orig);
    let res =
        if A::IS_COMPLEX {
            let data: Vec<f64> =
                t.elems().iter()
                .flat_map(|a| { let (re, im) = a.components(); [re, im] })
                .collect();
            Tensor::from_elems(
                [Part::ReIm].into_iter().chain(orig),
                na::DVector::from_vec(data),
            )
        } else {
            let data: Vec<f64> = t.elems().iter().map(|a| a.components().0).collect();
            Tensor::from_elems(orig, na::DVector::from_vec(data))
        };
    match res {
        Ok(real) => real,
        Err(err) => unreachable!("real form of a valid tensor: {err}"),
    }
}

/// Map a tensor in real form back to the original type.
///
/// Fails if the real-part axis is missing for a complex type (or present for
/// a real one), or is not the leading index.
pub fn reroll<A>(r: &RealTensor) -> TensorResult<MPSTensor<A>>
where A: ComplexScalar
{
    let has_reim = r.indices().first() == Some(&Part::ReIm);
    if has_reim != A::IS_COMPLEX
        || r.indices().iter().skip(1).any(|i| *i == Part::ReIm)
    {
        return Err(TensorError::MissingIndex(Part::<MPSIndex>::ReIm.label()));
    }
    let idxs: Vec<MPSIndex> =
        r.indices().iter()
        .filter_map(|i| match i { Part::Orig(idx) => Some(*idx), Part::ReIm => None })
        .collect();
    let data: Vec<A> =
        if A::IS_COMPLEX {
            r.elems().as_slice().chunks_exact(2)
                .map(|c| A::from_components(c[0], c[1]))
                .collect()
        } else {
            r.elems().iter().map(|x| A::from_re(*x)).collect()
        };
    Tensor::from_elems(idxs, na::DVector::from_vec(data))
}

/// Closed set of local optimization strategies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Optimizer {
    /// Fixed-step descent: `B ← B - η g`.
    GradientDescent,
    /// Descent along `-g` with a backtracking line search starting from `η`.
    SteepestDescent,
    /// Polak-Ribière⁺ nonlinear conjugate gradient with a backtracking line
    /// search, restarting on non-descent directions.
    ConjugateGradient,
    /// Limited-memory BFGS keeping the last `memory` update pairs.
    Lbfgs { memory: usize },
}

impl Default for Optimizer {
    fn default() -> Self { Self::GradientDescent }
}

impl fmt::Display for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GradientDescent => write!(f, "gd"),
            Self::SteepestDescent => write!(f, "sd"),
            Self::ConjugateGradient => write!(f, "cg"),
            Self::Lbfgs { memory } => write!(f, "lbfgs:{memory}"),
        }
    }
}

impl FromStr for Optimizer {
    type Err = ConfigError;

    /// Parse `gd`, `sd`, `cg`, or `lbfgs[:memory]` (memory defaults to 10).
    /// Long names (`gradient_descent`, `steepest_descent`,
    /// `conjugate_gradient`) are also accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase().replace('-', "_");
        match lower.split_once(':') {
            None if lower == "gd" || lower == "gradient_descent" => {
                Ok(Self::GradientDescent)
            },
            None if lower == "sd" || lower == "steepest_descent" => {
                Ok(Self::SteepestDescent)
            },
            None if lower == "cg" || lower == "conjugate_gradient" => {
                Ok(Self::ConjugateGradient)
            },
            None if lower == "lbfgs" => Ok(Self::Lbfgs { memory: 10 }),
            Some(("lbfgs", m)) => {
                let memory: usize = m.parse()
                    .map_err(|_| {
                        ConfigError::invalid_value("optimizer", format!("bad memory in {s:?}"))
                    })?;
                Ok(Self::Lbfgs { memory })
            },
            _ => Err(ConfigError::UnknownOptimizer(s.to_string())),
        }
    }
}

/// Result of a local optimization.
#[derive(Clone, Debug)]
pub struct Outcome<A>
where A: ComplexScalar
{
    pub tensor: MPSTensor<A>,
    /// Loss of the (possibly rescaled) starting tensor.
    pub loss_before: f64,
    /// Loss of the returned tensor, before the final rescaling.
    pub loss_after: f64,
    /// Number of completed steps.
    pub steps: usize,
}

const ARMIJO_C1: f64 = 1e-4;
const MAX_BACKTRACK: usize = 30;

// loss and gradient over the flat real form, with a fixed index layout
struct Objective<'a, A, F>
where A: ComplexScalar
{
    idxs: Vec<Part<MPSIndex>>,
    orig: &'a [MPSIndex],
    f: F,
    _marker: std::marker::PhantomData<A>,
}

impl<'a, A, F> Objective<'a, A, F>
where
    A: ComplexScalar,
    F: FnMut(&MPSTensor<A>) -> TensorResult<(f64, MPSTensor<A>)>,
{
    fn tensor(&self, x: &na::DVector<f64>) -> TensorResult<MPSTensor<A>> {
        reroll(&Tensor::from_elems(self.idxs.iter().copied(), x.clone())?)
    }

    fn eval(&mut self, x: &na::DVector<f64>) -> OptimResult<(f64, na::DVector<f64>)> {
        let t = self.tensor(x)?;
        let (loss, grad) = (self.f)(&t)?;
        if !loss.is_finite() { return Err(NonFinite(loss)); }
        let grad =
            if grad.indices() == self.orig { grad } else { grad.permute_to(self.orig)? };
        Ok((loss, unroll(&grad).elems().clone()))
    }

    // backtracking line search along `p`, returning the accepted step, loss,
    // and gradient
    fn line_search(
        &mut self,
        x: &na::DVector<f64>,
        loss: f64,
        grad: &na::DVector<f64>,
        p: &na::DVector<f64>,
        alpha0: f64,
    ) -> OptimResult<Option<(na::DVector<f64>, f64, na::DVector<f64>)>>
    {
        let slope = grad.dot(p);
        if slope >= 0.0 { return Ok(None); }
        let mut alpha = alpha0;
        for _ in 0..MAX_BACKTRACK {
            let xnew = x + p * alpha;
            match self.eval(&xnew) {
                Ok((lnew, gnew)) if lnew <= loss + ARMIJO_C1 * alpha * slope => {
                    return Ok(Some((xnew, lnew, gnew)));
                },
                Ok(_) | Err(NonFinite(_)) => { alpha *= 0.5; },
                Err(err) => { return Err(err); },
            }
        }
        Ok(None)
    }
}

impl Optimizer {
    /// Minimize a loss over a bond tensor, starting from `init`.
    ///
    /// `f` returns the loss and gradient at a given tensor. At most `iters`
    /// steps are taken; line-search methods stop early when no acceptable step
    /// is found. `eta` is the fixed step size for gradient descent and the
    /// initial trial step for line searches.
    pub fn optimize<A, F>(
        &self,
        init: MPSTensor<A>,
        iters: usize,
        eta: f64,
        rescale: Rescale,
        f: F,
    ) -> OptimResult<Outcome<A>>
    where
        A: ComplexScalar,
        F: FnMut(&MPSTensor<A>) -> TensorResult<(f64, MPSTensor<A>)>,
    {
        let mut init = init;
        if rescale.before { init.normalize(); }
        let orig: Vec<MPSIndex> = init.indices().to_vec();
        let real = unroll(&init);
        let mut obj = Objective {
            idxs: real.indices().to_vec(),
            orig: &orig,
            f,
            _marker: std::marker::PhantomData,
        };
        let mut x: na::DVector<f64> = real.elems().clone();
        let (loss_before, mut g) = obj.eval(&x)?;
        let mut loss = loss_before;
        let mut steps: usize = 0;

        match self {
            Self::GradientDescent => {
                for _ in 0..iters {
                    x -= &g * eta;
                    steps += 1;
                    let (l, gnew) = obj.eval(&x)?;
                    loss = l;
                    g = gnew;
                }
            },
            Self::SteepestDescent => {
                for _ in 0..iters {
                    let p = -&g;
                    let Some((xnew, l, gnew)) =
                        obj.line_search(&x, loss, &g, &p, eta)? else { break; };
                    (x, loss, g) = (xnew, l, gnew);
                    steps += 1;
                }
            },
            Self::ConjugateGradient => {
                let mut p = -&g;
                for _ in 0..iters {
                    if g.dot(&p) >= 0.0 { p = -&g; }
                    let Some((xnew, l, gnew)) =
                        obj.line_search(&x, loss, &g, &p, eta)? else { break; };
                    let gg = g.dot(&g);
                    let beta =
                        if gg > 0.0 { (gnew.dot(&(&gnew - &g)) / gg).max(0.0) } else { 0.0 };
                    p = &p * beta - &gnew;
                    (x, loss, g) = (xnew, l, gnew);
                    steps += 1;
                }
            },
            Self::Lbfgs { memory } => {
                let mut hist: Vec<(na::DVector<f64>, na::DVector<f64>, f64)> = Vec::new();
                for k in 0..iters {
                    let p = -lbfgs_direction(&g, &hist);
                    let alpha0 = if k == 0 { eta } else { 1.0 };
                    let Some((xnew, l, gnew)) =
                        obj.line_search(&x, loss, &g, &p, alpha0)? else { break; };
                    let s = &xnew - &x;
                    let y = &gnew - &g;
                    let sy = s.dot(&y);
                    if sy > 1e-12 {
                        if hist.len() == (*memory).max(1) { hist.remove(0); }
                        hist.push((s, y, sy.recip()));
                    }
                    (x, loss, g) = (xnew, l, gnew);
                    steps += 1;
                }
            },
        }
        trace!(optimizer = %self, steps, loss_before, loss, "local optimization");

        let mut tensor = obj.tensor(&x)?;
        if rescale.after {
            let norm = tensor.normalize();
            debug!(norm, "rescaled optimized bond tensor");
        }
        Ok(Outcome { tensor, loss_before, loss_after: loss, steps })
    }
}

// two-loop recursion: approximate H g from the stored (s, y, 1/(s·y)) pairs
fn lbfgs_direction(
    g: &na::DVector<f64>,
    hist: &[(na::DVector<f64>, na::DVector<f64>, f64)],
) -> na::DVector<f64>
{
    let mut q = g.clone();
    let mut alphas: Vec<f64> = Vec::with_capacity(hist.len());
    for (s, y, rho) in hist.iter().rev() {
        let a = rho * s.dot(&q);
        q.axpy(-a, y, 1.0);
        alphas.push(a);
    }
    if let Some((s, y, _)) = hist.last() {
        let yy = y.dot(y);
        if yy > 0.0 { q *= s.dot(y) / yy; }
    }
    for ((s, y, rho), a) in hist.iter().zip(alphas.into_iter().rev()) {
        let b = rho * y.dot(&q);
        q.axpy(a - b, s, 1.0);
    }
    q
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use num_complex::Complex64 as C64;

    fn target<A>() -> MPSTensor<A>
    where A: ComplexScalar
    {
        Tensor::new(
            [MPSIndex::class(2), MPSIndex::phys(0, 3)],
            |p| A::from_components(p[0] as f64 - 0.5, 0.25 * p[1] as f64),
        ).unwrap()
    }

    // ½‖B - T‖², gradient B - T
    fn quadratic<A>(b: &MPSTensor<A>) -> TensorResult<(f64, MPSTensor<A>)>
    where A: ComplexScalar
    {
        let mut diff = b.clone();
        diff.axpy(-A::one(), &target())?;
        Ok((0.5 * diff.norm().powi(2), diff))
    }

    fn start<A>() -> MPSTensor<A>
    where A: ComplexScalar
    {
        Tensor::zeros([MPSIndex::class(2), MPSIndex::phys(0, 3)]).unwrap()
    }

    const NO_RESCALE: Rescale = Rescale { before: false, after: false };

    #[test]
    fn real_form_round_trip() {
        let t: MPSTensor<C64> = target();
        let r = unroll(&t);
        assert_eq!(r.indices()[0], Part::ReIm);
        assert_eq!(r.len(), 2 * t.len());
        assert_eq!(reroll::<C64>(&r).unwrap(), t);
        assert!(reroll::<f64>(&r).is_err());
        let t: MPSTensor<f64> = target();
        assert_eq!(unroll(&t).rank(), t.rank());
    }

    #[test]
    fn parse_optimizers() {
        assert_eq!("GD".parse::<Optimizer>().unwrap(), Optimizer::GradientDescent);
        assert_eq!("conjugate-gradient".parse::<Optimizer>().unwrap(), Optimizer::ConjugateGradient);
        assert_eq!("lbfgs:4".parse::<Optimizer>().unwrap(), Optimizer::Lbfgs { memory: 4 });
        assert!(matches!("adam".parse::<Optimizer>(), Err(ConfigError::UnknownOptimizer(_))));
    }

    #[test]
    fn gradient_descent_takes_fixed_steps() {
        let out =
            Optimizer::GradientDescent
            .optimize(start::<f64>(), 1, 0.5, NO_RESCALE, quadratic)
            .unwrap();
        let t: MPSTensor<f64> = target();
        for (x, y) in out.tensor.elems().iter().zip(t.elems().iter()) {
            assert_abs_diff_eq!(*x, 0.5 * y, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(out.loss_after, 0.25 * out.loss_before, epsilon = 1e-12);
    }

    #[test]
    fn line_search_methods_converge() {
        let methods = [
            Optimizer::SteepestDescent,
            Optimizer::ConjugateGradient,
            Optimizer::Lbfgs { memory: 3 },
        ];
        for opt in methods {
            let out = opt.optimize(start::<C64>(), 20, 1.0, NO_RESCALE, quadratic).unwrap();
            assert!(out.loss_after < 1e-10, "{opt} ended at {}", out.loss_after);
            assert!(out.loss_after <= out.loss_before);
        }
    }

    #[test]
    fn rescale_after_normalizes() {
        let rescale = Rescale { before: false, after: true };
        let out =
            Optimizer::GradientDescent
            .optimize(start::<f64>(), 2, 0.3, rescale, quadratic)
            .unwrap();
        assert_abs_diff_eq!(out.tensor.norm(), 1.0, epsilon = 1e-12);
    }
}
