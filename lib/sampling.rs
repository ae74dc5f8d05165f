//! Generative sampling, forecasting, and imputation from a class-sliced
//! network.
//!
//! A label-free network (see [`MPS::class_slice`]) defines an unnormalized
//! joint density over series through `|⟨Φ(x)|W⟩|²`. Values are drawn one site
//! at a time from left to right: at each site the reduced density matrix is
//! formed from the part of the chain already fixed (as a single left vector)
//! and a right environment that accounts for any known values further along
//! the chain, and is then evaluated on a grid over the basis domain to give a
//! one-dimensional conditional density. Unknown sites are either drawn from
//! that density by inverse-transform sampling or set to its mean.

use nalgebra as na;
use num_complex::Complex64 as C64;
use num_traits::Zero;
use rand::Rng;
use thiserror::Error;
use tracing::warn;
use crate::{
    ComplexScalar,
    encoding::{ Basis, BasisArgs, EncodingError },
    mps::{ MPS, MPSError, MPSIndex },
    tensor::TensorError,
};

/// Largest relative deviation allowed between a reduced density matrix and
/// its reconstruction with negative eigenvalues clamped to zero.
pub const CLAMP_TOL: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("network error: {0}")]
    Network(#[from] MPSError),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),

    /// The network still carries a label index.
    #[error("cannot sample from a labelled network; slice it by class first")]
    Labelled,

    /// The density grid needs at least two points.
    #[error("density grid needs at least 2 points, got {0}")]
    TooFewPoints(usize),

    /// The list of known values does not cover every site.
    #[error("expected {expected} entries, got {found}")]
    LengthMismatch { expected: usize, found: usize },

    /// A known value lies outside the basis domain.
    #[error("known value {value} at site {site} lies outside the basis domain [{lo}, {hi}]")]
    Domain { value: f64, site: usize, lo: f64, hi: f64 },

    /// Clamping negative eigenvalues changed a reduced density matrix by
    /// more than [`CLAMP_TOL`].
    #[error("reduced density matrix at site {site} is not positive (relative clamp error {err:.3e})")]
    NotPositive { site: usize, err: f64 },

    /// The known values have zero probability under the network.
    #[error("conditional density vanishes at site {0}")]
    ZeroProbability(usize),
}
pub type SampleResult<T> = Result<T, SampleError>;

/// How unknown sites are filled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Fill {
    /// Draw from the conditional density.
    #[default]
    Sample,
    /// Use the mean of the conditional density.
    Mean,
}

/// Draws series from a label-free network.
#[derive(Clone, Debug)]
pub struct Sampler {
    // sites[k][s] is the (left bond × right bond) matrix of site k at
    // physical index s
    sites: Vec<Vec<na::DMatrix<C64>>>,
    basis: Basis,
    args: BasisArgs,
    d: usize,
    grid: Vec<f64>,
}

impl Sampler {
    /// Prepare a sampler for `mps`, which must carry no label, with values
    /// encoded by `basis`/`args` and conditional densities evaluated on
    /// `npoints` evenly spaced points over the basis domain.
    pub fn new<A>(mps: &MPS<A>, basis: Basis, args: BasisArgs, npoints: usize)
        -> SampleResult<Self>
    where A: ComplexScalar
    {
        if mps.label_site().is_some() { return Err(SampleError::Labelled); }
        if npoints < 2 { return Err(SampleError::TooFewPoints(npoints)); }
        let d = mps.phys_dim();
        basis.validate(d)?;
        let mut mps = mps.clone();
        mps.orthogonalize(0)?;
        mps.normalize();
        let n = mps.len();
        let bonds = mps.bond_dims();
        let sites: Vec<Vec<na::DMatrix<C64>>> =
            mps.tensors().iter().enumerate()
            .map(|(k, t)| -> SampleResult<Vec<na::DMatrix<C64>>> {
                let dl = if k > 0 { bonds[k - 1] } else { 1 };
                let dr = if k + 1 < n { bonds[k] } else { 1 };
                let mut order = Vec::with_capacity(3);
                if k > 0 { order.push(MPSIndex::bond(k - 1, dl)); }
                order.push(MPSIndex::phys(k, d));
                if k + 1 < n { order.push(MPSIndex::bond(k, dr)); }
                let t = t.permute_to(&order)?;
                let mats =
                    (0..d)
                    .map(|s| {
                        na::DMatrix::from_fn(dl, dr, |l, r| {
                            let mut pos = Vec::with_capacity(3);
                            if k > 0 { pos.push(l); }
                            pos.push(s);
                            if k + 1 < n { pos.push(r); }
                            let (re, im) =
                                t.get(&pos).map(|a| a.components()).unwrap_or((0.0, 0.0));
                            C64::new(re, im)
                        })
                    })
                    .collect();
                Ok(mats)
            })
            .collect::<SampleResult<_>>()?;
        let (lo, hi) = basis.domain();
        let step = (hi - lo) / (npoints - 1) as f64;
        let grid: Vec<f64> = (0..npoints).map(|i| lo + step * i as f64).collect();
        Ok(Self { sites, basis, args, d, grid })
    }

    /// Return the number of sites.
    pub fn len(&self) -> usize { self.sites.len() }

    pub fn is_empty(&self) -> bool { self.sites.is_empty() }

    /// Return the points on which conditional densities are evaluated.
    pub fn grid(&self) -> &[f64] { &self.grid }

    /// Draw a full series.
    pub fn sample<R>(&self, rng: &mut R) -> SampleResult<Vec<f64>>
    where R: Rng + ?Sized
    {
        self.fill(&vec![None; self.len()], Fill::Sample, rng)
    }

    /// Continue a series whose first `known.len()` values are given.
    pub fn forecast<R>(&self, known: &[f64], fill: Fill, rng: &mut R)
        -> SampleResult<Vec<f64>>
    where R: Rng + ?Sized
    {
        if known.len() > self.len() {
            return Err(SampleError::LengthMismatch {
                expected: self.len(),
                found: known.len(),
            });
        }
        let mut values: Vec<Option<f64>> = known.iter().copied().map(Some).collect();
        values.resize(self.len(), None);
        self.fill(&values, fill, rng)
    }

    /// Fill in the `None` entries of `values`, conditioning on all the others.
    ///
    /// Known entries are returned unchanged.
    pub fn fill<R>(&self, values: &[Option<f64>], fill: Fill, rng: &mut R)
        -> SampleResult<Vec<f64>>
    where R: Rng + ?Sized
    {
        let n = self.len();
        if values.len() != n {
            return Err(SampleError::LengthMismatch { expected: n, found: values.len() });
        }
        let (lo, hi) = self.basis.domain();
        let mut projectors: Vec<Option<Vec<C64>>> = Vec::with_capacity(n);
        for (site, v) in values.iter().enumerate() {
            let proj =
                match v {
                    Some(x) if !(lo..=hi).contains(x) => {
                        return Err(SampleError::Domain { value: *x, site, lo, hi });
                    },
                    Some(x) => Some(self.basis.eval(*x, self.d, &self.args, site)?),
                    None => None,
                };
            projectors.push(proj);
        }
        let envs = self.right_envs(&projectors)?;

        let mut out = Vec::with_capacity(n);
        let mut left = na::DVector::from_element(1, C64::from(1.0));
        for (k, proj) in projectors.iter().enumerate() {
            let (x, v) =
                match (values[k], proj) {
                    (Some(x), Some(v)) => (x, v.clone()),
                    _ => {
                        let rho = self.density_matrix(k, &left, &envs[k + 1])?;
                        let probs = self.grid_density(k, &rho)?;
                        let x =
                            match fill {
                                Fill::Sample => inverse_transform(&self.grid, &probs, rng),
                                Fill::Mean => mean(&self.grid, &probs),
                            };
                        (x, self.basis.eval(x, self.d, &self.args, k)?)
                    },
                };
            left = self.project(k, &left, &v);
            let norm = left.norm();
            if norm == 0.0 || !norm.is_finite() {
                return Err(SampleError::ZeroProbability(k));
            }
            left.unscale_mut(norm);
            out.push(x);
        }
        Ok(out)
    }

    // row vector l^T Σ_s conj(v_s) A_k[s]
    fn project(&self, k: usize, left: &na::DVector<C64>, v: &[C64])
        -> na::DVector<C64>
    {
        let dr = self.sites[k][0].ncols();
        let mut m = na::DMatrix::<C64>::zeros(self.sites[k][0].nrows(), dr);
        self.sites[k].iter().zip(v)
            .for_each(|(a, vs)| { m += a * vs.conj(); });
        m.tr_mul(left)
    }

    // right environments R_k for k = 0..=n, with R_n = [1]; known sites are
    // projected onto their encoded vectors and unknown sites are traced out
    fn right_envs(&self, projectors: &[Option<Vec<C64>>])
        -> SampleResult<Vec<na::DMatrix<C64>>>
    {
        let n = self.len();
        let mut envs = vec![na::DMatrix::<C64>::identity(1, 1); n + 1];
        for k in (0..n).rev() {
            let r = &envs[k + 1];
            let sites = &self.sites[k];
            let dl = sites[0].nrows();
            let mut env =
                match &projectors[k] {
                    Some(v) => {
                        let mut m = na::DMatrix::<C64>::zeros(dl, sites[0].ncols());
                        sites.iter().zip(v)
                            .for_each(|(a, vs)| { m += a * vs.conj(); });
                        &m * r * m.adjoint()
                    },
                    None => {
                        sites.iter()
                            .fold(na::DMatrix::<C64>::zeros(dl, dl), |acc, a| {
                                acc + a * r * a.adjoint()
                            })
                    },
                };
            let scale = env.norm();
            if scale == 0.0 || !scale.is_finite() {
                return Err(SampleError::ZeroProbability(k));
            }
            env.unscale_mut(scale);
            envs[k] = env;
        }
        Ok(envs)
    }

    // ρ[s, s'] = (l^T A[s]) R (l^T A[s'])^†
    fn density_matrix(&self, k: usize, left: &na::DVector<C64>, env: &na::DMatrix<C64>)
        -> SampleResult<na::DMatrix<C64>>
    {
        let sites = &self.sites[k];
        let dr = sites[0].ncols();
        let b = na::DMatrix::<C64>::from_fn(self.d, dr, |s, r| {
            sites[s].column(r).dot(left)
        });
        let rho = &b * env * b.adjoint();
        clamp_positive(rho, k)
    }

    // p(x_i) = v(x_i)^† ρ v(x_i) on every grid point
    fn grid_density(&self, k: usize, rho: &na::DMatrix<C64>) -> SampleResult<Vec<f64>> {
        let probs: Vec<f64> =
            self.grid.iter()
            .map(|x| -> SampleResult<f64> {
                let v = na::DVector::from_vec(self.basis.eval(*x, self.d, &self.args, k)?);
                Ok((v.adjoint() * rho * &v)[(0, 0)].re.max(0.0))
            })
            .collect::<SampleResult<_>>()?;
        let total: f64 = probs.iter().sum();
        if total == 0.0 || !total.is_finite() {
            return Err(SampleError::ZeroProbability(k));
        }
        Ok(probs.into_iter().map(|p| p / total).collect())
    }
}

// clamp negative eigenvalues of a Hermitian matrix to zero, failing if this
// changes it by more than CLAMP_TOL
fn clamp_positive(rho: na::DMatrix<C64>, site: usize) -> SampleResult<na::DMatrix<C64>> {
    let herm = (&rho + rho.adjoint()).unscale(2.0);
    let na::SymmetricEigen { eigenvectors: u, eigenvalues: mut w } =
        herm.clone().symmetric_eigen();
    if w.iter().all(|l| *l >= 0.0) { return Ok(herm); }
    w.iter_mut().for_each(|l| { *l = l.max(0.0); });
    let clamped =
        &u * na::DMatrix::from_diagonal(&w.map(|l| C64::new(l, 0.0))) * u.adjoint();
    let scale = rho.norm();
    let err = if scale.is_zero() { 0.0 } else { (&clamped - &rho).norm() / scale };
    if err > CLAMP_TOL { return Err(SampleError::NotPositive { site, err }); }
    warn!(site, err, "clamped negative eigenvalues of a reduced density matrix");
    Ok(clamped)
}

// draw from a discrete density on `grid`, interpolating linearly within the
// selected cell
fn inverse_transform<R>(grid: &[f64], probs: &[f64], rng: &mut R) -> f64
where R: Rng + ?Sized
{
    let u: f64 = rng.gen();
    probs.iter().copied()
        .scan(0.0, |cu, p| { let lo = *cu; *cu += p; Some((lo, *cu)) })
        .enumerate()
        .find_map(|(k, (lo, hi))| {
            (u < hi).then(|| {
                if k == 0 || hi <= lo {
                    grid[k]
                } else {
                    grid[k - 1] + (u - lo) / (hi - lo) * (grid[k] - grid[k - 1])
                }
            })
        })
        .unwrap_or(grid[grid.len() - 1])
}

fn mean(grid: &[f64], probs: &[f64]) -> f64 {
    grid.iter().zip(probs).map(|(x, p)| x * p).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{ mps::MPSTensor, tensor::Tensor };

    // a product network that puts all weight on the first basis vector at
    // every site, i.e. on x = 0 under the angle map
    fn peaked(n: usize) -> MPS<f64> {
        let tensors: Vec<MPSTensor<f64>> =
            (0..n)
            .map(|k| {
                let mut idxs = Vec::new();
                if k > 0 { idxs.push(MPSIndex::bond(k - 1, 1)); }
                idxs.push(MPSIndex::phys(k, 2));
                if k + 1 < n { idxs.push(MPSIndex::bond(k, 1)); }
                let pk = if k > 0 { 1 } else { 0 };
                Tensor::new(idxs, |pos| if pos[pk] == 0 { 1.0 } else { 0.0 }).unwrap()
            })
            .collect();
        MPS::from_tensors(tensors).unwrap()
    }

    #[test]
    fn labelled_network_is_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let mps: MPS<f64> = MPS::new_random(3, 2, 2, 2, &mut rng).unwrap();
        assert!(matches!(
            Sampler::new(&mps, Basis::Angle, BasisArgs::Empty, 16),
            Err(SampleError::Labelled),
        ));
        let sliced = mps.class_slice(1).unwrap();
        assert!(Sampler::new(&sliced, Basis::Angle, BasisArgs::Empty, 16).is_ok());
    }

    #[test]
    fn samples_lie_in_domain() {
        let mut rng = StdRng::seed_from_u64(5);
        let mps: MPS<f64> = MPS::new_random(4, 2, 3, 2, &mut rng).unwrap();
        let sampler =
            Sampler::new(&mps.class_slice(0).unwrap(), Basis::Angle, BasisArgs::Empty, 33)
            .unwrap();
        for _ in 0..10 {
            let xs = sampler.sample(&mut rng).unwrap();
            assert_eq!(xs.len(), 4);
            assert!(xs.iter().all(|x| (0.0..=1.0).contains(x)));
        }
    }

    #[test]
    fn mean_follows_peaked_density() {
        let mut rng = StdRng::seed_from_u64(0);
        let sampler = Sampler::new(&peaked(3), Basis::Angle, BasisArgs::Empty, 101).unwrap();
        let xs = sampler.fill(&[None, None, None], Fill::Mean, &mut rng).unwrap();
        // density ∝ cos²(πx/2) on [0, 1] has mean 1/2 - 2/π²
        let expected = 0.5 - 2.0 / std::f64::consts::PI.powi(2);
        for x in xs {
            assert!((x - expected).abs() < 1e-2, "{x} vs {expected}");
        }
    }

    #[test]
    fn known_values_are_kept() {
        let mut rng = StdRng::seed_from_u64(9);
        let mps: MPS<f64> = MPS::new_random(5, 2, 2, 2, &mut rng).unwrap();
        let sampler =
            Sampler::new(&mps.class_slice(1).unwrap(), Basis::Angle, BasisArgs::Empty, 21)
            .unwrap();
        let imputed =
            sampler.fill(&[Some(0.2), None, Some(0.7), None, None], Fill::Sample, &mut rng)
            .unwrap();
        assert_eq!(imputed[0], 0.2);
        assert_eq!(imputed[2], 0.7);
        let forecast = sampler.forecast(&[0.1, 0.3], Fill::Mean, &mut rng).unwrap();
        assert_eq!(&forecast[..2], &[0.1, 0.3]);
        assert_eq!(forecast.len(), 5);
    }

    #[test]
    fn bad_inputs_are_rejected() {
        let mut rng = StdRng::seed_from_u64(2);
        let sampler = Sampler::new(&peaked(3), Basis::Angle, BasisArgs::Empty, 11).unwrap();
        assert!(matches!(
            sampler.fill(&[None, None], Fill::Mean, &mut rng),
            Err(SampleError::LengthMismatch { expected: 3, found: 2 }),
        ));
        assert!(matches!(
            sampler.fill(&[Some(1.5), None, None], Fill::Mean, &mut rng),
            Err(SampleError::Domain { site: 0, .. }),
        ));
        assert!(matches!(
            Sampler::new(&peaked(3), Basis::Angle, BasisArgs::Empty, 1),
            Err(SampleError::TooFewPoints(1)),
        ));
    }

    #[test]
    fn positive_matrices_pass_through_clamping() {
        let rho = na::DMatrix::from_row_slice(2, 2, &[
            C64::new(0.75, 0.0), C64::new(0.25, -0.125),
            C64::new(0.25, 0.125), C64::new(0.25, 0.0),
        ]);
        let clamped = clamp_positive(rho.clone(), 0).unwrap();
        assert!((clamped - rho).norm() < 1e-15);
    }

    #[test]
    fn clamping_tolerates_tiny_negatives() {
        let rho = na::DMatrix::from_row_slice(2, 2, &[
            C64::new(1.0, 0.0), C64::zero(),
            C64::zero(), C64::new(-1e-9, 0.0),
        ]);
        let clamped = clamp_positive(rho, 0).unwrap();
        assert!(clamped[(1, 1)].re >= 0.0);
        let rho = na::DMatrix::from_row_slice(2, 2, &[
            C64::new(1.0, 0.0), C64::zero(),
            C64::zero(), C64::new(-0.5, 0.0),
        ]);
        assert!(matches!(clamp_positive(rho, 4), Err(SampleError::NotPositive { site: 4, .. })));
    }
}
