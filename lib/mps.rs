//! Labelled matrix product states.
//!
//! An [`MPS`] here represents a collection of (unnormalized) functions of *N*
//! variables, one per class, as a chain of rank-3 tensors with a single extra
//! *label* index hanging off one of the sites:
//!
//! ```text
//!                 label
//!                   |
//! A[0] -- A[1] -- A[2] -- ... -- A[n-1]
//!  |       |       |               |
//!  s0      s1      s2              s{n-1}
//! ```
//!
//! The value of the function for class *l* at a point *x* is the overlap of the
//! network with the product state *Φ*(*x*) obtained by encoding each variable
//! separately (see [`crate::encoding`]), i.e. *f<sub>l</sub>*(*x*) =
//! ⟨*Φ*(*x*)|*W<sub>l</sub>*⟩.
//!
//! Bond `k` joins sites `k` and `k + 1`. Site tensors are stored with indices
//! in the order `[bond k - 1, phys k, bond k, label]`, with missing indices
//! skipped. The network keeps track of its orthogonality center: every site to
//! the left of it is a left-isometry and every site to the right of it is a
//! right-isometry, where the label index (if present) counts alongside the
//! physical index.

use std::{ fs, path::Path };
use nalgebra as na;
use rand::Rng;
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::{
    ComplexScalar,
    encoding::ProductState,
    tensor::{ Idx, Tensor, TensorError },
};

#[derive(Debug, Error)]
pub enum MPSError {
    /// Returned when attempting to create a network with fewer than two sites.
    #[error("error in MPS creation: at least two sites are required, got {0}")]
    TooFewSites(usize),

    /// Returned when attempting to create a network with a zero-dimensional
    /// physical, bond, or label index.
    #[error("error in MPS creation: unphysical zero-dimensional index")]
    UnphysicalIndex,

    /// Returned when a site tensor does not carry the indices expected at its
    /// position in the chain.
    #[error("invalid tensor for site {0}: {1}")]
    InvalidSite(usize, String),

    /// Returned when two neighboring sites disagree on a bond dimension.
    /// Holds the bond, then its dimension on the left and the right site.
    #[error("bond {0} has dimension {1} on its left site but {2} on its right site")]
    BondMismatch(usize, usize, usize),

    /// Returned when an operation would add, remove, or duplicate the label
    /// index.
    #[error("label index mismatch at site {0}")]
    LabelMismatch(usize),

    /// Returned when an operation requires a label index but none exists.
    #[error("network carries no label index")]
    NoLabel,

    /// Returned when a class index is out of bounds.
    #[error("class {0} out of bounds for {1} classes")]
    ClassOutOfBounds(usize, usize),

    /// Returned when a site or bond index is out of bounds.
    #[error("site or bond {0} out of bounds")]
    OutOfBounds(usize),

    /// Returned when a bond tensor passed for decomposition does not match the
    /// two sites it is meant to replace.
    #[error("bond tensor does not match bond {0}")]
    BondTensorMismatch(usize),

    /// Returned when a saved network holds complex data but is loaded as real,
    /// or vice versa.
    #[error("saved network has complex = {0}, which does not match the requested type")]
    DtypeMismatch(bool),

    /// Returned when a product state does not match the network's sites.
    #[error("product state has {0} sites, but the network has {1}")]
    StateMismatch(usize, usize),

    #[error("tensor error: {0}")]
    TensorError(#[from] TensorError),

    #[error("serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
}
use MPSError::*;
pub type MPSResult<T> = Result<T, MPSError>;

/// Indices of a labelled MPS.
///
/// Equality compares only *which* index is meant; dimensions are left out so
/// that contracting indices with mismatched dimensions is reported as an error
/// by [`Tensor::contract`] instead of producing an outer product.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub enum MPSIndex {
    /// Physical index of a single site.
    Phys { site: usize, dim: usize },
    /// Virtual index joining sites `bond` and `bond + 1`. Primed copies are
    /// used for temporaries and for the bra side of norm calculations.
    Bond { bond: usize, dim: usize, prime: bool },
    /// Class label.
    Label { dim: usize },
}

impl PartialEq for MPSIndex {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Phys { site: a, .. }, Self::Phys { site: b, .. }) => a == b,
            (
                Self::Bond { bond: a, prime: pa, .. },
                Self::Bond { bond: b, prime: pb, .. },
            ) => a == b && pa == pb,
            (Self::Label { .. }, Self::Label { .. }) => true,
            _ => false,
        }
    }
}

impl Eq for MPSIndex { }

impl Idx for MPSIndex {
    fn dim(&self) -> usize {
        match self {
            Self::Phys { dim, .. } => *dim,
            Self::Bond { dim, .. } => *dim,
            Self::Label { dim } => *dim,
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Phys { site, dim } => format!("s{site}:{dim}"),
            Self::Bond { bond, dim, prime: false } => format!("b{bond}:{dim}"),
            Self::Bond { bond, dim, prime: true } => format!("b{bond}':{dim}"),
            Self::Label { dim } => format!("label:{dim}"),
        }
    }
}

impl MPSIndex {
    pub fn phys(site: usize, dim: usize) -> Self { Self::Phys { site, dim } }

    pub fn bond(bond: usize, dim: usize) -> Self {
        Self::Bond { bond, dim, prime: false }
    }

    pub fn class(dim: usize) -> Self { Self::Label { dim } }

    pub fn is_phys(&self) -> bool { matches!(self, Self::Phys { .. }) }

    pub fn is_bond(&self) -> bool { matches!(self, Self::Bond { .. }) }

    pub fn is_label(&self) -> bool { matches!(self, Self::Label { .. }) }

    /// Return a primed copy of a bond index. Other indices are returned
    /// unchanged.
    pub fn primed(self) -> Self {
        match self {
            Self::Bond { bond, dim, .. } => Self::Bond { bond, dim, prime: true },
            idx => idx,
        }
    }

    /// Return an unprimed copy of a bond index. Other indices are returned
    /// unchanged.
    pub fn unprimed(self) -> Self {
        match self {
            Self::Bond { bond, dim, .. } => Self::Bond { bond, dim, prime: false },
            idx => idx,
        }
    }
}

/// Shorthand for tensors over [`MPSIndex`].
pub type MPSTensor<A> = Tensor<MPSIndex, A>;

/// Sweep direction through a chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Bonds are visited from right to left (decreasing index).
    Left,
    /// Bonds are visited from left to right (increasing index).
    Right,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }

    /// Return the bonds of an `n`-site chain in the order they are visited.
    pub fn bonds(self, n: usize) -> Vec<usize> {
        match self {
            Self::Left => (0..n.saturating_sub(1)).rev().collect(),
            Self::Right => (0..n.saturating_sub(1)).collect(),
        }
    }
}

/// Bond truncation policy for SVD splits.
///
/// Singular values are discarded smallest-first while the discarded weight
/// (sum of squares, relative to the total) stays at or below `cutoff`, and
/// then capped to `chi_max`, whichever is stricter. At least one value is
/// always kept.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Truncation {
    pub chi_max: usize,
    pub cutoff: f64,
    /// Rescale kept singular values to unit norm.
    pub renormalize: bool,
}

/// Data struct holding a truncated singular value decomposition repurposed
/// for splitting bond tensors.
#[derive(Clone, Debug, PartialEq)]
pub struct Schmidt<A>
where A: ComplexScalar
{
    /// Left singular column vectors.
    pub u: na::DMatrix<A>,
    /// Singular values, in descending order.
    pub s: na::DVector<f64>,
    /// Right singular row vectors.
    pub vt: na::DMatrix<A>,
    /// Number of kept singular values.
    pub rank: usize,
    /// Relative weight of the discarded singular values.
    pub discarded: f64,
}

impl<A> Schmidt<A>
where A: ComplexScalar
{
    /// Compute the truncated SVD of a matrix.
    pub fn from_decomp(mat: na::DMatrix<A>, trunc: &Truncation) -> Self {
        let svd = mat.svd(true, true);
        let Some(u) = svd.u else { unreachable!() };
        let Some(vt) = svd.v_t else { unreachable!() };
        let s = svd.singular_values;

        let mut order: Vec<usize> = (0..s.len()).collect();
        order.sort_by(|&a, &b| s[b].total_cmp(&s[a]));
        let sq: Vec<f64> =
            order.iter()
            .map(|&k| if s[k].is_normal() { s[k].powi(2) } else { 0.0 })
            .collect();
        let total: f64 = sq.iter().sum();

        let nonzero = sq.iter().take_while(|w| **w > 0.0).count().max(1);
        let mut rank = nonzero;
        let mut discarded: f64 =
            sq[nonzero..].iter().sum::<f64>() / total.max(f64::MIN_POSITIVE);
        while rank > 1 {
            let w = sq[rank - 1] / total;
            if discarded + w > trunc.cutoff { break; }
            discarded += w;
            rank -= 1;
        }
        if rank > trunc.chi_max.max(1) {
            discarded +=
                sq[trunc.chi_max.max(1)..rank].iter().sum::<f64>() / total;
            rank = trunc.chi_max.max(1);
        }

        let keep = &order[..rank];
        let u = u.select_columns(keep.iter());
        let vt = vt.select_rows(keep.iter());
        let mut s: na::DVector<f64> =
            na::DVector::from_iterator(
                rank, keep.iter().map(|&k| if s[k].is_normal() { s[k] } else { 0.0 }));
        if trunc.renormalize {
            let norm = s.norm();
            if norm > 0.0 { s.unscale_mut(norm); }
        }
        Self { u, s, vt, rank, discarded }
    }
}

/// Summary of a bond split.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitInfo {
    /// New bond dimension.
    pub rank: usize,
    /// Relative weight of the discarded singular values.
    pub discarded: f64,
    /// Kept singular values, in descending order.
    pub svals: na::DVector<f64>,
}

/// A matrix product state whose values are read off against encoded product
/// states.
#[derive(Clone, Debug, PartialEq)]
pub struct MPS<A>
where A: ComplexScalar
{
    // Number of sites. ≥ 2
    pub(crate) n: usize,
    // Physical dimension, shared by all sites.
    pub(crate) d: usize,
    // Site tensors, in canonical index order.
    pub(crate) data: Vec<MPSTensor<A>>,
    // Site carrying the label index, if any.
    pub(crate) label_site: Option<usize>,
    // Dimension of the label index, or zero if there is none.
    pub(crate) nclasses: usize,
    // Orthogonality center, if known.
    pub(crate) center: Option<usize>,
}

// position of an index in the canonical order for site `k`
fn canon_key(idx: &MPSIndex, k: usize) -> usize {
    match idx {
        MPSIndex::Bond { bond, .. } if *bond + 1 == k => 0,
        MPSIndex::Phys { .. } => 1,
        MPSIndex::Bond { .. } => 2,
        MPSIndex::Label { .. } => 3,
    }
}

fn canonicalize<A>(t: MPSTensor<A>, k: usize) -> MPSTensor<A>
where A: ComplexScalar
{
    let keys: Vec<usize> = t.indices().iter().map(|i| canon_key(i, k)).collect();
    if keys.windows(2).all(|w| w[0] < w[1]) { return t; }
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by_key(|&j| keys[j]);
    t.permute(&order)
}

pub(crate) fn dim_of<A>(t: &MPSTensor<A>, key: MPSIndex) -> Option<usize>
where A: ComplexScalar
{
    t.indices().iter().find(|i| **i == key).map(|i| i.dim())
}

fn random_elem<A, R>(rng: &mut R) -> A
where
    A: ComplexScalar,
    R: Rng + ?Sized,
{
    let re: f64 = rng.gen_range(-1.0..1.0);
    let im: f64 = if A::IS_COMPLEX { rng.gen_range(-1.0..1.0) } else { 0.0 };
    A::from_components(re, im)
}

impl<A> MPS<A>
where A: ComplexScalar
{
    /// Initialize to a random network of `n` sites with physical dimension
    /// `d`, uniform bond dimension `chi`, and a label of dimension `nclasses`
    /// on the last site.
    ///
    /// Elements are drawn uniformly from the unit box. The result is brought
    /// into canonical form about the last site (which may lower some bond
    /// dimensions near the ends of the chain) and normalized.
    pub fn new_random<R>(n: usize, d: usize, chi: usize, nclasses: usize, rng: &mut R)
        -> MPSResult<Self>
    where R: Rng + ?Sized
    {
        if n < 2 { return Err(TooFewSites(n)); }
        if d == 0 || chi == 0 || nclasses == 0 { return Err(UnphysicalIndex); }
        let data: Vec<MPSTensor<A>> =
            (0..n)
            .map(|k| {
                let idxs =
                    (k > 0).then(|| MPSIndex::bond(k - 1, chi)).into_iter()
                    .chain([MPSIndex::phys(k, d)])
                    .chain((k < n - 1).then(|| MPSIndex::bond(k, chi)))
                    .chain((k == n - 1).then(|| MPSIndex::class(nclasses)));
                Tensor::new(idxs, |_| random_elem(rng))
            })
            .collect::<Result<_, _>>()?;
        let mut mps =
            Self { n, d, data, label_site: Some(n - 1), nclasses, center: None };
        mps.orthogonalize(n - 1)?;
        mps.normalize();
        Ok(mps)
    }

    /// Assemble a network from a list of site tensors.
    ///
    /// Site `k` must carry `Phys { site: k }`, bond `k - 1` (if `k > 0`) and
    /// bond `k` (if `k < n - 1`), and at most one site may carry a label. The
    /// orthogonality center is unknown afterwards.
    pub fn from_tensors<I>(tensors: I) -> MPSResult<Self>
    where I: IntoIterator<Item = MPSTensor<A>>
    {
        let data: Vec<MPSTensor<A>> = tensors.into_iter().collect();
        let n = data.len();
        if n < 2 { return Err(TooFewSites(n)); }
        let d = dim_of(&data[0], MPSIndex::phys(0, 0))
            .ok_or_else(|| InvalidSite(0, "missing physical index".into()))?;
        let mut label_site: Option<usize> = None;
        let mut nclasses: usize = 0;
        for (k, t) in data.iter().enumerate() {
            if let Some(l) = dim_of(t, MPSIndex::class(0)) {
                if label_site.is_some() { return Err(LabelMismatch(k)); }
                label_site = Some(k);
                nclasses = l;
            }
        }
        let mut mps = Self { n, d, data: Vec::new(), label_site, nclasses, center: None };
        for (k, t) in data.into_iter().enumerate() {
            mps.check_site(k, &t)?;
            mps.data.push(canonicalize(t, k));
        }
        for b in 0..n - 1 {
            let dl = dim_of(&mps.data[b], MPSIndex::bond(b, 0));
            let dr = dim_of(&mps.data[b + 1], MPSIndex::bond(b, 0));
            if let (Some(dl), Some(dr)) = (dl, dr) {
                if dl != dr { return Err(BondMismatch(b, dl, dr)); }
            }
        }
        Ok(mps)
    }

    // check that `t` has exactly the indices expected at site `k`, ignoring
    // neighboring bond dimensions
    fn check_site(&self, k: usize, t: &MPSTensor<A>) -> MPSResult<()> {
        let mut expected: usize = 1;
        match dim_of(t, MPSIndex::phys(k, 0)) {
            Some(d) if d == self.d => { },
            Some(d) => {
                return Err(InvalidSite(k, format!("physical dimension {d} != {}", self.d)));
            },
            None => { return Err(InvalidSite(k, "missing physical index".into())); },
        }
        if k > 0 {
            if dim_of(t, MPSIndex::bond(k - 1, 0)).is_none() {
                return Err(InvalidSite(k, format!("missing bond {}", k - 1)));
            }
            expected += 1;
        }
        if k < self.n - 1 {
            if dim_of(t, MPSIndex::bond(k, 0)).is_none() {
                return Err(InvalidSite(k, format!("missing bond {k}")));
            }
            expected += 1;
        }
        match dim_of(t, MPSIndex::class(0)) {
            Some(l) if self.label_site == Some(k) && l == self.nclasses => {
                expected += 1;
            },
            Some(_) | None if self.label_site == Some(k) => {
                return Err(LabelMismatch(k));
            },
            Some(_) => { return Err(LabelMismatch(k)); },
            None => { },
        }
        if t.rank() != expected {
            return Err(InvalidSite(k, "unexpected extra indices".into()));
        }
        if t.shape().contains(&0) { return Err(UnphysicalIndex); }
        Ok(())
    }

    /// Return the number of sites.
    pub fn len(&self) -> usize { self.n }

    /// Always `false`; a network has at least two sites.
    pub fn is_empty(&self) -> bool { self.n == 0 }

    /// Return the physical dimension shared by all sites.
    pub fn phys_dim(&self) -> usize { self.d }

    /// Return the dimension of the label index, or zero if there is none.
    pub fn num_classes(&self) -> usize { self.nclasses }

    /// Return the site carrying the label index.
    pub fn label_site(&self) -> Option<usize> { self.label_site }

    /// Return the current orthogonality center, if known.
    pub fn center(&self) -> Option<usize> { self.center }

    /// Return a reference to the `k`-th site tensor.
    pub fn get(&self, k: usize) -> Option<&MPSTensor<A>> { self.data.get(k) }

    /// Return all site tensors.
    pub fn tensors(&self) -> &[MPSTensor<A>] { &self.data }

    /// Replace the `k`-th site tensor.
    ///
    /// The new tensor must have the same index structure and outer bond
    /// dimensions as the one it replaces, and may not add or remove the label.
    /// The orthogonality center is forgotten unless `k` is the center.
    pub fn set(&mut self, k: usize, tensor: MPSTensor<A>) -> MPSResult<()> {
        if k >= self.n { return Err(OutOfBounds(k)); }
        self.check_site(k, &tensor)?;
        if k > 0 {
            let dl = self.bond_dim(k - 1).unwrap_or(0);
            let dr = dim_of(&tensor, MPSIndex::bond(k - 1, 0)).unwrap_or(0);
            if dl != dr { return Err(BondMismatch(k - 1, dl, dr)); }
        }
        if k < self.n - 1 {
            let dl = dim_of(&tensor, MPSIndex::bond(k, 0)).unwrap_or(0);
            let dr = dim_of(&self.data[k + 1], MPSIndex::bond(k, 0)).unwrap_or(0);
            if dl != dr { return Err(BondMismatch(k, dl, dr)); }
        }
        self.data[k] = canonicalize(tensor, k);
        if self.center != Some(k) { self.center = None; }
        Ok(())
    }

    /// Return the dimension of bond `k`.
    pub fn bond_dim(&self, k: usize) -> Option<usize> {
        if k + 1 >= self.n { return None; }
        dim_of(&self.data[k], MPSIndex::bond(k, 0))
    }

    /// Return the dimensions of all bonds.
    pub fn bond_dims(&self) -> Vec<usize> {
        (0..self.n - 1).filter_map(|k| self.bond_dim(k)).collect()
    }

    /// Return the maximum bond dimension.
    pub fn max_bond_dim(&self) -> usize {
        self.bond_dims().into_iter().max().unwrap_or(1)
    }

    /// Compute the Frobenius norm of the full network, summing over the label.
    pub fn norm(&self) -> f64 {
        let mut env: Option<MPSTensor<A>> = None;
        for t in self.data.iter() {
            let Ok(bra) = t.conj().map_indices(MPSIndex::primed) else { return 0.0; };
            let ket = match env {
                None => t.clone(),
                Some(e) => &e * t,
            };
            env = Some(&ket * &bra);
        }
        // the last site has no right bond, so the result is a scalar
        env.and_then(|e| e.as_scalar())
            .map(|z| z.real().max(0.0).sqrt())
            .unwrap_or(0.0)
    }

    /// Rescale to unit norm, returning the old norm.
    ///
    /// The scaling is applied to the orthogonality center if it is known and
    /// to the label site (or the last site) otherwise.
    pub fn normalize(&mut self) -> f64 {
        let norm = self.norm();
        if norm > 0.0 {
            let k = self.center.or(self.label_site).unwrap_or(self.n - 1);
            self.data[k].scale_mut(A::from_re(norm.recip()));
        }
        norm
    }

    // make site `k` a left-isometry, pushing the remainder into site `k + 1`
    fn left_orthogonalize(&mut self, k: usize) -> MPSResult<()> {
        let bond = MPSIndex::bond(k, 0);
        let rows: Vec<MPSIndex> =
            self.data[k].indices().iter()
            .filter(|i| **i != bond)
            .copied()
            .collect();
        let (mat, _) = self.data[k].to_matrix(&rows)?;
        let old = self.bond_dim(k).ok_or(OutOfBounds(k))?;
        let qr = mat.qr();
        let (q, r) = (qr.q(), qr.r());
        let chi = q.ncols();
        let new_bond = MPSIndex::bond(k, chi);
        let left = Tensor::from_matrix(rows, vec![new_bond], q)?;
        let r = Tensor::from_matrix(
            vec![new_bond.primed()], vec![MPSIndex::bond(k, old)], r)?;
        let mut right = r.contract(&self.data[k + 1])?;
        right.replace_index(&new_bond.primed(), new_bond)?;
        self.data[k] = canonicalize(left, k);
        self.data[k + 1] = canonicalize(right, k + 1);
        Ok(())
    }

    // make site `k` a right-isometry, pushing the remainder into site `k - 1`
    fn right_orthogonalize(&mut self, k: usize) -> MPSResult<()> {
        let old = self.bond_dim(k - 1).ok_or(OutOfBounds(k))?;
        let bond = MPSIndex::bond(k - 1, old);
        let (mat, cols) = self.data[k].to_matrix(&[bond])?;
        let qr = mat.adjoint().qr();
        let (q, r) = (qr.q(), qr.r());
        let chi = q.ncols();
        let new_bond = MPSIndex::bond(k - 1, chi);
        let right = Tensor::from_matrix(vec![new_bond], cols, q.adjoint())?;
        let r = Tensor::from_matrix(vec![bond], vec![new_bond.primed()], r.adjoint())?;
        let mut left = self.data[k - 1].contract(&r)?;
        left.replace_index(&new_bond.primed(), new_bond)?;
        self.data[k] = canonicalize(right, k);
        self.data[k - 1] = canonicalize(left, k - 1);
        Ok(())
    }

    /// Move the orthogonality center to site `center` with a series of QR
    /// decompositions.
    ///
    /// If the current center is unknown, the whole chain is swept from both
    /// ends. Bond dimensions may shrink where they exceed the rank allowed by
    /// their neighbors.
    pub fn orthogonalize(&mut self, center: usize) -> MPSResult<()> {
        if center >= self.n { return Err(OutOfBounds(center)); }
        let (lo, hi) =
            match self.center {
                Some(c) => (c.min(center), c.max(center)),
                None => (0, self.n - 1),
            };
        for k in lo..center {
            self.left_orthogonalize(k)?;
        }
        for k in (center + 1..=hi).rev() {
            self.right_orthogonalize(k)?;
        }
        self.center = Some(center);
        Ok(())
    }

    /// Contract the sites joined by bond `b` into a single tensor with
    /// indices ordered as `[label, bond b - 1, phys b, phys b + 1, bond b + 1]`
    /// (missing indices skipped).
    pub fn bond_tensor(&self, b: usize) -> MPSResult<MPSTensor<A>> {
        if b + 1 >= self.n { return Err(OutOfBounds(b)); }
        let t = self.data[b].contract(&self.data[b + 1])?;
        Ok(canonicalize_bond(t, b))
    }

    /// Split a bond tensor for bond `b` back into two sites with a truncated
    /// SVD, writing them into the network.
    ///
    /// In a leftward sweep the new left site is *U S*: it carries the label
    /// and becomes the orthogonality center, while the right site is a
    /// right-isometry. In a rightward sweep the left site is a left-isometry
    /// and the right site is *S V*<sup>†</sup>, carrying the label and the
    /// center. The new bond keeps the name of bond `b`.
    ///
    /// Returns the new bond dimension and the kept singular values.
    pub fn decompose(
        &mut self,
        b: usize,
        bond_tensor: &MPSTensor<A>,
        direction: Direction,
        trunc: &Truncation,
    ) -> MPSResult<SplitInfo>
    {
        if b + 1 >= self.n { return Err(OutOfBounds(b)); }
        let has_label = bond_tensor.has_index(&MPSIndex::class(0));
        if has_label != matches!(self.label_site, Some(l) if l == b || l == b + 1) {
            return Err(BondTensorMismatch(b));
        }
        let expected =
            2 + usize::from(b > 0) + usize::from(b + 2 < self.n)
            + usize::from(has_label);
        if bond_tensor.rank() != expected
            || !bond_tensor.has_index(&MPSIndex::phys(b, 0))
            || !bond_tensor.has_index(&MPSIndex::phys(b + 1, 0))
        {
            return Err(BondTensorMismatch(b));
        }

        let left_side = |idx: &MPSIndex| -> bool {
            match idx {
                MPSIndex::Phys { site, .. } => *site == b,
                MPSIndex::Bond { bond, .. } => *bond < b,
                MPSIndex::Label { .. } => direction == Direction::Left,
            }
        };
        let rows: Vec<MPSIndex> =
            bond_tensor.indices().iter().filter(|i| left_side(i)).copied().collect();
        let (mat, cols) = bond_tensor.to_matrix(&rows)?;
        let Schmidt { mut u, s, mut vt, rank, discarded } =
            Schmidt::from_decomp(mat, trunc);
        let new_bond = MPSIndex::bond(b, rank);
        match direction {
            Direction::Left => {
                u.column_iter_mut().zip(s.iter())
                    .for_each(|(mut uj, sj)| { uj.scale_mut(*sj); });
            },
            Direction::Right => {
                vt.row_iter_mut().zip(s.iter())
                    .for_each(|(mut vj, sj)| { vj.scale_mut(*sj); });
            },
        }
        let left = Tensor::from_matrix(rows, vec![new_bond], u)?;
        let right = Tensor::from_matrix(vec![new_bond], cols, vt)?;
        self.data[b] = canonicalize(left, b);
        self.data[b + 1] = canonicalize(right, b + 1);
        let center = match direction {
            Direction::Left => b,
            Direction::Right => b + 1,
        };
        if has_label { self.label_site = Some(center); }
        self.center = Some(center);
        Ok(SplitInfo { rank, discarded, svals: s })
    }

    /// Contract the network with a product state, returning the amplitude for
    /// each class (or a single value if the network carries no label).
    pub fn amplitudes(&self, state: &ProductState<A>) -> MPSResult<Vec<A>> {
        if state.len() != self.n { return Err(StateMismatch(state.len(), self.n)); }
        let mut env: Option<MPSTensor<A>> = None;
        for (t, phi) in self.data.iter().zip(state.sites()) {
            let local = t.contract(&phi.conj())?;
            env = Some(
                match env {
                    None => local,
                    Some(e) => e.contract(&local)?,
                }
            );
        }
        let Some(out) = env else { unreachable!() };
        Ok(out.elems().iter().copied().collect())
    }

    /// Fix the label to class `class` by contracting it with a one-hot
    /// selector, returning a label-free network with unit norm.
    pub fn class_slice(&self, class: usize) -> MPSResult<Self> {
        let l = self.label_site.ok_or(NoLabel)?;
        if class >= self.nclasses {
            return Err(ClassOutOfBounds(class, self.nclasses));
        }
        let selector = Tensor::onehot(MPSIndex::class(self.nclasses), class)?;
        let mut data = self.data.clone();
        data[l] = data[l].contract(&selector)?;
        let center = self.center.filter(|c| *c == l);
        let mut sliced =
            Self { n: self.n, d: self.d, data, label_site: None, nclasses: 0, center };
        sliced.normalize();
        Ok(sliced)
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> MPSResult<String> {
        let saved = SavedMPS {
            complex: A::IS_COMPLEX,
            center: self.center,
            tensors: self.data.iter().map(SavedTensor::from_tensor).collect(),
        };
        Ok(serde_json::to_string(&saved)?)
    }

    /// Deserialize from a JSON string produced by [`to_json`][Self::to_json].
    pub fn from_json(s: &str) -> MPSResult<Self> {
        let saved: SavedMPS = serde_json::from_str(s)?;
        if saved.complex != A::IS_COMPLEX { return Err(DtypeMismatch(saved.complex)); }
        let tensors: Vec<MPSTensor<A>> =
            saved.tensors.into_iter()
            .map(SavedTensor::into_tensor)
            .collect::<MPSResult<_>>()?;
        let mut mps = Self::from_tensors(tensors)?;
        mps.center = saved.center.filter(|c| *c < mps.n);
        Ok(mps)
    }

    /// Write to a JSON file.
    pub fn save<P>(&self, path: P) -> MPSResult<()>
    where P: AsRef<Path>
    {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read from a JSON file.
    pub fn load<P>(path: P) -> MPSResult<Self>
    where P: AsRef<Path>
    {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

fn canonicalize_bond<A>(t: MPSTensor<A>, b: usize) -> MPSTensor<A>
where A: ComplexScalar
{
    let key = |idx: &MPSIndex| -> usize {
        match idx {
            MPSIndex::Label { .. } => 0,
            MPSIndex::Bond { bond, .. } if *bond < b => 1,
            MPSIndex::Phys { site, .. } if *site == b => 2,
            MPSIndex::Phys { .. } => 3,
            MPSIndex::Bond { .. } => 4,
        }
    };
    let keys: Vec<usize> = t.indices().iter().map(key).collect();
    if keys.windows(2).all(|w| w[0] < w[1]) { return t; }
    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by_key(|&j| keys[j]);
    t.permute(&order)
}

#[derive(Serialize, Deserialize)]
struct SavedTensor {
    indices: Vec<MPSIndex>,
    re: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    im: Option<Vec<f64>>,
}

impl SavedTensor {
    fn from_tensor<A>(t: &MPSTensor<A>) -> Self
    where A: ComplexScalar
    {
        let (re, im): (Vec<f64>, Vec<f64>) =
            t.elems().iter().map(|a| a.components()).unzip();
        Self {
            indices: t.indices().to_vec(),
            re,
            im: A::IS_COMPLEX.then_some(im),
        }
    }

    fn into_tensor<A>(self) -> MPSResult<MPSTensor<A>>
    where A: ComplexScalar
    {
        let im = self.im.unwrap_or_else(|| vec![0.0; self.re.len()]);
        if im.len() != self.re.len() {
            return Err(TensorError::IncompatibleNumElems.into());
        }
        let elems: na::DVector<A> =
            na::DVector::from_iterator(
                self.re.len(),
                self.re.into_iter().zip(im).map(|(re, im)| A::from_components(re, im)),
            );
        Ok(Tensor::from_elems(self.indices, elems)?)
    }
}

#[derive(Serialize, Deserialize)]
struct SavedMPS {
    complex: bool,
    center: Option<usize>,
    tensors: Vec<SavedTensor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use num_complex::Complex64 as C64;
    use rand::{ SeedableRng, rngs::StdRng };

    fn identity_error<A>(m: &na::DMatrix<A>) -> f64
    where A: ComplexScalar
    {
        let p = m.adjoint() * m;
        let eye = na::DMatrix::<A>::identity(p.nrows(), p.ncols());
        (p - eye).iter().map(|z| z.modulus()).fold(0.0, f64::max)
    }

    fn assert_canonical<A>(mps: &MPS<A>)
    where A: ComplexScalar
    {
        let c = mps.center().unwrap();
        for k in 0..c {
            let t = mps.get(k).unwrap();
            let rows: Vec<MPSIndex> =
                t.indices().iter()
                .filter(|i| **i != MPSIndex::bond(k, 0))
                .copied()
                .collect();
            let (m, _) = t.to_matrix(&rows).unwrap();
            assert!(identity_error(&m) < 1e-10, "site {k} not left-isometric");
        }
        for k in c + 1..mps.len() {
            let t = mps.get(k).unwrap();
            let rows: Vec<MPSIndex> =
                t.indices().iter()
                .filter(|i| **i != MPSIndex::bond(k - 1, 0))
                .copied()
                .collect();
            let (m, _) = t.to_matrix(&rows).unwrap();
            assert!(identity_error(&m) < 1e-10, "site {k} not right-isometric");
        }
    }

    #[test]
    fn random_network_is_canonical_and_normalized() {
        let mut rng = StdRng::seed_from_u64(10546);
        let mps: MPS<f64> = MPS::new_random(6, 3, 4, 2, &mut rng).unwrap();
        assert_eq!(mps.center(), Some(5));
        assert_eq!(mps.label_site(), Some(5));
        assert_abs_diff_eq!(mps.norm(), 1.0, epsilon = 1e-10);
        assert_canonical(&mps);
        // bond 0 can be at most d wide
        assert_eq!(mps.bond_dim(0), Some(3));
        assert!(mps.bond_dims().iter().all(|chi| *chi <= 4));
    }

    #[test]
    fn orthogonalize_moves_center_and_keeps_norm() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut mps: MPS<C64> = MPS::new_random(5, 2, 3, 3, &mut rng).unwrap();
        for c in [0, 3, 1, 4] {
            mps.orthogonalize(c).unwrap();
            assert_eq!(mps.center(), Some(c));
            assert_canonical(&mps);
            assert_abs_diff_eq!(mps.norm(), 1.0, epsilon = 1e-10);
            // the label never moves
            assert_eq!(mps.label_site(), Some(4));
        }
    }

    #[test]
    fn decompose_without_truncation_round_trips() {
        let mut rng = StdRng::seed_from_u64(77);
        let mut mps: MPS<f64> = MPS::new_random(4, 2, 4, 2, &mut rng).unwrap();
        let trunc = Truncation { chi_max: 64, cutoff: 0.0, renormalize: false };
        let b = mps.bond_tensor(2).unwrap();
        assert_eq!(b.indices()[0], MPSIndex::class(2));
        mps.decompose(2, &b, Direction::Left, &trunc).unwrap();
        assert_eq!(mps.label_site(), Some(2));
        assert_eq!(mps.center(), Some(2));
        let b2 = mps.bond_tensor(2).unwrap();
        assert_eq!(b.indices(), b2.indices());
        for (x, y) in b.elems().iter().zip(b2.elems().iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-10);
        }
        assert_canonical(&mps);
    }

    #[test]
    fn decompose_respects_chi_max() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut mps: MPS<f64> = MPS::new_random(6, 3, 8, 2, &mut rng).unwrap();
        let trunc = Truncation { chi_max: 2, cutoff: 0.0, renormalize: true };
        for b in Direction::Left.bonds(6) {
            let t = mps.bond_tensor(b).unwrap();
            let s = mps.decompose(b, &t, Direction::Left, &trunc).unwrap();
            assert!(s.rank <= 2);
            assert_eq!(mps.bond_dim(b), Some(s.rank));
            assert_abs_diff_eq!(mps.norm(), 1.0, epsilon = 1e-10);
        }
        assert_eq!(mps.label_site(), Some(0));
        assert_canonical(&mps);
    }

    #[test]
    fn cutoff_discards_small_weight() {
        let mat = na::DMatrix::<f64>::from_diagonal(&na::dvector![1.0, 1e-3, 1e-6]);
        let trunc = Truncation { chi_max: 10, cutoff: 1e-9, renormalize: false };
        let s = Schmidt::from_decomp(mat.clone(), &trunc);
        assert_eq!(s.rank, 2);
        let trunc = Truncation { chi_max: 10, cutoff: 1e-5, renormalize: false };
        let s = Schmidt::from_decomp(mat, &trunc);
        assert_eq!(s.rank, 1);
        assert!(s.discarded <= 1e-5);
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let a: MPSTensor<f64> =
            Tensor::zeros([MPSIndex::phys(0, 2), MPSIndex::bond(0, 3)]).unwrap();
        let b: MPSTensor<f64> =
            Tensor::zeros([MPSIndex::bond(0, 4), MPSIndex::phys(1, 2)]).unwrap();
        assert!(matches!(
            a.contract(&b),
            Err(TensorError::IncompatibleDims(_, 3, 4)),
        ));
        assert!(matches!(MPS::from_tensors([a, b]), Err(BondMismatch(0, 3, 4))));
    }

    #[test]
    fn set_replaces_sites_with_matching_structure() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut mps: MPS<f64> = MPS::new_random(4, 2, 2, 2, &mut rng).unwrap();
        assert_eq!(mps.len(), 4);
        assert_eq!(mps.bond_dims(), vec![2, 2, 2]);

        // same indices in a different order; stored back in canonical order
        let old = mps.get(1).unwrap().clone();
        let flipped = old.permute(&[2, 1, 0]);
        mps.set(1, flipped).unwrap();
        assert_eq!(mps.get(1).unwrap(), &old);
        assert_eq!(mps.center(), None);

        let mut scaled = old.clone();
        scaled.scale_mut(2.0);
        mps.set(1, scaled).unwrap();
        assert_abs_diff_eq!(mps.get(1).unwrap().norm(), 2.0 * old.norm(), epsilon = 1e-12);

        let wide: MPSTensor<f64> =
            Tensor::zeros([MPSIndex::bond(0, 2), MPSIndex::phys(1, 2), MPSIndex::bond(1, 3)])
            .unwrap();
        assert!(matches!(mps.set(1, wide), Err(BondMismatch(1, 3, 2))));
        let narrow: MPSTensor<f64> =
            Tensor::zeros([MPSIndex::bond(0, 1), MPSIndex::phys(1, 2), MPSIndex::bond(1, 2)])
            .unwrap();
        assert!(matches!(mps.set(1, narrow), Err(BondMismatch(0, 2, 1))));
        let labelled: MPSTensor<f64> =
            Tensor::zeros([
                MPSIndex::bond(0, 2), MPSIndex::phys(1, 2), MPSIndex::bond(1, 2),
                MPSIndex::class(2),
            ])
            .unwrap();
        assert!(matches!(mps.set(1, labelled), Err(LabelMismatch(1))));
        assert!(matches!(mps.set(4, old), Err(OutOfBounds(4))));
    }

    #[test]
    fn class_slice_is_normalized_and_label_free() {
        let mut rng = StdRng::seed_from_u64(31);
        let mps: MPS<f64> = MPS::new_random(4, 2, 3, 3, &mut rng).unwrap();
        let sliced = mps.class_slice(1).unwrap();
        assert_eq!(sliced.num_classes(), 0);
        assert_eq!(sliced.label_site(), None);
        assert_abs_diff_eq!(sliced.norm(), 1.0, epsilon = 1e-10);
        assert!(matches!(mps.class_slice(3), Err(ClassOutOfBounds(3, 3))));
    }

    #[test]
    fn json_round_trip() {
        let mut rng = StdRng::seed_from_u64(8);
        let mps: MPS<C64> = MPS::new_random(3, 2, 2, 2, &mut rng).unwrap();
        let s = mps.to_json().unwrap();
        let loaded: MPS<C64> = MPS::from_json(&s).unwrap();
        assert_eq!(loaded.bond_dims(), mps.bond_dims());
        assert_eq!(loaded.center(), mps.center());
        assert_eq!(loaded.label_site(), mps.label_site());
        for (a, b) in loaded.tensors().iter().zip(mps.tensors()) {
            assert_eq!(a.indices(), b.indices());
            assert_eq!(a.shape(), b.shape());
            for (x, y) in a.elems().iter().zip(b.elems().iter()) {
                assert!((x - y).norm() < 1e-14);
            }
        }
        assert!(matches!(MPS::<f64>::from_json(&s), Err(DtypeMismatch(true))));
    }
}
