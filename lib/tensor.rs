//! An N-dimensional array of data with shape determined by a set of named,
//! dimensioned indices.
//!
//! A [`Tensor`] generalizes vectors and matrices to any number of indices.
//! Linear operations generalize as well: the usual matrix-matrix and
//! matrix-vector products become the contraction over all indices two tensors
//! share, where the result is calculated by summing over the values of those
//! indices and leaving all others untouched,
//!
//! <blockquote>
//!   <p style="font-size:20px">
//!     <i>C</i><sub><i>a</i>,<i>b</i></sub>
//!       = Σ<sub><i>α</i></sub>
//!         <i>A</i><sub><i>a</i>,<i>α</i></sub>
//!         <i>B</i><sub><i>α</i>,<i>b</i></sub>
//!   </p>
//! </blockquote>
//!
//! and two tensors with no indices in common produce an ordinary tensor
//! product.
//!
//! Indices are identified by equality under their [`Idx`] implementation;
//! contracting two indices that compare equal but report different dimensions
//! is an error.
//!
//! Elements are stored in a single flat vector in *column-major* order, i.e.
//! the left-most index varies the fastest.
//!
//! # Example
//! ```
//! use mps_learn::tensor::{ Idx, Tensor };
//!
//! #[derive(Copy, Clone, Debug, PartialEq, Eq)]
//! enum Index { A, B, C }
//!
//! impl Idx for Index {
//!     fn dim(&self) -> usize {
//!         match self {
//!             Self::A => 3,
//!             Self::B => 4,
//!             Self::C => 5,
//!         }
//!     }
//! }
//!
//! let a: Tensor<Index, f64> = Tensor::new([Index::A, Index::B], |_| 1.0).unwrap();
//! let b: Tensor<Index, f64> = Tensor::new([Index::B, Index::C], |_| 2.0).unwrap();
//! let c = a.contract(&b).unwrap(); // C_{a,c} = A_{a,b} B_{b,c}
//! assert_eq!(c.shape(), vec![3, 5]);
//! assert!(c.elems().iter().all(|ck| *ck == 8.0));
//! ```

use std::fmt;
use nalgebra as na;
use num_traits::{ One, Zero };
use thiserror::Error;
use crate::ComplexScalar;

#[derive(Debug, Error)]
pub enum TensorError {
    /// Returned when attempting to create a new tensor with duplicate indices.
    #[error("error in tensor creation: duplicate indices")]
    DuplicateIndices,

    /// Returned when attempting to create a new tensor with at least one index
    /// that has zero dimension.
    #[error("error in tensor creation: encountered a zero-dimensional index")]
    ZeroDimIndex,

    /// Returned when attempting to create a new tensor from a pre-existing
    /// collection of elements and the provided indices have non-matching total
    /// dimension.
    #[error("error in tensor creation: non-matching indices and number of elements")]
    IncompatibleNumElems,

    /// Returned when two indices that compare equal have different
    /// dimensions.
    #[error("error in tensor contraction: index {0} has dimensions {1} and {2}")]
    IncompatibleDims(String, usize, usize),

    /// Returned when a tensor add is attempted between two tensors with
    /// incompatible indices.
    #[error("error in tensor add: non-matching indices")]
    IncompatibleIndicesAdd,

    /// Returned when a requested index does not belong to a tensor.
    #[error("error in tensor indexing: missing index {0}")]
    MissingIndex(String),
}
use TensorError::*;
pub type TensorResult<T> = Result<T, TensorError>;

/// Describes a tensor index.
///
/// Two indices are considered the same (and will be contracted) if they
/// compare equal under `PartialEq`. Implementations that carry their dimension
/// as data should leave it out of the comparison so that mismatched dimensions
/// are caught at contraction time instead of silently producing an outer
/// product.
pub trait Idx: Clone + PartialEq + fmt::Debug {
    /// Return the number of values the index can take.
    ///
    /// This value must never be zero.
    fn dim(&self) -> usize;

    /// Return an identifying label for the index. This method is used only for
    /// printing purposes.
    ///
    /// The default implementation renders `self` using `Debug`.
    fn label(&self) -> String { format!("{self:?}") }
}

fn is_unique<T>(elems: &[T]) -> bool
where T: PartialEq
{
    elems.iter().enumerate()
        .all(|(k, e0)| elems.iter().skip(k + 1).all(|e1| e0 != e1))
}

// advance a column-major multi-index by one, returning `false` on wrap-around
fn ndinc(counter: &mut [usize], dims: &[usize]) -> bool {
    for (c, d) in counter.iter_mut().zip(dims) {
        *c += 1;
        if *c < *d { return true; }
        *c = 0;
    }
    false
}

// copy out the data of a column-major array with shape `dims` after moving
// axis `order[k]` to position `k`
fn permute_data<A>(data: &[A], dims: &[usize], order: &[usize]) -> Vec<A>
where A: Copy
{
    if order.iter().enumerate().all(|(k, o)| k == *o) {
        return data.to_vec();
    }
    let old_strides: Vec<usize> =
        dims.iter()
        .scan(1, |acc, d| { let s = *acc; *acc *= d; Some(s) })
        .collect();
    let new_dims: Vec<usize> = order.iter().map(|o| dims[*o]).collect();
    let jumps: Vec<usize> = order.iter().map(|o| old_strides[*o]).collect();
    let mut out: Vec<A> = Vec::with_capacity(data.len());
    let mut counter: Vec<usize> = vec![0; order.len()];
    let mut offset: usize = 0;
    for _ in 0..data.len() {
        out.push(data[offset]);
        for k in 0..counter.len() {
            counter[k] += 1;
            offset += jumps[k];
            if counter[k] < new_dims[k] { break; }
            offset -= jumps[k] * new_dims[k];
            counter[k] = 0;
        }
    }
    out
}

/// Basic implementation of an abstract tensor object.
///
/// A `Tensor<T, A>` consists of some number of numerical quantities of type `A`
/// and a series of *unique* indices belonging to a type `T` that implements
/// [`Idx`]. A tensor with no indices is a scalar holding exactly one element.
///
/// Equality between `Tensor`s depends on inner structure: two tensors are equal
/// only if their indices are equal and *in the same order*, in addition to
/// naive pairwise equality between elements.
#[derive(Clone, PartialEq, Debug)]
pub struct Tensor<T, A>
where A: na::Scalar
{
    idxs: Vec<T>,
    data: na::DVector<A>,
}

impl<T, A> Tensor<T, A>
where
    T: Idx,
    A: ComplexScalar,
{
    /// Create a new tensor using a function over index values.
    ///
    /// Fails if duplicate or zero-dimensional indices are provided.
    pub fn new<I, F>(indices: I, mut elems: F) -> TensorResult<Self>
    where
        I: IntoIterator<Item = T>,
        F: FnMut(&[usize]) -> A,
    {
        let idxs: Vec<T> = indices.into_iter().collect();
        if !is_unique(&idxs) { return Err(DuplicateIndices); }
        let dims: Vec<usize> = idxs.iter().map(|idx| idx.dim()).collect();
        if dims.contains(&0) { return Err(ZeroDimIndex); }
        let len: usize = dims.iter().product();
        let mut counter: Vec<usize> = vec![0; dims.len()];
        let mut data: Vec<A> = Vec::with_capacity(len);
        for _ in 0..len {
            data.push(elems(&counter));
            ndinc(&mut counter, &dims);
        }
        Ok(Self { idxs, data: na::DVector::from_vec(data) })
    }

    /// Create a new rank-0 (scalar) tensor.
    pub fn new_scalar(val: A) -> Self {
        Self { idxs: Vec::new(), data: na::dvector![val] }
    }

    /// Create a new tensor of all zeros.
    pub fn zeros<I>(indices: I) -> TensorResult<Self>
    where I: IntoIterator<Item = T>
    {
        Self::new(indices, |_| A::zero())
    }

    /// Create a tensor over a single index that is one at position `k` and
    /// zero everywhere else.
    ///
    /// *Panics if `k` is out of bounds for `index`.*
    pub fn onehot(index: T, k: usize) -> TensorResult<Self> {
        if k >= index.dim() { panic!("one-hot position out of bounds"); }
        Self::new([index], |pos| if pos[0] == k { A::one() } else { A::zero() })
    }

    /// Create a new tensor from a pre-existing vector of elements.
    ///
    /// Fails if duplicate indices are provided, the length of the vector does
    /// not match the total dimension of the indices, or an index with zero
    /// dimension is encountered.
    pub fn from_elems<I>(indices: I, elems: na::DVector<A>)
        -> TensorResult<Self>
    where I: IntoIterator<Item = T>
    {
        let idxs: Vec<T> = indices.into_iter().collect();
        if !is_unique(&idxs) { return Err(DuplicateIndices); }
        if idxs.iter().any(|idx| idx.dim() == 0) { return Err(ZeroDimIndex); }
        let total_dim: usize = idxs.iter().map(|idx| idx.dim()).product();
        if total_dim != elems.len() { return Err(IncompatibleNumElems); }
        Ok(Self { idxs, data: elems })
    }

    /// Create a new tensor from a matrix whose rows are the fused `rows`
    /// indices and whose columns are the fused `cols` indices.
    pub fn from_matrix(rows: Vec<T>, cols: Vec<T>, mat: na::DMatrix<A>)
        -> TensorResult<Self>
    {
        let m: usize = rows.iter().map(|idx| idx.dim()).product();
        let n: usize = cols.iter().map(|idx| idx.dim()).product();
        if mat.shape() != (m, n) { return Err(IncompatibleNumElems); }
        let data = mat.reshape_generic(na::Dyn(m * n), na::Const::<1>);
        Self::from_elems(rows.into_iter().chain(cols), data)
    }

    /// Return `true` if `self` has rank 0.
    pub fn is_scalar(&self) -> bool { self.idxs.is_empty() }

    /// Return the rank (i.e. the number of indices) of `self`.
    pub fn rank(&self) -> usize { self.idxs.len() }

    /// Return the shape (dimensions of each index) of `self` in a vector.
    ///
    /// If `self` is a scalar, the returned vector is empty.
    pub fn shape(&self) -> Vec<usize> {
        self.idxs.iter().map(|idx| idx.dim()).collect()
    }

    /// Return the total number of elements.
    pub fn len(&self) -> usize { self.data.len() }

    /// Return `true` if `self` holds no elements, which never happens for a
    /// successfully constructed tensor.
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Return all indices, in storage order.
    pub fn indices(&self) -> &[T] { &self.idxs }

    /// Return `true` if `self` has the given index.
    pub fn has_index(&self, index: &T) -> bool { self.idxs.contains(index) }

    /// Return a reference to the flat, column-major element vector.
    pub fn elems(&self) -> &na::DVector<A> { &self.data }

    /// Return the element at a given position, with one coordinate per index
    /// in storage order.
    pub fn get(&self, pos: &[usize]) -> Option<A> {
        if pos.len() != self.idxs.len() { return None; }
        let mut offset: usize = 0;
        let mut stride: usize = 1;
        for (p, idx) in pos.iter().zip(&self.idxs) {
            let d = idx.dim();
            if *p >= d { return None; }
            offset += p * stride;
            stride *= d;
        }
        self.data.get(offset).copied()
    }

    /// Return the value of a rank-0 tensor, or `None` if `self` is not a
    /// scalar.
    pub fn as_scalar(&self) -> Option<A> {
        self.is_scalar().then(|| self.data[0])
    }

    /// Replace an index with another of the same dimension.
    pub fn replace_index(&mut self, old: &T, new: T) -> TensorResult<()> {
        let Some(k) = self.idxs.iter().position(|idx| idx == old) else {
            return Err(MissingIndex(old.label()));
        };
        if old.dim() != new.dim() {
            return Err(IncompatibleDims(new.label(), old.dim(), new.dim()));
        }
        if self.idxs.iter().enumerate().any(|(j, idx)| j != k && *idx == new) {
            return Err(DuplicateIndices);
        }
        self.idxs[k] = new;
        Ok(())
    }

    /// Apply a mapping function to all indices, returning a new tensor.
    ///
    /// Fails if the mapping changes any index dimension or produces duplicate
    /// indices.
    pub fn map_indices<F, U>(self, f: F) -> TensorResult<Tensor<U, A>>
    where
        F: FnMut(T) -> U,
        U: Idx,
    {
        let dims = self.shape();
        let idxs: Vec<U> = self.idxs.into_iter().map(f).collect();
        if let Some((u, d)) =
            idxs.iter().zip(dims).find(|(u, d)| u.dim() != *d)
        {
            return Err(IncompatibleDims(u.label(), d, u.dim()));
        }
        if !is_unique(&idxs) { return Err(DuplicateIndices); }
        Ok(Tensor { idxs, data: self.data })
    }

    /// Return a copy of `self` with its indices reordered so that the `k`-th
    /// new index is the `order[k]`-th old one.
    ///
    /// *Panics if `order` is not a permutation of `0..self.rank()`.*
    pub fn permute(&self, order: &[usize]) -> Self {
        let mut seen = vec![false; self.rank()];
        if order.len() != self.rank()
            || order.iter().any(|o| *o >= seen.len() || already_seen(&mut seen[*o]))
        {
            panic!("invalid index permutation");
        }
        let dims = self.shape();
        let data = permute_data(self.data.as_slice(), &dims, order);
        let idxs: Vec<T> = order.iter().map(|o| self.idxs[*o].clone()).collect();
        Self { idxs, data: na::DVector::from_vec(data) }
    }

    /// Return a copy of `self` with its indices reordered to match `target`.
    ///
    /// Fails if `target` is not a reordering of `self`'s indices.
    pub fn permute_to(&self, target: &[T]) -> TensorResult<Self> {
        if target.len() != self.rank() { return Err(IncompatibleIndicesAdd); }
        let order: Vec<usize> =
            target.iter()
            .map(|idx| {
                self.idxs.iter().position(|i| i == idx)
                    .ok_or_else(|| MissingIndex(idx.label()))
            })
            .collect::<TensorResult<_>>()?;
        if !is_unique(&order) { return Err(DuplicateIndices); }
        Ok(self.permute(&order))
    }

    /// Fuse `rows` into the row index and all remaining indices (in storage
    /// order) into the column index of a matrix.
    ///
    /// Returns the matrix alongside the column indices.
    pub fn to_matrix(&self, rows: &[T]) -> TensorResult<(na::DMatrix<A>, Vec<T>)> {
        let row_pos: Vec<usize> =
            rows.iter()
            .map(|idx| {
                self.idxs.iter().position(|i| i == idx)
                    .ok_or_else(|| MissingIndex(idx.label()))
            })
            .collect::<TensorResult<_>>()?;
        if !is_unique(&row_pos) { return Err(DuplicateIndices); }
        let col_pos: Vec<usize> =
            (0..self.rank()).filter(|k| !row_pos.contains(k)).collect();
        let order: Vec<usize> =
            row_pos.iter().chain(col_pos.iter()).copied().collect();
        let m: usize = row_pos.iter().map(|k| self.idxs[*k].dim()).product();
        let n: usize = col_pos.iter().map(|k| self.idxs[*k].dim()).product();
        let data = permute_data(self.data.as_slice(), &self.shape(), &order);
        let cols: Vec<T> = col_pos.iter().map(|k| self.idxs[*k].clone()).collect();
        Ok((na::DMatrix::from_vec(m, n, data), cols))
    }

    /// Contract `self` with `other` over all common indices. If no common
    /// indices exist, this is equivalent to an ordinary tensor product.
    ///
    /// The result holds all non-common indices of `self`, in their original
    /// order, followed by those of `other`. When the common indices already sit
    /// at the end of `self` and at the start of `other` (in the same order),
    /// no data is rearranged before the underlying matrix multiplication.
    ///
    /// Fails if two common indices have different dimensions.
    pub fn contract(&self, other: &Self) -> TensorResult<Self> {
        let mut common_a: Vec<usize> = Vec::new();
        let mut common_b: Vec<usize> = Vec::new();
        for (ka, idx) in self.idxs.iter().enumerate() {
            if let Some(kb) = other.idxs.iter().position(|i| i == idx) {
                let (da, db) = (idx.dim(), other.idxs[kb].dim());
                if da != db { return Err(IncompatibleDims(idx.label(), da, db)); }
                common_a.push(ka);
                common_b.push(kb);
            }
        }
        let free_a: Vec<usize> =
            (0..self.rank()).filter(|k| !common_a.contains(k)).collect();
        let free_b: Vec<usize> =
            (0..other.rank()).filter(|k| !common_b.contains(k)).collect();
        let m: usize = free_a.iter().map(|k| self.idxs[*k].dim()).product();
        let c: usize = common_a.iter().map(|k| self.idxs[*k].dim()).product();
        let n: usize = free_b.iter().map(|k| other.idxs[*k].dim()).product();

        let order_a: Vec<usize> =
            free_a.iter().chain(common_a.iter()).copied().collect();
        let order_b: Vec<usize> =
            common_b.iter().chain(free_b.iter()).copied().collect();
        let a = permute_data(self.data.as_slice(), &self.shape(), &order_a);
        let b = permute_data(other.data.as_slice(), &other.shape(), &order_b);
        let prod =
            na::DMatrix::from_vec(m, c, a) * na::DMatrix::from_vec(c, n, b);

        let idxs: Vec<T> =
            free_a.iter().map(|k| self.idxs[*k].clone())
            .chain(free_b.iter().map(|k| other.idxs[*k].clone()))
            .collect();
        let data = prod.reshape_generic(na::Dyn(m * n), na::Const::<1>);
        Ok(Self { idxs, data })
    }

    /// Add `other` into `self`, scaled by `a`, aligning index order first if
    /// needed.
    ///
    /// Fails if either tensor holds an index not held by the other.
    pub fn axpy(&mut self, a: A, other: &Self) -> TensorResult<()> {
        if self.idxs == other.idxs {
            self.data.axpy(a, &other.data, A::one());
            return Ok(());
        }
        if self.rank() != other.rank() { return Err(IncompatibleIndicesAdd); }
        let aligned =
            other.permute_to(&self.idxs)
            .map_err(|_| IncompatibleIndicesAdd)?;
        self.data.axpy(a, &aligned.data, A::one());
        Ok(())
    }

    /// Multiply all elements by a scalar in place.
    pub fn scale_mut(&mut self, a: A) { self.data *= a; }

    /// Return the Frobenius norm.
    pub fn norm(&self) -> f64 {
        self.data.iter().map(|a| a.modulus_squared()).sum::<f64>().sqrt()
    }

    /// Rescale to unit Frobenius norm in place, returning the old norm.
    ///
    /// Tensors of zero norm are left untouched.
    pub fn normalize(&mut self) -> f64 {
        let norm = self.norm();
        if norm > 0.0 { self.data.unscale_mut(norm); }
        norm
    }

    /// Return the inner product `⟨self|other⟩`, conjugating `self`.
    ///
    /// Fails if the two tensors hold different indices.
    pub fn dotc(&self, other: &Self) -> TensorResult<A> {
        if self.idxs == other.idxs { return Ok(self.data.dotc(&other.data)); }
        if self.rank() != other.rank() { return Err(IncompatibleIndicesAdd); }
        let aligned =
            other.permute_to(&self.idxs)
            .map_err(|_| IncompatibleIndicesAdd)?;
        Ok(self.data.dotc(&aligned.data))
    }

    /// Return a new tensor containing the element-wise complex conjugation of
    /// `self`.
    pub fn conj(&self) -> Self {
        Self { idxs: self.idxs.clone(), data: self.data.conjugate() }
    }

    /// Apply a mapping function to the elements of `self` in place.
    pub fn map_inplace<F>(&mut self, mut f: F)
    where F: FnMut(A) -> A
    {
        self.data.iter_mut().for_each(|a| { *a = f(*a); });
    }
}

fn already_seen(flag: &mut bool) -> bool { std::mem::replace(flag, true) }

impl<T, A> std::ops::Mul<&Tensor<T, A>> for &Tensor<T, A>
where
    T: Idx,
    A: ComplexScalar,
{
    type Output = Tensor<T, A>;

    fn mul(self, other: &Tensor<T, A>) -> Self::Output {
        match self.contract(other) {
            Ok(res) => res,
            Err(err) => panic!("{}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use num_complex::Complex64 as C64;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum I { A, B, C, Big }

    impl Idx for I {
        fn dim(&self) -> usize {
            match self {
                Self::A => 2,
                Self::B => 3,
                Self::C => 4,
                Self::Big => 3,
            }
        }
    }

    // all instances compare equal regardless of dimension
    #[derive(Copy, Clone, Debug)]
    struct Dimmed(usize);

    impl PartialEq for Dimmed {
        fn eq(&self, _other: &Self) -> bool { true }
    }

    impl Idx for Dimmed {
        fn dim(&self) -> usize { self.0 }
    }

    fn counting(idxs: &[I]) -> Tensor<I, f64> {
        let mut k = 0.0;
        Tensor::new(idxs.iter().copied(), |_| { k += 1.0; k }).unwrap()
    }

    #[test]
    fn column_major_layout() {
        let t = counting(&[I::A, I::B]);
        assert_eq!(t.get(&[0, 0]), Some(1.0));
        assert_eq!(t.get(&[1, 0]), Some(2.0));
        assert_eq!(t.get(&[0, 1]), Some(3.0));
        assert_eq!(t.get(&[2, 0]), None);
    }

    #[test]
    fn duplicate_indices_rejected() {
        let res: TensorResult<Tensor<I, f64>> = Tensor::zeros([I::A, I::A]);
        assert!(matches!(res, Err(DuplicateIndices)));
    }

    #[test]
    fn contraction_matches_matmul() {
        let a = counting(&[I::A, I::B]);
        let b = counting(&[I::B, I::C]);
        let c = a.contract(&b).unwrap();
        assert_eq!(c.indices(), &[I::A, I::C]);
        for i in 0..2 {
            for k in 0..4 {
                let expected: f64 =
                    (0..3)
                    .map(|j| a.get(&[i, j]).unwrap() * b.get(&[j, k]).unwrap())
                    .sum();
                assert_abs_diff_eq!(c.get(&[i, k]).unwrap(), expected);
            }
        }
    }

    #[test]
    fn contraction_is_order_independent() {
        let a = counting(&[I::A, I::B, I::C]);
        let b = counting(&[I::C, I::Big, I::A]);
        let c1 = a.contract(&b).unwrap();
        let c2 = a.permute(&[2, 0, 1]).contract(&b.permute(&[1, 2, 0])).unwrap();
        let c2 = c2.permute_to(c1.indices()).unwrap();
        for (x, y) in c1.elems().iter().zip(c2.elems().iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
        }
    }

    #[test]
    fn full_contraction_gives_scalar() {
        let a = counting(&[I::A, I::B]);
        let s = a.contract(&a.permute(&[1, 0])).unwrap();
        assert!(s.is_scalar());
        let expected: f64 = (1..=6).map(|k| (k * k) as f64).sum();
        assert_abs_diff_eq!(s.as_scalar().unwrap(), expected);
    }

    #[test]
    fn no_common_indices_gives_outer_product() {
        let a = counting(&[I::A]);
        let b = counting(&[I::C]);
        let c = a.contract(&b).unwrap();
        assert_eq!(c.shape(), vec![2, 4]);
        assert_eq!(c.get(&[1, 3]), Some(2.0 * 4.0));
    }

    #[test]
    fn mismatched_dimensions_are_fatal() {
        let a: Tensor<Dimmed, f64> = Tensor::new([Dimmed(2)], |_| 1.0).unwrap();
        let b: Tensor<Dimmed, f64> = Tensor::new([Dimmed(3)], |_| 1.0).unwrap();
        assert!(matches!(a.contract(&b), Err(IncompatibleDims(_, 2, 3))));
    }

    #[test]
    fn matrix_round_trip() {
        let t = counting(&[I::A, I::B, I::C]);
        let (mat, cols) = t.to_matrix(&[I::C, I::A]).unwrap();
        assert_eq!(mat.shape(), (8, 3));
        assert_eq!(cols, vec![I::B]);
        let back =
            Tensor::from_matrix(vec![I::C, I::A], cols, mat).unwrap()
            .permute_to(&[I::A, I::B, I::C]).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn complex_norm_and_conj() {
        let t: Tensor<I, C64> =
            Tensor::new([I::A], |p| C64::new(p[0] as f64, 1.0)).unwrap();
        assert_abs_diff_eq!(t.norm(), 3.0_f64.sqrt(), epsilon = 1e-12);
        let d = t.dotc(&t.conj()).unwrap();
        // Σ conj(t)² = (-i)² + (1 - i)²
        assert_abs_diff_eq!(d.re, -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(d.im, -2.0, epsilon = 1e-12);
    }

    #[test]
    fn axpy_aligns_indices() {
        let a = counting(&[I::A, I::B]);
        let mut acc: Tensor<I, f64> = Tensor::zeros([I::B, I::A]).unwrap();
        acc.axpy(2.0, &a).unwrap();
        assert_eq!(acc.get(&[2, 1]), Some(2.0 * a.get(&[1, 2]).unwrap()));
        let c = counting(&[I::C]);
        assert!(acc.axpy(1.0, &c).is_err());
    }
}
