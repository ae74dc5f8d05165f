//! Left and right environments of a network against every state of a
//! dataset.
//!
//! For sample `i`, the left environment at site `j` is the contraction of
//! sites `0..=j` of the network with the conjugated product state over the
//! same sites, leaving a single open bond index `j`; the right environment at
//! site `j` mirrors this from the far end of the chain, leaving bond `j - 1`
//! open:
//!
//! ```text
//!   left(j)                          right(j)
//! A[0] - ... - A[j] -          - A[j] - ... - A[n-1]
//!  |            |                 |             |
//! φ*[0]  ...  φ*[j]              φ*[j]  ...  φ*[n-1]
//! ```
//!
//! A bond update at bond `b` reads `left(b - 1)` and `right(b + 2)`. During a
//! leftward sweep the left environments are all current and the right ones are
//! filled in behind the sweep as it moves; a rightward sweep is the mirror
//! image. Entries invalidated by a site update are never read.

use rayon::prelude::*;
use crate::{
    ComplexScalar,
    encoding::EncodedDataset,
    mps::{ Direction, MPS, MPSTensor },
    tensor::TensorResult,
};

/// Cached environments, indexed `[site][sample id]`.
#[derive(Clone, Debug)]
pub struct EnvCache<A>
where A: ComplexScalar
{
    left: Vec<Option<Vec<MPSTensor<A>>>>,
    right: Vec<Option<Vec<MPSTensor<A>>>>,
    nsamples: usize,
    direction: Direction,
}

// contract a single site with the conjugate of a product state's vector
fn local<A>(site: &MPSTensor<A>, phi: &MPSTensor<A>) -> TensorResult<MPSTensor<A>>
where A: ComplexScalar
{
    site.contract(&phi.conj())
}

impl<A> EnvCache<A>
where A: ComplexScalar
{
    /// Build a fresh cache for a sweep in `direction`.
    ///
    /// A leftward sweep starts at the right end of the chain and needs every
    /// left environment; a rightward sweep needs every right environment.
    /// Samples are processed in parallel on the current `rayon` pool.
    pub fn build(mps: &MPS<A>, dataset: &EncodedDataset<A>, direction: Direction)
        -> TensorResult<Self>
    {
        let n = mps.len();
        let nsamples = dataset.len();
        let mut cache = Self {
            left: vec![None; n],
            right: vec![None; n],
            nsamples,
            direction,
        };
        let states = dataset.states();
        match direction {
            Direction::Left => {
                let mut rows: Vec<Vec<MPSTensor<A>>> = Vec::with_capacity(n - 1);
                for j in 0..n - 1 {
                    let site = &mps.tensors()[j];
                    let row: Vec<MPSTensor<A>> =
                        match rows.last() {
                            None => {
                                states.par_iter()
                                    .map(|s| local(site, &s.sites()[0]))
                                    .collect::<TensorResult<_>>()?
                            },
                            Some(prev) => {
                                states.par_iter().zip(prev.par_iter())
                                    .map(|(s, e)| e.contract(&local(site, &s.sites()[j])?))
                                    .collect::<TensorResult<_>>()?
                            },
                        };
                    rows.push(row);
                }
                cache.left.iter_mut().zip(rows)
                    .for_each(|(slot, row)| { *slot = Some(row); });
            },
            Direction::Right => {
                let mut rows: Vec<Vec<MPSTensor<A>>> = Vec::with_capacity(n - 1);
                for j in (1..n).rev() {
                    let site = &mps.tensors()[j];
                    let row: Vec<MPSTensor<A>> =
                        match rows.last() {
                            None => {
                                states.par_iter()
                                    .map(|s| local(site, &s.sites()[j]))
                                    .collect::<TensorResult<_>>()?
                            },
                            Some(prev) => {
                                states.par_iter().zip(prev.par_iter())
                                    .map(|(s, e)| local(site, &s.sites()[j])?.contract(e))
                                    .collect::<TensorResult<_>>()?
                            },
                        };
                    rows.push(row);
                }
                // rows were built from the far end inwards
                cache.right.iter_mut().skip(1).rev().zip(rows)
                    .for_each(|(slot, row)| { *slot = Some(row); });
            },
        }
        Ok(cache)
    }

    /// Return the direction the cache was built for.
    pub fn direction(&self) -> Direction { self.direction }

    /// Return the number of samples covered.
    pub fn num_samples(&self) -> usize { self.nsamples }

    /// Return `true` if the left environments at site `j` are current.
    pub fn left_valid(&self, j: usize) -> bool {
        self.left.get(j).is_some_and(|row| row.is_some())
    }

    /// Return `true` if the right environments at site `j` are current.
    pub fn right_valid(&self, j: usize) -> bool {
        self.right.get(j).is_some_and(|row| row.is_some())
    }

    /// Return the left environment of sample `id` at site `j`.
    ///
    /// *Panics if the entry is stale.*
    pub fn left(&self, j: usize, id: usize) -> &MPSTensor<A> {
        match self.left.get(j) {
            Some(Some(row)) => &row[id],
            _ => panic!("read of stale left environment at site {j}"),
        }
    }

    /// Return the right environment of sample `id` at site `j`.
    ///
    /// *Panics if the entry is stale.*
    pub fn right(&self, j: usize, id: usize) -> &MPSTensor<A> {
        match self.right.get(j) {
            Some(Some(row)) => &row[id],
            _ => panic!("read of stale right environment at site {j}"),
        }
    }

    /// Patch the cache after bond `bond` has been replaced by `new_left` and
    /// `new_right` during a sweep in `direction`.
    ///
    /// A leftward step fills in the right environments at site `bond + 1`
    /// from the new right tensor and invalidates the left environments from
    /// `bond` onwards; a rightward step does the mirror image.
    pub fn update(
        &mut self,
        new_left: &MPSTensor<A>,
        new_right: &MPSTensor<A>,
        bond: usize,
        dataset: &EncodedDataset<A>,
        direction: Direction,
    ) -> TensorResult<()>
    {
        let n = self.left.len();
        let states = dataset.states();
        match direction {
            Direction::Left => {
                let j = bond + 1;
                let row: Vec<MPSTensor<A>> =
                    if j == n - 1 {
                        states.par_iter()
                            .map(|s| local(new_right, &s.sites()[j]))
                            .collect::<TensorResult<_>>()?
                    } else {
                        let prev = self.right[j + 1].as_ref()
                            .unwrap_or_else(|| {
                                panic!("read of stale right environment at site {}", j + 1)
                            });
                        states.par_iter().zip(prev.par_iter())
                            .map(|(s, e)| local(new_right, &s.sites()[j])?.contract(e))
                            .collect::<TensorResult<_>>()?
                    };
                self.right[j] = Some(row);
                self.left[bond..].iter_mut().for_each(|row| { *row = None; });
            },
            Direction::Right => {
                let j = bond;
                let row: Vec<MPSTensor<A>> =
                    if j == 0 {
                        states.par_iter()
                            .map(|s| local(new_left, &s.sites()[0]))
                            .collect::<TensorResult<_>>()?
                    } else {
                        let prev = self.left[j - 1].as_ref()
                            .unwrap_or_else(|| {
                                panic!("read of stale left environment at site {}", j - 1)
                            });
                        states.par_iter().zip(prev.par_iter())
                            .map(|(s, e)| e.contract(&local(new_left, &s.sites()[j])?))
                            .collect::<TensorResult<_>>()?
                    };
                self.left[j] = Some(row);
                self.right[..=bond + 1].iter_mut().for_each(|row| { *row = None; });
            },
        }
        self.direction = direction;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray as nd;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        encoding::{ Basis, BasisArgs, Split },
        mps::Truncation,
    };

    fn dataset() -> EncodedDataset<f64> {
        let data = nd::Array2::from_shape_fn((6, 5), |(i, k)| {
            ((i * 7 + k * 3) % 10) as f64 / 10.0
        });
        let labels = vec![0, 1, 0, 1, 1, 0];
        EncodedDataset::encode(&data, &labels, &Basis::Angle, &BasisArgs::Empty, 2, Split::Train)
            .unwrap()
    }

    fn assert_close(a: &MPSTensor<f64>, b: &MPSTensor<f64>) {
        assert_eq!(a.indices(), b.indices());
        for (x, y) in a.elems().iter().zip(b.elems().iter()) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn patched_entries_match_rebuild() {
        let ds = dataset();
        let mut rng = StdRng::seed_from_u64(4);
        let mut mps: MPS<f64> = MPS::new_random(5, 2, 3, 2, &mut rng).unwrap();
        let mut cache = EnvCache::build(&mps, &ds, Direction::Left).unwrap();
        assert!((0..4).all(|j| cache.left_valid(j)));
        assert!(!cache.right_valid(4));
        let trunc = Truncation { chi_max: 3, cutoff: 0.0, renormalize: true };

        for b in [3, 2] {
            let mut t = mps.bond_tensor(b).unwrap();
            t.map_inplace(|x| 0.9 * x + 0.01);
            mps.decompose(b, &t, Direction::Left, &trunc).unwrap();
            cache.update(
                mps.get(b).unwrap(), mps.get(b + 1).unwrap(), b, &ds, Direction::Left,
            ).unwrap();
        }
        assert!(!cache.left_valid(2));
        assert!(cache.left_valid(1));

        let fresh = EnvCache::build(&mps, &ds, Direction::Right).unwrap();
        for id in 0..ds.len() {
            for j in [3, 4] {
                assert_close(cache.right(j, id), fresh.right(j, id));
            }
        }
    }

    #[test]
    fn rightward_patches_match_rebuild() {
        let ds = dataset();
        let mut rng = StdRng::seed_from_u64(6);
        let mut mps: MPS<f64> = MPS::new_random(5, 2, 3, 2, &mut rng).unwrap();
        mps.orthogonalize(0).unwrap();
        let mut cache = EnvCache::build(&mps, &ds, Direction::Right).unwrap();
        assert!((1..5).all(|j| cache.right_valid(j)));
        assert!(!cache.left_valid(0));
        let trunc = Truncation { chi_max: 3, cutoff: 0.0, renormalize: true };

        for b in [0, 1] {
            let mut t = mps.bond_tensor(b).unwrap();
            t.map_inplace(|x| 0.9 * x - 0.02);
            mps.decompose(b, &t, Direction::Right, &trunc).unwrap();
            cache.update(
                mps.get(b).unwrap(), mps.get(b + 1).unwrap(), b, &ds, Direction::Right,
            ).unwrap();
        }
        assert!(!cache.right_valid(2));
        assert!(cache.right_valid(3));

        let fresh = EnvCache::build(&mps, &ds, Direction::Left).unwrap();
        for id in 0..ds.len() {
            for j in [0, 1] {
                assert_close(cache.left(j, id), fresh.left(j, id));
            }
        }
    }

    #[test]
    #[should_panic]
    fn stale_reads_panic() {
        let ds = dataset();
        let mut rng = StdRng::seed_from_u64(4);
        let mps: MPS<f64> = MPS::new_random(5, 2, 3, 2, &mut rng).unwrap();
        let cache = EnvCache::build(&mps, &ds, Direction::Left).unwrap();
        cache.right(3, 0);
    }
}
