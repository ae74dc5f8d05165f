//! Encoding of raw time series into product states.
//!
//! Each value of a series is mapped independently to a small vector by a
//! [`Basis`], so that a series of length *N* becomes a product state of *N*
//! one-index tensors. The physical dimension `d` is the length of these
//! vectors and is shared by every site.
//!
//! Some bases are *time-dependent*: their arguments ([`BasisArgs`]) are fitted
//! per site from the training data and must be reused unchanged for every
//! other split of the same problem.

use std::{ f64::consts::PI, ops::Range };
use itertools::Itertools;
use ndarray as nd;
use num_complex::Complex64 as C64;
use rand::{ Rng, seq::SliceRandom };
use serde::{ Deserialize, Serialize };
use statrs::statistics::{ Data, OrderStatistics };
use thiserror::Error;
use tracing::debug;
use crate::{
    ComplexScalar,
    mps::{ MPSIndex, MPSTensor },
    tensor::{ Tensor, TensorError },
};

#[derive(Debug, Error)]
pub enum EncodingError {
    /// Returned when a value lies outside the domain of the basis.
    #[error("value {value} at row {row}, site {site} lies outside the basis domain [{lo}, {hi}]")]
    Domain { value: f64, row: usize, site: usize, lo: f64, hi: f64 },

    /// Returned when the number of rows does not match the number of labels.
    #[error("data has {0} rows but {1} labels were given")]
    LabelCount(usize, usize),

    /// Returned when no data is given.
    #[error("cannot encode an empty dataset")]
    EmptyData,

    /// Returned when a basis cannot produce vectors of the requested
    /// dimension.
    #[error("basis {0} cannot produce vectors of dimension {1}")]
    InvalidDim(String, usize),

    /// Returned when a complex basis is used to encode into a real type.
    #[error("complex basis {0} cannot encode into a real type")]
    DtypeMismatch(String),

    /// Returned when a split basis is given another split basis as its
    /// auxiliary basis.
    #[error("split bases cannot be nested")]
    NestedSplit,

    /// Returned when a basis needs fitted arguments that were not provided or
    /// do not match the data.
    #[error("basis arguments missing or inconsistent for {0} sites")]
    MissingArgs(usize),

    #[error("tensor error: {0}")]
    TensorError(#[from] TensorError),
}
use EncodingError::*;
pub type EncodingResult<T> = Result<T, EncodingError>;

/// Dataset split a product state belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    Train,
    Validation,
    Test,
}

/// How bin edges are placed for a [`Basis::Split`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitRule {
    /// Equal-width bins over the auxiliary basis' domain.
    Uniform,
    /// Per-site bins holding equal shares of the training data.
    Quantile,
}

/// Closed set of single-value encodings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Basis {
    /// `[cos(πx/2), sin(πx/2)]` on `[0, 1]`.
    Angle,
    /// `[e^{3iπx/2} cos(πx/2), e^{-3iπx/2} sin(πx/2)]` on `[0, 1]`.
    Stoudenmire,
    /// `e^{iπkx} / √2` for `d` frequencies `k` centered on zero, on `[-1, 1]`.
    Fourier,
    /// Orthonormal Legendre functions `√((2k + 1)/2) P_k(x)` on `[-1, 1]`.
    Legendre,
    /// Block-sparse encoding: the domain is cut into `bins` intervals and
    /// `aux` is applied (with dimension `d / bins`) inside the interval the
    /// value falls in.
    Split { aux: Box<Basis>, bins: usize, rule: SplitRule },
}

impl Default for Basis {
    fn default() -> Self { Self::Legendre }
}

/// Per-site arguments fitted to training data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum BasisArgs {
    /// The basis needs no arguments.
    #[default]
    Empty,
    /// Bin edges (`bins + 1` of them, ascending) for each site.
    Edges(Vec<Vec<f64>>),
}

impl Basis {
    /// Return a short name for the basis.
    pub fn name(&self) -> String {
        match self {
            Self::Angle => "angle".into(),
            Self::Stoudenmire => "stoudenmire".into(),
            Self::Fourier => "fourier".into(),
            Self::Legendre => "legendre".into(),
            Self::Split { aux, bins, rule } =>
                format!("split({}, {bins}, {rule:?})", aux.name()),
        }
    }

    /// Return `true` if the basis produces complex vectors.
    pub fn is_complex(&self) -> bool {
        match self {
            Self::Angle | Self::Legendre => false,
            Self::Stoudenmire | Self::Fourier => true,
            Self::Split { aux, .. } => aux.is_complex(),
        }
    }

    /// Return `true` if the basis needs per-site arguments fitted to data.
    pub fn is_time_dependent(&self) -> bool {
        matches!(self, Self::Split { rule: SplitRule::Quantile, .. })
    }

    /// Return the closed interval of accepted values.
    pub fn domain(&self) -> (f64, f64) {
        match self {
            Self::Angle | Self::Stoudenmire => (0.0, 1.0),
            Self::Fourier | Self::Legendre => (-1.0, 1.0),
            Self::Split { aux, .. } => aux.domain(),
        }
    }

    /// Check that the basis can produce vectors of dimension `d`.
    pub fn validate(&self, d: usize) -> EncodingResult<()> {
        match self {
            Self::Angle | Self::Stoudenmire if d != 2 => {
                Err(InvalidDim(self.name(), d))
            },
            Self::Fourier | Self::Legendre if d == 0 => {
                Err(InvalidDim(self.name(), d))
            },
            Self::Split { aux, bins, .. } => {
                if matches!(**aux, Self::Split { .. }) { return Err(NestedSplit); }
                if *bins == 0 || d % bins != 0 {
                    return Err(InvalidDim(self.name(), d));
                }
                aux.validate(d / bins)
            },
            _ => Ok(()),
        }
    }

    /// Fit per-site arguments to a training set.
    ///
    /// With `balance` set, every class is first subsampled (using `rng`) down
    /// to the size of the smallest one.
    pub fn fit_args<R>(
        &self,
        data: &nd::Array2<f64>,
        labels: &[usize],
        balance: bool,
        rng: &mut R,
    ) -> EncodingResult<BasisArgs>
    where R: Rng + ?Sized
    {
        let Self::Split { aux, bins, rule } = self else {
            return Ok(BasisArgs::Empty);
        };
        let (lo, hi) = aux.domain();
        let nsites = data.ncols();
        match rule {
            SplitRule::Uniform => {
                let edges = uniform_edges(lo, hi, *bins);
                Ok(BasisArgs::Edges(vec![edges; nsites]))
            },
            SplitRule::Quantile => {
                if data.nrows() != labels.len() {
                    return Err(LabelCount(data.nrows(), labels.len()));
                }
                if data.nrows() == 0 { return Err(EmptyData); }
                let rows = if balance { balanced_rows(labels, rng) }
                    else { (0..labels.len()).collect() };
                debug!(rows = rows.len(), bins, "fitting quantile bin edges");
                let edges: Vec<Vec<f64>> =
                    (0..nsites)
                    .map(|k| {
                        let column: Vec<f64> =
                            rows.iter().map(|i| data[[*i, k]]).collect();
                        quantile_edges(column, lo, hi, *bins)
                    })
                    .collect();
                Ok(BasisArgs::Edges(edges))
            },
        }
    }

    /// Encode a single value at site `site` into a vector of dimension `d`.
    ///
    /// The value is assumed to lie in the domain of the basis.
    pub fn eval(&self, x: f64, d: usize, args: &BasisArgs, site: usize)
        -> EncodingResult<Vec<C64>>
    {
        match self {
            Self::Angle => {
                let t = PI * x / 2.0;
                Ok(vec![t.cos().into(), t.sin().into()])
            },
            Self::Stoudenmire => {
                let t = PI * x / 2.0;
                Ok(vec![
                    C64::from_polar(t.cos(), 3.0 * t),
                    C64::from_polar(t.sin(), -3.0 * t),
                ])
            },
            Self::Fourier => {
                let k0 = (d / 2) as f64;
                Ok(
                    (0..d)
                    .map(|j| C64::from_polar(0.5_f64.sqrt(), PI * (j as f64 - k0) * x))
                    .collect()
                )
            },
            Self::Legendre => {
                Ok(legendre(x, d).into_iter().map(C64::from).collect())
            },
            Self::Split { aux, bins, rule } => {
                let (lo, hi) = aux.domain();
                let uniform;
                let edges: &[f64] =
                    match (rule, args) {
                        (_, BasisArgs::Edges(edges)) => {
                            edges.get(site).ok_or(MissingArgs(edges.len()))?
                        },
                        (SplitRule::Uniform, BasisArgs::Empty) => {
                            uniform = uniform_edges(lo, hi, *bins);
                            &uniform
                        },
                        (SplitRule::Quantile, BasisArgs::Empty) => {
                            return Err(MissingArgs(0));
                        },
                    };
                if edges.len() != bins + 1 { return Err(MissingArgs(edges.len())); }
                let daux = d / bins;
                let j = edges[1..*bins].partition_point(|e| *e <= x);
                let w = edges[j + 1] - edges[j];
                let (t, scale) =
                    if w > 0.0 {
                        (lo + (x - edges[j]) / w * (hi - lo), ((hi - lo) / w).sqrt())
                    } else {
                        (lo, 1.0)
                    };
                let block = aux.eval(t.clamp(lo, hi), daux, &BasisArgs::Empty, site)?;
                let mut out = vec![C64::from(0.0); d];
                out[j * daux..(j + 1) * daux].iter_mut().zip(block)
                    .for_each(|(o, b)| { *o = b * scale; });
                Ok(out)
            },
        }
    }
}

fn uniform_edges(lo: f64, hi: f64, bins: usize) -> Vec<f64> {
    (0..=bins).map(|j| lo + (hi - lo) * j as f64 / bins as f64).collect()
}

fn quantile_edges(column: Vec<f64>, lo: f64, hi: f64, bins: usize) -> Vec<f64> {
    let mut data = Data::new(column);
    let mut edges: Vec<f64> =
        (0..=bins)
        .map(|j| data.quantile(j as f64 / bins as f64))
        .collect();
    edges[0] = lo;
    edges[bins] = hi;
    // quantiles are monotone, but stay safe against the domain clamps
    for j in 1..=bins {
        if edges[j] < edges[j - 1] { edges[j] = edges[j - 1]; }
    }
    edges
}

// subsample every class down to the minority count
fn balanced_rows<R>(labels: &[usize], rng: &mut R) -> Vec<usize>
where R: Rng + ?Sized
{
    let groups: Vec<Vec<usize>> =
        (0..labels.len())
        .sorted_by_key(|i| labels[*i])
        .group_by(|i| labels[*i])
        .into_iter()
        .map(|(_, group)| group.collect())
        .collect();
    let minority = groups.iter().map(|g| g.len()).min().unwrap_or(0);
    groups.into_iter()
        .flat_map(|mut g| {
            g.shuffle(rng);
            g.truncate(minority);
            g
        })
        .sorted()
        .collect()
}

// orthonormal Legendre functions on [-1, 1]
fn legendre(x: f64, d: usize) -> Vec<f64> {
    let mut p: Vec<f64> = Vec::with_capacity(d);
    for k in 0..d {
        let pk =
            match k {
                0 => 1.0,
                1 => x,
                _ => {
                    let kf = k as f64;
                    ((2.0 * kf - 1.0) * x * p[k - 1] - (kf - 1.0) * p[k - 2]) / kf
                },
            };
        p.push(pk);
    }
    p.iter().enumerate()
        .map(|(k, pk)| ((2.0 * k as f64 + 1.0) / 2.0).sqrt() * pk)
        .collect()
}

/// A single encoded series.
#[derive(Clone, Debug, PartialEq)]
pub struct ProductState<A>
where A: ComplexScalar
{
    sites: Vec<MPSTensor<A>>,
    label: usize,
    id: usize,
    split: Split,
}

impl<A> ProductState<A>
where A: ComplexScalar
{
    /// Assemble a product state from per-site vectors of equal length.
    pub fn new(vectors: Vec<Vec<A>>, label: usize, id: usize, split: Split)
        -> EncodingResult<Self>
    {
        let sites: Vec<MPSTensor<A>> =
            vectors.into_iter().enumerate()
            .map(|(k, v)| {
                let idx = MPSIndex::phys(k, v.len());
                Tensor::new([idx], |pos| v[pos[0]])
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { sites, label, id, split })
    }

    /// Return the number of sites.
    pub fn len(&self) -> usize { self.sites.len() }

    pub fn is_empty(&self) -> bool { self.sites.is_empty() }

    /// Return the per-site tensors, each over a single physical index.
    pub fn sites(&self) -> &[MPSTensor<A>] { &self.sites }

    pub fn label(&self) -> usize { self.label }

    /// Return the position of the state in its dataset, which doubles as its
    /// column in an environment cache.
    pub fn id(&self) -> usize { self.id }

    pub fn split(&self) -> Split { self.split }
}

/// A collection of product states, sorted by label so that every class
/// occupies a contiguous range.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedDataset<A>
where A: ComplexScalar
{
    states: Vec<ProductState<A>>,
    class_ranges: Vec<Range<usize>>,
    nsites: usize,
    d: usize,
    split: Split,
}

impl<A> EncodedDataset<A>
where A: ComplexScalar
{
    /// Encode every row of `data` (rows are samples, columns are sites) with
    /// `basis` at dimension `d`.
    ///
    /// Labels are class indices starting from zero. Fails if any value lies
    /// outside the basis domain, if the number of rows differs from the number
    /// of labels, or if a complex basis is used with a real type.
    pub fn encode(
        data: &nd::Array2<f64>,
        labels: &[usize],
        basis: &Basis,
        args: &BasisArgs,
        d: usize,
        split: Split,
    ) -> EncodingResult<Self>
    {
        if data.nrows() != labels.len() {
            return Err(LabelCount(data.nrows(), labels.len()));
        }
        if data.nrows() == 0 || data.ncols() == 0 { return Err(EmptyData); }
        basis.validate(d)?;
        if basis.is_complex() && !A::IS_COMPLEX {
            return Err(DtypeMismatch(basis.name()));
        }
        if let BasisArgs::Edges(edges) = args {
            if edges.len() != data.ncols() { return Err(MissingArgs(edges.len())); }
        }
        let (lo, hi) = basis.domain();
        if let Some(((row, site), value)) =
            data.indexed_iter().find(|(_, x)| !(lo..=hi).contains(*x))
        {
            return Err(Domain { value: *value, row, site, lo, hi });
        }

        let order: Vec<usize> =
            (0..labels.len()).sorted_by_key(|i| labels[*i]).collect();
        let states: Vec<ProductState<A>> =
            order.iter().enumerate()
            .map(|(id, i)| {
                let vectors: Vec<Vec<A>> =
                    data.row(*i).iter().enumerate()
                    .map(|(k, x)| {
                        basis.eval(*x, d, args, k)
                            .map(|v| v.into_iter().map(A::from_c64).collect())
                    })
                    .collect::<EncodingResult<_>>()?;
                ProductState::new(vectors, labels[*i], id, split)
            })
            .collect::<EncodingResult<_>>()?;

        let nclasses = labels.iter().max().map(|l| l + 1).unwrap_or(0);
        let class_ranges: Vec<Range<usize>> =
            (0..nclasses)
            .map(|c| {
                let start = states.partition_point(|s| s.label < c);
                let end = states.partition_point(|s| s.label <= c);
                start..end
            })
            .collect();
        debug!(
            ?split,
            samples = states.len(),
            sites = data.ncols(),
            classes = nclasses,
            "encoded dataset"
        );
        Ok(Self { states, class_ranges, nsites: data.ncols(), d, split })
    }

    /// Return the number of product states.
    pub fn len(&self) -> usize { self.states.len() }

    pub fn is_empty(&self) -> bool { self.states.is_empty() }

    pub fn num_sites(&self) -> usize { self.nsites }

    pub fn phys_dim(&self) -> usize { self.d }

    /// Return one more than the largest label.
    pub fn num_classes(&self) -> usize { self.class_ranges.len() }

    pub fn split(&self) -> Split { self.split }

    pub fn states(&self) -> &[ProductState<A>] { &self.states }

    pub fn get(&self, id: usize) -> Option<&ProductState<A>> { self.states.get(id) }

    /// Return the range of ids holding class `c`, which is empty for classes
    /// with no members.
    pub fn class_range(&self, c: usize) -> Range<usize> {
        self.class_ranges.get(c).cloned().unwrap_or(0..0)
    }

    /// Return the number of states in each class.
    pub fn class_counts(&self) -> Vec<usize> {
        self.class_ranges.iter().map(|r| r.len()).collect()
    }

    /// Return the number of classes with at least one member.
    pub fn classes_present(&self) -> usize {
        self.class_ranges.iter().filter(|r| !r.is_empty()).count()
    }
}
