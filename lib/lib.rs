#![allow(non_snake_case, non_upper_case_globals)]

//! Tools for learning joint probability distributions over labelled time
//! series with matrix product states.
//!
//! A dataset of series is encoded site-by-site into product states (see
//! [`encoding`]), and an MPS carrying one physical index per time point and a
//! single class-label index is trained against it with DMRG-like two-site
//! sweeps (see [`sweep`]). Each bond update optimizes the merged two-site
//! tensor against a loss computed over the whole training set with the help
//! of cached left/right environments ([`cache`], [`loss`], [`optim`]), then
//! splits it back into two sites with a truncated SVD.
//!
//! A trained network can be sliced into one network per class, which can then
//! be sampled from, or conditioned on known values to forecast or impute
//! missing ones ([`sampling`]).

use num_complex::Complex64 as C64;
use nalgebra as na;

pub mod tensor;
pub mod mps;
pub mod encoding;
pub mod cache;
pub mod loss;
pub mod optim;
pub mod metrics;
pub mod config;
pub mod sweep;
pub mod sampling;

pub use config::{ Dtype, LabelMode, Rescale, SweepOpts };
pub use encoding::{ Basis, BasisArgs, EncodedDataset, ProductState, Split };
pub use metrics::{ SplitMetrics, SweepMetrics, TrainingHistory };
pub use mps::{ Direction, MPS, MPSIndex };
pub use sampling::{ Fill, Sampler };
pub use sweep::{ Phase, Trainer, TrainError };
pub use tensor::{ Idx, Tensor };

/// Convenience trait to identify the numeric types a network can be trained
/// with.
///
/// Everything downstream of the encoding works natively in `Self`; the real
/// and imaginary components only become visible at the optimizer boundary
/// (see [`optim::unroll`]).
pub trait ComplexScalar
where Self: na::ComplexField<RealField = f64> + Copy + Send + Sync + 'static
{
    /// `true` if values of this type carry an imaginary part.
    const IS_COMPLEX: bool;

    /// Convert from a real number.
    ///
    /// Should adhere to the usual relationship between ordinary complex and
    /// real numbers, i.e. the result should have imaginary part equal to zero.
    fn from_re(x: f64) -> Self;

    /// Construct from real and imaginary components.
    ///
    /// The imaginary component is dropped for real types.
    fn from_components(re: f64, im: f64) -> Self;

    /// Split into real and imaginary components.
    fn components(self) -> (f64, f64);

    /// Convert from a [`C64`], dropping the imaginary part for real types.
    fn from_c64(z: C64) -> Self { Self::from_components(z.re, z.im) }
}

impl ComplexScalar for f64 {
    const IS_COMPLEX: bool = false;

    fn from_re(x: f64) -> Self { x }

    fn from_components(re: f64, _im: f64) -> Self { re }

    fn components(self) -> (f64, f64) { (self, 0.0) }
}

impl ComplexScalar for C64 {
    const IS_COMPLEX: bool = true;

    fn from_re(x: f64) -> Self { C64 { re: x, im: 0.0 } }

    fn from_components(re: f64, im: f64) -> Self { C64 { re, im } }

    fn components(self) -> (f64, f64) { (self.re, self.im) }
}
