//! Training options.
//!
//! [`SweepOpts`] holds every hyper-parameter of a training run. It is
//! serializable via [`serde`] so that runs can be configured from (and
//! recorded to) JSON files; missing fields take their default values.
//!
//! # Example
//!
//! ```rust
//! use mps_learn::config::SweepOpts;
//!
//! let opts = SweepOpts::default();
//! opts.validate().expect("default options are valid");
//! assert_eq!(opts.chi_max, 25);
//! ```

use std::{ path::{ Path, PathBuf }, str::FromStr };
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::{
    encoding::Basis,
    loss::Loss,
    optim::Optimizer,
};

/// Errors produced when loading or validating [`SweepOpts`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// A loss name could not be parsed.
    #[error("unknown loss {0:?}")]
    UnknownLoss(String),

    /// An optimizer name could not be parsed.
    #[error("unknown optimizer {0:?}")]
    UnknownOptimizer(String),

    /// A configuration file could not be read or written.
    #[error("cannot access config file `{path}`: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A configuration file contains malformed JSON.
    #[error("cannot parse config file `{path}`: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    /// Construct a [`ConfigError::InvalidValue`].
    pub fn invalid_value<S>(field: &'static str, reason: S) -> Self
    where S: Into<String>
    {
        Self::InvalidValue { field, reason: reason.into() }
    }
}

/// Numeric type of the network.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    #[default]
    Real,
    Complex,
}

impl FromStr for Dtype {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "real" | "f64" => Ok(Self::Real),
            "complex" | "c64" => Ok(Self::Complex),
            _ => Err(ConfigError::invalid_value("dtype", format!("unknown dtype {s:?}"))),
        }
    }
}

/// How the label index enters the loss.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelMode {
    /// Score the full output vector against a one-hot target, averaging over
    /// all samples.
    #[default]
    Merged,
    /// Score each sample only on its own class slice of the bond tensor,
    /// averaging within each class and then over classes.
    Separated,
}

impl FromStr for LabelMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "merged" => Ok(Self::Merged),
            "separated" => Ok(Self::Separated),
            _ => Err(ConfigError::invalid_value("label_mode", format!("unknown mode {s:?}"))),
        }
    }
}

/// When bond tensors are rescaled to unit norm.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rescale {
    /// Normalize the bond tensor before local optimization.
    pub before: bool,
    /// Normalize the optimized bond tensor, and the kept singular values when
    /// it is split.
    pub after: bool,
}

impl Default for Rescale {
    fn default() -> Self { Self { before: false, after: true } }
}

/// Options for a training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepOpts {
    /// Number of full (backward + forward) sweeps. Default: **5**.
    pub nsweeps: usize,

    /// Maximum bond dimension kept after each split. Default: **25**.
    pub chi_max: usize,

    /// Bond dimension of a randomly initialized network. Default: **4**.
    pub chi_init: usize,

    /// Largest relative weight of discarded singular values. Default:
    /// **1e-10**.
    pub cutoff: f64,

    /// Optimizer steps per bond. Default: **1**.
    pub update_iters: usize,

    /// Network numeric type. Must match the type the trainer is instantiated
    /// with. Default: **Real**.
    pub dtype: Dtype,

    /// Default: **Kld**.
    pub loss: Loss,

    /// Default: **Merged**.
    pub label_mode: LabelMode,

    /// Default: **GradientDescent**.
    pub optimizer: Optimizer,

    /// Learning rate, or initial trial step for line searches. Default:
    /// **0.01**.
    pub eta: f64,

    pub rescale: Rescale,

    /// Physical dimension of the encoding. Default: **5**.
    pub d: usize,

    /// Default: **Legendre**.
    pub basis: Basis,

    /// Subsample classes to equal sizes before fitting data-driven basis
    /// arguments. Default: **false**.
    pub balance_basis_init: bool,

    /// Stop once training accuracy reaches 1. Default: **false**.
    pub exit_early: bool,

    /// Seed for network initialization and class balancing. Drawn from OS
    /// entropy if absent.
    pub seed: Option<u64>,

    /// Threads used for batch reductions. Defaults to the number of logical
    /// cores.
    pub num_threads: Option<usize>,
}

impl Default for SweepOpts {
    fn default() -> Self {
        Self {
            nsweeps: 5,
            chi_max: 25,
            chi_init: 4,
            cutoff: 1e-10,
            update_iters: 1,
            dtype: Dtype::Real,
            loss: Loss::Kld,
            label_mode: LabelMode::Merged,
            optimizer: Optimizer::GradientDescent,
            eta: 0.01,
            rescale: Rescale::default(),
            d: 5,
            basis: Basis::Legendre,
            balance_basis_init: false,
            exit_early: false,
            seed: None,
            num_threads: None,
        }
    }
}

impl SweepOpts {
    /// Load options from a JSON file at `path`, validating them.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path)
            .map_err(|source| ConfigError::FileRead { path: path.to_path_buf(), source })?;
        let opts: Self =
            serde_json::from_str(&contents)
            .map_err(|source| ConfigError::ParseError { path: path.to_path_buf(), source })?;
        opts.validate()?;
        Ok(opts)
    }

    /// Write options to `path` as pretty-printed JSON.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        let json =
            serde_json::to_string_pretty(self)
            .map_err(|source| ConfigError::ParseError { path: path.to_path_buf(), source })?;
        std::fs::write(path, json)
            .map_err(|source| ConfigError::FileRead { path: path.to_path_buf(), source })?;
        Ok(())
    }

    /// Check all fields for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nsweeps == 0 {
            return Err(ConfigError::invalid_value("nsweeps", "must be > 0"));
        }
        if self.chi_max == 0 {
            return Err(ConfigError::invalid_value("chi_max", "must be > 0"));
        }
        if self.chi_init == 0 {
            return Err(ConfigError::invalid_value("chi_init", "must be > 0"));
        }
        if !(self.cutoff.is_finite() && self.cutoff >= 0.0) {
            return Err(ConfigError::invalid_value("cutoff", "must be finite and >= 0"));
        }
        if self.update_iters == 0 {
            return Err(ConfigError::invalid_value("update_iters", "must be > 0"));
        }
        if !(self.eta.is_finite() && self.eta > 0.0) {
            return Err(ConfigError::invalid_value("eta", "must be finite and > 0"));
        }
        if let Loss::Mixed { alpha } = self.loss {
            if !(alpha.is_finite() && alpha >= 0.0) {
                return Err(ConfigError::invalid_value("loss", "alpha must be finite and >= 0"));
            }
        }
        if let Optimizer::Lbfgs { memory: 0 } = self.optimizer {
            return Err(ConfigError::invalid_value("optimizer", "L-BFGS memory must be > 0"));
        }
        if self.num_threads == Some(0) {
            return Err(ConfigError::invalid_value("num_threads", "must be > 0"));
        }
        self.basis.validate(self.d)
            .map_err(|e| ConfigError::invalid_value("basis", e.to_string()))?;
        if self.basis.is_complex() && self.dtype == Dtype::Real {
            return Err(ConfigError::invalid_value(
                "basis",
                format!("{} is complex but dtype is Real", self.basis.name()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::SplitRule;

    #[test]
    fn default_is_valid() {
        SweepOpts::default().validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let opts: SweepOpts =
            serde_json::from_str(r#"{ "chi_max": 8, "optimizer": { "Lbfgs": { "memory": 5 } } }"#)
            .unwrap();
        assert_eq!(opts.chi_max, 8);
        assert_eq!(opts.optimizer, Optimizer::Lbfgs { memory: 5 });
        assert_eq!(opts.nsweeps, 5);
        assert!(opts.rescale.after && !opts.rescale.before);
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(serde_json::from_str::<SweepOpts>(r#"{ "optimizer": "Adam" }"#).is_err());
        assert!(serde_json::from_str::<SweepOpts>(r#"{ "loss": "Hinge" }"#).is_err());
    }

    #[test]
    fn dtype_and_basis_must_agree() {
        let opts = SweepOpts { basis: Basis::Fourier, ..SweepOpts::default() };
        assert!(matches!(opts.validate(), Err(ConfigError::InvalidValue { field: "basis", .. })));
        let opts = SweepOpts { dtype: Dtype::Complex, ..opts };
        opts.validate().unwrap();
    }

    #[test]
    fn basis_dimension_is_checked() {
        let opts = SweepOpts { basis: Basis::Angle, d: 3, ..SweepOpts::default() };
        assert!(opts.validate().is_err());
        let basis = Basis::Split {
            aux: Box::new(Basis::Legendre),
            bins: 2,
            rule: SplitRule::Quantile,
        };
        let opts = SweepOpts { basis, d: 6, ..SweepOpts::default() };
        opts.validate().unwrap();
    }

    #[test]
    fn json_file_round_trip() {
        let path = std::env::temp_dir().join("mps_learn_opts_round_trip.json");
        let opts = SweepOpts { seed: Some(7), label_mode: LabelMode::Separated, ..SweepOpts::default() };
        opts.to_json(&path).unwrap();
        let loaded = SweepOpts::from_json(&path).unwrap();
        assert_eq!(loaded, opts);
        std::fs::remove_file(&path).ok();
    }
}
