//! DMRG-style two-site sweep training.
//!
//! A [`Trainer`] owns the network, the encoded datasets, the environment
//! cache, and a dedicated thread pool for batch reductions. Training proceeds
//! in full sweeps, each consisting of a backward (leftward) half-sweep over
//! bonds `n - 2, ..., 0` followed by a forward (rightward) half-sweep over
//! bonds `0, ..., n - 2`. At every bond the two adjacent sites are merged,
//! optimized against the training set, and split again with a truncated SVD;
//! the label index and the orthogonality center travel with the sweep.
//!
//! ```text
//! Idle -> Initialized -> SweepingBackward <-> SweepingForward -> Finished
//! ```

use ndarray as nd;
use rand::{ SeedableRng, rngs::StdRng };
use thiserror::Error;
use tracing::{ debug, info };
use crate::{
    ComplexScalar,
    cache::EnvCache,
    config::{ ConfigError, Dtype, SweepOpts },
    encoding::{ EncodedDataset, EncodingError, Split },
    loss::BondProblem,
    metrics::{ SplitMetrics, Stage, SweepMetrics, TrainingHistory },
    mps::{ Direction, MPS, MPSError, Truncation },
    optim::OptimError,
    tensor::TensorError,
};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("network error: {0}")]
    Network(#[from] MPSError),

    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),

    #[error("optimizer error: {0}")]
    Optim(#[from] OptimError),

    #[error("cannot build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// The configured dtype does not match the type the trainer was
    /// instantiated with.
    #[error("options specify dtype {0:?}, but the network type is {1}")]
    DtypeMismatch(Dtype, &'static str),

    /// The network label dimension does not match the number of classes.
    #[error("network label has dimension {network}, but the data has {data} classes")]
    LabelDim { network: usize, data: usize },

    /// A dataset or network has a different number of sites than the
    /// training set.
    #[error("expected {expected} sites, found {found}")]
    SiteCount { expected: usize, found: usize },

    /// A dataset or network has a different physical dimension than the
    /// options.
    #[error("expected physical dimension {expected}, found {found}")]
    PhysDim { expected: usize, found: usize },

    /// A starting network does not carry its label on the last site.
    #[error("starting network must carry its label on the last site")]
    LabelPosition,

    /// A dataset was passed in the wrong slot.
    #[error("expected a {expected:?} dataset, got {found:?}")]
    WrongSplit { expected: Split, found: Split },

    /// An operation was attempted in the wrong phase.
    #[error("cannot {0} while {1:?}")]
    InvalidPhase(&'static str, Phase),
}
pub type TrainResult<T> = Result<T, TrainError>;

/// Stage of a training run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Options and data are set, but no network exists yet.
    Idle,
    /// The network and caches are ready and sweep-0 metrics are recorded.
    Initialized,
    /// Running (or last ran) a leftward half-sweep.
    SweepingBackward,
    /// Running (or last ran) a rightward half-sweep.
    SweepingForward,
    /// The network has been normalized and final metrics recorded.
    Finished,
}

/// Drives sweep training of a labelled network.
pub struct Trainer<A>
where A: ComplexScalar
{
    opts: SweepOpts,
    phase: Phase,
    train: EncodedDataset<A>,
    validation: Option<EncodedDataset<A>>,
    test: Option<EncodedDataset<A>>,
    nclasses: usize,
    mps: Option<MPS<A>>,
    cache: Option<EnvCache<A>>,
    history: TrainingHistory,
    pool: rayon::ThreadPool,
    rng: StdRng,
    sweeps_done: usize,
}

fn type_name<A>() -> &'static str
where A: ComplexScalar
{
    if A::IS_COMPLEX { "complex" } else { "real" }
}

impl<A> Trainer<A>
where A: ComplexScalar
{
    /// Create a new trainer from validated options and encoded datasets.
    ///
    /// Fails if the options are invalid, if the configured dtype does not
    /// match `A`, or if the datasets disagree with each other or with the
    /// options on their shape.
    pub fn new(
        opts: SweepOpts,
        train: EncodedDataset<A>,
        validation: Option<EncodedDataset<A>>,
        test: Option<EncodedDataset<A>>,
    ) -> TrainResult<Self>
    {
        opts.validate()?;
        if (opts.dtype == Dtype::Complex) != A::IS_COMPLEX {
            return Err(TrainError::DtypeMismatch(opts.dtype, type_name::<A>()));
        }
        let check = |ds: &EncodedDataset<A>, split: Split| -> TrainResult<()> {
            if ds.split() != split {
                return Err(TrainError::WrongSplit { expected: split, found: ds.split() });
            }
            if ds.num_sites() != train.num_sites() {
                return Err(TrainError::SiteCount {
                    expected: train.num_sites(),
                    found: ds.num_sites(),
                });
            }
            if ds.phys_dim() != opts.d {
                return Err(TrainError::PhysDim { expected: opts.d, found: ds.phys_dim() });
            }
            if ds.num_classes() > train.num_classes() {
                return Err(TrainError::LabelDim {
                    network: train.num_classes(),
                    data: ds.num_classes(),
                });
            }
            Ok(())
        };
        check(&train, Split::Train)?;
        if let Some(ds) = validation.as_ref() { check(ds, Split::Validation)?; }
        if let Some(ds) = test.as_ref() { check(ds, Split::Test)?; }
        if train.num_sites() < 2 {
            return Err(MPSError::TooFewSites(train.num_sites()).into());
        }

        let num_threads = opts.num_threads.unwrap_or_else(num_cpus::get);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(num_threads).build()?;
        let rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let nclasses = train.num_classes();
        Ok(Self {
            opts,
            phase: Phase::Idle,
            train,
            validation,
            test,
            nclasses,
            mps: None,
            cache: None,
            history: TrainingHistory::new(),
            pool,
            rng,
            sweeps_done: 0,
        })
    }

    /// Fit basis arguments to raw training data, encode every split, and
    /// create a trainer.
    ///
    /// Rows of each matrix are samples; labels are class indices starting
    /// from zero.
    pub fn from_raw(
        opts: SweepOpts,
        train: (&nd::Array2<f64>, &[usize]),
        validation: Option<(&nd::Array2<f64>, &[usize])>,
        test: Option<(&nd::Array2<f64>, &[usize])>,
    ) -> TrainResult<Self>
    {
        opts.validate()?;
        let mut rng = match opts.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let args =
            opts.basis.fit_args(train.0, train.1, opts.balance_basis_init, &mut rng)?;
        let encode = |(data, labels): (&nd::Array2<f64>, &[usize]), split: Split| {
            EncodedDataset::encode(data, labels, &opts.basis, &args, opts.d, split)
        };
        let train = encode(train, Split::Train)?;
        let validation = validation.map(|v| encode(v, Split::Validation)).transpose()?;
        let test = test.map(|t| encode(t, Split::Test)).transpose()?;
        Self::new(opts, train, validation, test)
    }

    pub fn phase(&self) -> Phase { self.phase }

    pub fn opts(&self) -> &SweepOpts { &self.opts }

    pub fn history(&self) -> &TrainingHistory { &self.history }

    /// Return the number of completed full sweeps.
    pub fn sweeps_done(&self) -> usize { self.sweeps_done }

    /// Return the network, if one has been created.
    pub fn mps(&self) -> Option<&MPS<A>> { self.mps.as_ref() }

    /// Consume the trainer, returning the network and the metrics history.
    pub fn into_parts(self) -> (Option<MPS<A>>, TrainingHistory) {
        (self.mps, self.history)
    }

    /// Set up the starting network, the environment cache for the first
    /// (leftward) half-sweep, and record the initial metrics.
    ///
    /// A random network is created if `init` is `None`; otherwise `init` must
    /// match the data and carry its label on the last site.
    pub fn initialize(&mut self, init: Option<MPS<A>>) -> TrainResult<()> {
        if self.phase != Phase::Idle {
            return Err(TrainError::InvalidPhase("initialize", self.phase));
        }
        let n = self.train.num_sites();
        let mut mps =
            match init {
                Some(mps) => {
                    if mps.len() != n {
                        return Err(TrainError::SiteCount { expected: n, found: mps.len() });
                    }
                    if mps.phys_dim() != self.opts.d {
                        return Err(TrainError::PhysDim {
                            expected: self.opts.d,
                            found: mps.phys_dim(),
                        });
                    }
                    if mps.num_classes() != self.nclasses {
                        return Err(TrainError::LabelDim {
                            network: mps.num_classes(),
                            data: self.nclasses,
                        });
                    }
                    if mps.label_site() != Some(n - 1) {
                        return Err(TrainError::LabelPosition);
                    }
                    mps
                },
                None => {
                    MPS::new_random(
                        n, self.opts.d, self.opts.chi_init, self.nclasses, &mut self.rng)?
                },
            };
        mps.orthogonalize(n - 1)?;
        mps.normalize();
        let cache =
            self.pool.install(|| EnvCache::build(&mps, &self.train, Direction::Left))?;
        info!(
            sites = n,
            classes = self.nclasses,
            samples = self.train.len(),
            max_bond_dim = mps.max_bond_dim(),
            "initialized network"
        );
        self.mps = Some(mps);
        self.cache = Some(cache);
        self.phase = Phase::Initialized;
        self.record(Stage::Initial)?;
        Ok(())
    }

    // optimize every bond once in `direction`
    fn half_sweep(&mut self, direction: Direction) -> TrainResult<()> {
        let (Some(mps), Some(cache)) = (self.mps.as_mut(), self.cache.as_mut()) else {
            return Err(TrainError::InvalidPhase("sweep", self.phase));
        };
        let n = mps.len();
        let trunc = Truncation {
            chi_max: self.opts.chi_max,
            cutoff: self.opts.cutoff,
            renormalize: self.opts.rescale.after,
        };
        for b in direction.bonds(n) {
            let bond_tensor = mps.bond_tensor(b)?;
            let problem = BondProblem::new(
                b,
                n,
                cache,
                &self.train,
                self.nclasses,
                self.opts.loss,
                self.opts.label_mode,
                &self.pool,
            )?;
            let outcome = self.opts.optimizer.optimize(
                bond_tensor,
                self.opts.update_iters,
                self.opts.eta,
                self.opts.rescale,
                |t| problem.loss_grad(t),
            )?;
            let split = mps.decompose(b, &outcome.tensor, direction, &trunc)?;
            let (left, right) = (&mps.tensors()[b], &mps.tensors()[b + 1]);
            self.pool.install(|| cache.update(left, right, b, &self.train, direction))?;
            debug!(
                bond = b,
                ?direction,
                loss_before = outcome.loss_before,
                loss_after = outcome.loss_after,
                chi = split.rank,
                discarded = split.discarded,
                "bond update"
            );
        }
        Ok(())
    }

    /// Run one full sweep (backward then forward) and record its metrics.
    pub fn sweep(&mut self) -> TrainResult<&SweepMetrics> {
        match self.phase {
            Phase::Initialized | Phase::SweepingForward => { },
            phase => { return Err(TrainError::InvalidPhase("sweep", phase)); },
        }
        self.phase = Phase::SweepingBackward;
        self.half_sweep(Direction::Left)?;
        self.rebuild_cache(Direction::Right)?;
        self.phase = Phase::SweepingForward;
        self.half_sweep(Direction::Right)?;
        self.rebuild_cache(Direction::Left)?;
        self.sweeps_done += 1;
        self.record(Stage::Sweep(self.sweeps_done))
    }

    fn rebuild_cache(&mut self, direction: Direction) -> TrainResult<()> {
        let Some(mps) = self.mps.as_ref() else {
            return Err(TrainError::InvalidPhase("rebuild caches", self.phase));
        };
        let cache = self.pool.install(|| EnvCache::build(mps, &self.train, direction))?;
        self.cache = Some(cache);
        Ok(())
    }

    /// Normalize the network and record final metrics.
    pub fn finish(&mut self) -> TrainResult<&SweepMetrics> {
        match self.phase {
            Phase::Initialized | Phase::SweepingForward => { },
            phase => { return Err(TrainError::InvalidPhase("finish", phase)); },
        }
        if let Some(mps) = self.mps.as_mut() {
            let norm = mps.normalize();
            debug!(norm, "final normalization");
        }
        self.cache = None;
        self.phase = Phase::Finished;
        self.record(Stage::Final)
    }

    /// Run a complete training: initialize with a random network if needed,
    /// sweep `nsweeps` times (or until training accuracy reaches 1, when
    /// `exit_early` is set), and finish.
    pub fn train(&mut self) -> TrainResult<&TrainingHistory> {
        if self.phase == Phase::Idle { self.initialize(None)?; }
        while self.sweeps_done < self.opts.nsweeps {
            let accuracy = self.sweep()?.train.accuracy;
            if self.opts.exit_early && accuracy >= 1.0 {
                info!(sweep = self.sweeps_done, "training accuracy reached 1; stopping early");
                break;
            }
        }
        self.finish()?;
        Ok(&self.history)
    }

    // evaluate every split and append a row to the history
    fn record(&mut self, stage: Stage) -> TrainResult<&SweepMetrics> {
        let Some(mps) = self.mps.as_ref() else {
            return Err(TrainError::InvalidPhase("record metrics", self.phase));
        };
        let (loss, mode) = (self.opts.loss, self.opts.label_mode);
        let eval = |ds: &EncodedDataset<A>| {
            SplitMetrics::evaluate(mps, ds, loss, mode, &self.pool)
        };
        let row = SweepMetrics {
            stage,
            train: eval(&self.train)?,
            validation: self.validation.as_ref().map(|ds| eval(ds)).transpose()?,
            test: self.test.as_ref().map(|ds| eval(ds)).transpose()?,
            max_bond_dim: mps.max_bond_dim(),
            norm: mps.norm(),
        };
        info!(
            ?stage,
            train_loss = row.train.loss,
            train_acc = row.train.accuracy,
            train_div = row.train.divergence,
            validation_acc = row.validation.map(|m| m.accuracy),
            test_acc = row.test.map(|m| m.accuracy),
            max_bond_dim = row.max_bond_dim,
            "sweep metrics"
        );
        let k = self.history.len();
        self.history.push(row);
        Ok(&self.history.rows[k])
    }
}
