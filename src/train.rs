//! `mps-train`: train a labelled MPS classifier on delimited text data.
//!
//! Each non-empty line of a data file holds one sample: a class label followed
//! by the series values, separated by commas and/or whitespace. Lines starting
//! with `#` are skipped. Values must already lie in the domain of the chosen
//! basis.
//!
//! ```bash
//! mps-train --config opts.json --train train.csv --test test.csv \
//!     --output mps.json --history history.json
//! ```

use std::path::{ Path, PathBuf };
use clap::Parser;
use itertools::Itertools;
use ndarray as nd;
use num_complex::Complex64 as C64;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{ error, info };
use mps_learn::{
    ComplexScalar,
    config::{ Dtype, SweepOpts },
    loss::Loss,
    mps::{ MPS, MPSError },
    optim::Optimizer,
    sweep::{ Trainer, TrainError },
};

#[derive(Parser, Debug)]
#[command(
    name = "mps-train",
    version,
    about = "Sweep-train a matrix product state classifier",
    long_about = None
)]
struct Args {
    /// JSON options file; defaults are used for missing fields.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Training data.
    #[arg(long, value_name = "FILE")]
    train: PathBuf,

    /// Validation data.
    #[arg(long, value_name = "FILE")]
    validation: Option<PathBuf>,

    /// Test data.
    #[arg(long, value_name = "FILE")]
    test: Option<PathBuf>,

    /// Starting network; a random one is used if absent.
    #[arg(long, value_name = "FILE")]
    init: Option<PathBuf>,

    /// Where to write the trained network.
    #[arg(short, long, value_name = "FILE", default_value = "mps.json")]
    output: PathBuf,

    /// Where to write the metrics history.
    #[arg(long, value_name = "FILE", default_value = "history.json")]
    history: PathBuf,

    /// Override the number of sweeps.
    #[arg(long)]
    nsweeps: Option<usize>,

    /// Override the maximum bond dimension.
    #[arg(long)]
    chi_max: Option<usize>,

    /// Override the loss (mse, kld, mixed:<alpha>).
    #[arg(long)]
    loss: Option<Loss>,

    /// Override the optimizer (gd, sd, cg, lbfgs:<memory>).
    #[arg(long)]
    optimizer: Option<Optimizer>,

    /// Override the random seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Error)]
enum RunError {
    #[error("cannot read `{0}`: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("`{path}`, line {line}: {reason}")]
    Parse { path: PathBuf, line: usize, reason: String },

    #[error("`{0}` contains no samples")]
    Empty(PathBuf),

    #[error("`{0}` contains label {1:?}, which does not appear in the training data")]
    UnknownLabel(PathBuf, String),

    #[error(transparent)]
    Train(#[from] TrainError),

    #[error(transparent)]
    Network(#[from] MPSError),
}

/// Raw samples read from a data file, with labels not yet indexed.
struct Table {
    data: nd::Array2<f64>,
    labels: Vec<String>,
}

fn read_table(path: &Path) -> Result<Table, RunError> {
    let contents =
        std::fs::read_to_string(path)
        .map_err(|e| RunError::Read(path.to_path_buf(), e))?;
    parse_table(&contents, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<Table, RunError> {
    let parse_err = |line: usize, reason: String| {
        RunError::Parse { path: path.to_path_buf(), line, reason }
    };
    let mut labels: Vec<String> = Vec::new();
    let mut values: Vec<f64> = Vec::new();
    let mut ncols: Option<usize> = None;
    for (k, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') { continue; }
        let mut fields =
            line.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty());
        let Some(label) = fields.next() else { continue; };
        let row: Vec<f64> =
            fields
            .map(|f| f.parse::<f64>().map_err(|e| parse_err(k + 1, format!("{f:?}: {e}"))))
            .collect::<Result<_, _>>()?;
        match ncols {
            None if row.is_empty() => {
                return Err(parse_err(k + 1, "no values after the label".into()));
            },
            None => { ncols = Some(row.len()); },
            Some(n) if n != row.len() => {
                return Err(parse_err(k + 1, format!("expected {n} values, found {}", row.len())));
            },
            Some(_) => { },
        }
        labels.push(label.to_string());
        values.extend(row);
    }
    let Some(ncols) = ncols else { return Err(RunError::Empty(path.to_path_buf())); };
    let data =
        nd::Array2::from_shape_vec((labels.len(), ncols), values)
        .map_err(|e| parse_err(0, e.to_string()))?;
    Ok(Table { data, labels })
}

// assign class indices to the sorted distinct labels of the training data
fn index_labels(labels: &[String]) -> FxHashMap<String, usize> {
    labels.iter().cloned()
        .sorted()
        .dedup()
        .enumerate()
        .map(|(k, l)| (l, k))
        .collect()
}

fn apply_labels(
    table: &Table,
    index: &FxHashMap<String, usize>,
    path: &Path,
) -> Result<Vec<usize>, RunError>
{
    table.labels.iter()
        .map(|l| {
            index.get(l).copied()
                .ok_or_else(|| RunError::UnknownLabel(path.to_path_buf(), l.clone()))
        })
        .collect()
}

fn run<A>(opts: SweepOpts, args: &Args) -> Result<(), RunError>
where A: ComplexScalar
{
    let train = read_table(&args.train)?;
    let index = index_labels(&train.labels);
    info!(
        samples = train.labels.len(),
        sites = train.data.ncols(),
        classes = index.len(),
        "loaded training data"
    );
    let train_labels = apply_labels(&train, &index, &args.train)?;
    let load = |path: &Option<PathBuf>| -> Result<Option<(Table, Vec<usize>)>, RunError> {
        let Some(path) = path.as_ref() else { return Ok(None); };
        let table = read_table(path)?;
        let labels = apply_labels(&table, &index, path)?;
        info!(path = %path.display(), samples = labels.len(), "loaded data");
        Ok(Some((table, labels)))
    };
    let validation = load(&args.validation)?;
    let test = load(&args.test)?;

    let mut trainer: Trainer<A> =
        Trainer::from_raw(
            opts,
            (&train.data, train_labels.as_slice()),
            validation.as_ref().map(|(t, l)| (&t.data, l.as_slice())),
            test.as_ref().map(|(t, l)| (&t.data, l.as_slice())),
        )?;
    if let Some(path) = args.init.as_ref() {
        info!(path = %path.display(), "loading starting network");
        trainer.initialize(Some(MPS::load(path)?))?;
    }
    trainer.train()?;

    let (mps, history) = trainer.into_parts();
    if let Some(mps) = mps {
        mps.save(&args.output)?;
        info!(path = %args.output.display(), "wrote network");
    }
    history.save(&args.history)?;
    info!(path = %args.history.display(), "wrote metrics history");
    Ok(())
}

fn main() {
    let args = Args::parse();

    let log_level_filter =
        args.log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .init();

    let mut opts =
        match args.config.as_deref() {
            Some(path) => {
                info!("loading options from {}", path.display());
                match SweepOpts::from_json(path) {
                    Ok(opts) => opts,
                    Err(e) => {
                        error!("failed to load options: {e}");
                        std::process::exit(1);
                    },
                }
            },
            None => SweepOpts::default(),
        };
    if let Some(n) = args.nsweeps { opts.nsweeps = n; }
    if let Some(chi) = args.chi_max { opts.chi_max = chi; }
    if let Some(loss) = args.loss { opts.loss = loss; }
    if let Some(optimizer) = args.optimizer { opts.optimizer = optimizer; }
    if let Some(seed) = args.seed { opts.seed = Some(seed); }
    if let Err(e) = opts.validate() {
        error!("invalid options: {e}");
        std::process::exit(1);
    }
    info!(
        nsweeps = opts.nsweeps,
        chi_max = opts.chi_max,
        loss = ?opts.loss,
        optimizer = %opts.optimizer,
        basis = %opts.basis.name(),
        d = opts.d,
        "options"
    );

    let res =
        match opts.dtype {
            Dtype::Real => run::<f64>(opts, &args),
            Dtype::Complex => run::<C64>(opts, &args),
        };
    if let Err(e) = res {
        error!("{e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_delimiters() {
        let text = "# header\nb, 0.1, 0.2 0.3\n\na 0.4,0.5,0.6\n";
        let table = parse_table(text, Path::new("mem")).unwrap();
        assert_eq!(table.data.dim(), (2, 3));
        assert_eq!(table.labels, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(table.data[[1, 2]], 0.6);
        let index = index_labels(&table.labels);
        assert_eq!(index["a"], 0);
        assert_eq!(index["b"], 1);
        assert_eq!(apply_labels(&table, &index, Path::new("mem")).unwrap(), vec![1, 0]);
    }

    #[test]
    fn rejects_ragged_rows() {
        let text = "0 0.1 0.2\n1 0.3\n";
        assert!(matches!(
            parse_table(text, Path::new("mem")),
            Err(RunError::Parse { line: 2, .. }),
        ));
        assert!(matches!(parse_table("# nothing\n", Path::new("mem")), Err(RunError::Empty(_))));
    }

    #[test]
    fn unseen_labels_are_rejected() {
        let train = parse_table("x 0.1\ny 0.2\n", Path::new("train")).unwrap();
        let test = parse_table("z 0.3\n", Path::new("test")).unwrap();
        let index = index_labels(&train.labels);
        assert!(matches!(
            apply_labels(&test, &index, Path::new("test")),
            Err(RunError::UnknownLabel(_, l)) if l == "z",
        ));
    }
}
