//! Runs the deep-set hyperparameter search.
//!
//! ```bash
//! # 100 trials of the default study, stored in ./db.sqlite3
//! deepset
//!
//! # Resume a named study with a configuration file
//! deepset --config experiment.toml --study-name deep-set --n-trials 20
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use deepset::{
    batch::PaddedBatch,
    config::{Config, SamplerKind},
    dataset::generate,
    search::{MedianPruner, RandomSampler, SqliteStorage, Study, TpeSampler},
    train::{train, Hyperparams},
};
use log::info;
use rand::{rngs::StdRng, SeedableRng};

#[derive(Parser)]
#[command(name = "deepset")]
#[command(about = "Hyperparameter search for a deep-set regressor on synthetic sets")]
struct Args {
    /// TOML configuration file; defaults apply to everything it leaves out
    #[arg(long)]
    config: Option<PathBuf>,

    /// Study to create or resume
    #[arg(long)]
    study_name: Option<String>,

    /// SQLite database holding the trials
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Number of trials to run
    #[arg(long)]
    n_trials: Option<usize>,

    /// Largest number of elements in a generated set
    #[arg(long)]
    ceiling: Option<usize>,
}

impl Args {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(name) = &self.study_name {
            config.search.study_name = name.clone();
        }
        if let Some(storage) = &self.storage {
            config.search.storage = storage.clone();
        }
        if let Some(n) = self.n_trials {
            config.search.n_trials = n;
        }
        if let Some(ceiling) = self.ceiling {
            config.generator.ceiling = ceiling;
        }
        Ok(config)
    }
}

fn open_study(config: &Config) -> Result<Study> {
    let search = &config.search;
    let storage = SqliteStorage::open(&search.storage)
        .with_context(|| format!("cannot open {}", search.storage.display()))?;
    let pruner = MedianPruner {
        n_startup_trials: search.pruner_startup_trials,
        n_warmup_steps: search.pruner_warmup_steps,
        ..MedianPruner::default()
    };
    let study = match search.sampler {
        SamplerKind::Tpe => Study::open(
            storage,
            &search.study_name,
            TpeSampler::new(search.sampler_seed),
            pruner,
        ),
        SamplerKind::Random => Study::open(
            storage,
            &search.study_name,
            RandomSampler::new(search.sampler_seed),
            pruner,
        ),
    };
    study.with_context(|| format!("cannot load study {:?}", search.study_name))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = Args::parse().config()?;

    let train_set = generate(
        &mut StdRng::seed_from_u64(config.batch.train_seed),
        config.batch.train_sets,
        &config.generator,
    );
    let test_set = generate(
        &mut StdRng::seed_from_u64(config.batch.test_seed),
        config.batch.test_sets,
        &config.generator,
    );
    let max_elements = config
        .batch
        .max_elements
        .unwrap_or_else(|| train_set.iter().map(|s| s.len()).sum());
    let train_batch = PaddedBatch::new(&train_set, max_elements, config.batch.max_sets)
        .context("cannot batch the training sets")?;
    let test_batch = PaddedBatch::tight(&test_set).context("cannot batch the test sets")?;

    let mut study = open_study(&config)?;
    study.optimize(config.search.n_trials, |trial| {
        let hp = Hyperparams::suggest(trial, &config.search.space)?;
        let report = train(trial, &hp, &train_batch, &test_batch, &config.train)?;
        Ok(f64::from(report.best_test_loss))
    })?;

    match study.best_trial()? {
        Some(best) => {
            info!("best trial: {}", best.number);
            println!("Best value: {}", best.value.unwrap_or(f64::NAN));
            println!(
                "Best parameters: {}",
                serde_json::to_string(&best.readable_params())?
            );
        }
        None => println!("No trial of study {:?} has completed", study.name()),
    }
    Ok(())
}
