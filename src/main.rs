//! Command-line driver for the re-identification engine.
//!
//! Three stages, usually run in order:
//!
//! - `train`: fit per-pair hurdle-gamma distributions from a training corpus
//!   and the cryptic background from unrelated anchor pairs, then persist
//!   the classifier store.
//! - `evaluate`: measure identification accuracy on a random sample of
//!   targets.
//! - `expand`: run snowball rounds, growing the anchor set from
//!   high-confidence identifications, with resumable checkpoints.

use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::error::Error;
use std::path::PathBuf;
use std::process;

use reident::bayes::{DEFAULT_SEARCH_GENERATIONS_BACK, DEFAULT_TOP_CANDIDATES, IdentifyConfig};
use reident::checkpoint::{load_json, save_json};
use reident::classifier::{
    ClassifierConfig, LengthClassifier, fit_cryptic, read_corpus_dir, train_classifier,
};
use reident::evaluation::{Evaluation, ExpansionConfig};
use reident::expansion::ExpansionData;
use reident::logging::{EventSink, JsonlSink, NullSink};
use reident::pop::{NodeId, PairTable, Population};

#[derive(Parser)]
#[command(name = "reident", version, about = "Genetic re-identification risk engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct CommonArgs {
    /// Population exported as JSON by the simulation side.
    population: PathBuf,

    /// Seed for every stochastic step (sampling, shuffles, fit jitter).
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Args)]
struct InferenceArgs {
    /// Trained classifier store produced by `train`.
    store: PathBuf,

    /// Precomputed pairwise IBD table (genome_a, genome_b, length).
    ibd: PathBuf,

    /// Minimum segment length below which sharing is treated as zero.
    #[arg(long, default_value_t = 5_000_000.0)]
    min_length: f64,

    /// Only consider candidates related to an anchor within this many
    /// generations.
    #[arg(long)]
    related_only: bool,

    #[arg(long, default_value_t = DEFAULT_SEARCH_GENERATIONS_BACK)]
    gen_back: usize,

    #[arg(long, default_value_t = DEFAULT_TOP_CANDIDATES)]
    top_candidates: usize,

    /// Write structured per-identification events to this JSON-lines file.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Fit the per-pair and cryptic distributions and persist the store.
    Train {
        #[command(flatten)]
        common: CommonArgs,

        /// Directory of per-anchor training files (one file per anchor id).
        corpus: PathBuf,

        /// Pairwise IBD table used for the cryptic background fit.
        ibd: PathBuf,

        #[arg(long, default_value = "store.json")]
        out: PathBuf,

        /// Number of anchors to draw cryptic pairs from.
        #[arg(long, default_value_t = 1000)]
        cryptic_sample: usize,

        #[arg(long, default_value_t = 5_000_000.0)]
        min_length: f64,
    },
    /// Identify a random sample of targets and report accuracy.
    Evaluate {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        inference: InferenceArgs,

        #[arg(long, default_value_t = 100)]
        num_targets: usize,
    },
    /// Run snowball expansion rounds with resumable checkpoints.
    Expand {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        inference: InferenceArgs,

        /// Confidence (log-likelihood ratio) required to accept an
        /// identification as a new anchor.
        #[arg(long)]
        threshold: f64,

        #[arg(long, default_value_t = 1)]
        rounds: u32,

        #[arg(long, default_value = "expansion.json")]
        checkpoint: PathBuf,

        /// Resume from the checkpoint instead of starting fresh.
        #[arg(long)]
        resume: bool,

        #[arg(long, default_value_t = 500)]
        checkpoint_interval: usize,
    },
}

fn main() {
    env_logger::init();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Command::Train {
            common,
            corpus,
            ibd,
            out,
            cryptic_sample,
            min_length,
        } => train(common, corpus, ibd, out, cryptic_sample, min_length),
        Command::Evaluate {
            common,
            inference,
            num_targets,
        } => evaluate(common, inference, num_targets),
        Command::Expand {
            common,
            inference,
            threshold,
            rounds,
            checkpoint,
            resume,
            checkpoint_interval,
        } => expand(
            common,
            inference,
            threshold,
            rounds,
            checkpoint,
            resume,
            checkpoint_interval,
        ),
    }
}

fn train(
    common: CommonArgs,
    corpus_dir: PathBuf,
    ibd: PathBuf,
    out: PathBuf,
    cryptic_sample: usize,
    min_length: f64,
) -> Result<(), Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(common.seed);
    log::info!("loading population from {}", common.population.display());
    let population = Population::load_json(&common.population)?;
    log::info!("reading training corpus from {}", corpus_dir.display());
    let corpus = read_corpus_dir(&corpus_dir)?;

    let config = ClassifierConfig {
        cryptic_anchor_sample: cryptic_sample,
        ..ClassifierConfig::default()
    };
    let mut classifier = train_classifier(&corpus, &population, &config, &mut rng);

    log::info!("fitting cryptic background from {}", ibd.display());
    let detector = PairTable::load_tsv(&ibd, min_length)?;
    let cryptic = fit_cryptic(
        &classifier,
        &population,
        &detector,
        config.cryptic_anchor_sample,
        &mut rng,
    )?;
    classifier.set_cryptic_params(cryptic);

    save_json(&out, &classifier)?;
    log::info!("wrote classifier store to {}", out.display());
    Ok(())
}

fn make_sink(events: &Option<PathBuf>) -> Result<Box<dyn EventSink>, Box<dyn Error>> {
    Ok(match events {
        Some(path) => Box::new(JsonlSink::create(path)?),
        None => Box::new(NullSink),
    })
}

fn identify_config(inference: &InferenceArgs) -> IdentifyConfig {
    IdentifyConfig {
        only_related: inference.related_only,
        search_generations_back: inference.gen_back,
        top_candidates: inference.top_candidates,
    }
}

/// Everyone with a genome who is not an anchor.
fn unlabeled_pool(population: &Population, classifier: &LengthClassifier) -> Vec<NodeId> {
    let anchors: ahash::AHashSet<NodeId> = classifier.labeled_nodes().iter().copied().collect();
    let mut pool: Vec<NodeId> = population
        .members()
        .filter(|node| node.genome.is_some() && !anchors.contains(&node.id))
        .map(|node| node.id)
        .collect();
    pool.sort_unstable();
    pool
}

fn evaluate(
    common: CommonArgs,
    inference: InferenceArgs,
    num_targets: usize,
) -> Result<(), Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(common.seed);
    let population = Population::load_json(&common.population)?;
    let classifier: LengthClassifier = load_json(&inference.store)?;
    let detector = PairTable::load_tsv(&inference.ibd, inference.min_length)?;
    let sink = make_sink(&inference.events)?;

    let mut targets = unlabeled_pool(&population, &classifier);
    targets.shuffle(&mut rng);
    targets.truncate(num_targets);

    let config = identify_config(&inference);
    let mut evaluation = Evaluation::new(population, classifier, config, detector, sink);
    evaluation.run_evaluation(&targets);
    evaluation.log_metrics();
    Ok(())
}

fn expand(
    common: CommonArgs,
    inference: InferenceArgs,
    threshold: f64,
    rounds: u32,
    checkpoint: PathBuf,
    resume: bool,
    checkpoint_interval: usize,
) -> Result<(), Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(common.seed);
    let mut population = Population::load_json(&common.population)?;
    let mut classifier: LengthClassifier = load_json(&inference.store)?;
    let detector = PairTable::load_tsv(&inference.ibd, inference.min_length)?;
    let sink = make_sink(&inference.events)?;

    let mut expansion = if resume {
        let mut expansion: ExpansionData = load_json(&checkpoint)?;
        expansion.rehydrate(&mut population);
        classifier.set_labeled_nodes(expansion.labeled_nodes());
        log::info!(
            "resumed expansion: {} rounds done, {} identifications accepted",
            expansion.rounds(),
            expansion.added().len()
        );
        expansion
    } else {
        ExpansionData::new(classifier.labeled_nodes().to_vec())
    };

    let pool = unlabeled_pool(&population, &classifier);
    let config = identify_config(&inference);
    let expansion_config = ExpansionConfig {
        confidence_threshold: threshold,
        checkpoint_interval,
    };
    let mut evaluation = Evaluation::new(population, classifier, config, detector, sink);

    for _ in 0..rounds {
        evaluation.run_expansion_round(
            &pool,
            &expansion_config,
            &mut expansion,
            Some(&checkpoint),
            &mut rng,
        )?;
    }
    log::info!(
        "expansion finished: {} rounds, {} identifications accepted ({} correct)",
        expansion.rounds(),
        expansion.added().len(),
        expansion.added().iter().filter(|r| r.correct).count()
    );
    Ok(())
}
