//! Evaluation and expansion driver.
//!
//! Wraps the deanonymization engine with accuracy bookkeeping and runs the
//! snowball protocol: identify candidates one at a time, accept anything
//! above the confidence threshold as a new anchor, and checkpoint the
//! expansion state periodically so a multi-day run survives interruption.

use ahash::{AHashMap, AHashSet};
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::json;
use std::path::Path;

use crate::bayes::{BayesDeanonymize, IdentifyConfig, RawIdentified};
use crate::checkpoint::{CheckpointError, save_json};
use crate::classifier::LengthClassifier;
use crate::expansion::{ExpansionData, FlatIdentifyResult};
use crate::logging::EventSink;
use crate::pop::{IbdDetector, NodeId, Population};

/// One recorded identification attempt.
#[derive(Debug, Clone)]
pub struct IdentifyResult {
    pub target: NodeId,
    pub sibling_group: AHashSet<NodeId>,
    pub identified: Option<NodeId>,
    pub ln_ratio: f64,
    /// True when the real target fell inside the returned sibling group.
    pub correct: bool,
    pub round: u32,
}

#[derive(Debug, Clone)]
pub struct ExpansionConfig {
    /// Accept an identification as a new anchor when its log-likelihood
    /// ratio exceeds this.
    pub confidence_threshold: f64,
    /// Checkpoint the expansion state every this many processed candidates.
    pub checkpoint_interval: usize,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        ExpansionConfig {
            confidence_threshold: 0.0,
            checkpoint_interval: 500,
        }
    }
}

/// Per-generation and overall accuracy counters.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub correct: usize,
    pub incorrect: usize,
    by_generation: AHashMap<usize, (usize, usize)>,
}

impl Metrics {
    pub fn total(&self) -> usize {
        self.correct + self.incorrect
    }

    pub fn accuracy(&self) -> f64 {
        self.correct as f64 / self.total() as f64
    }

    fn record(&mut self, generation: usize, correct: bool) {
        let entry = self.by_generation.entry(generation).or_default();
        if correct {
            self.correct += 1;
            entry.0 += 1;
        } else {
            self.incorrect += 1;
            entry.1 += 1;
        }
    }

    pub fn by_generation(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        let mut generations: Vec<usize> = self.by_generation.keys().copied().collect();
        generations.sort_unstable();
        generations.into_iter().map(|generation| {
            let (correct, incorrect) = self.by_generation[&generation];
            (generation, correct, incorrect)
        })
    }
}

pub struct Evaluation<D: IbdDetector> {
    population: Population,
    engine: BayesDeanonymize,
    detector: D,
    sink: Box<dyn EventSink>,
    run_number: u32,
    metrics: Metrics,
    results: Vec<IdentifyResult>,
}

impl<D: IbdDetector> Evaluation<D> {
    pub fn new(
        population: Population,
        classifier: LengthClassifier,
        config: IdentifyConfig,
        detector: D,
        sink: Box<dyn EventSink>,
    ) -> Self {
        let engine = BayesDeanonymize::new(classifier, config, &population);
        Evaluation {
            population,
            engine,
            detector,
            sink,
            run_number: 0,
            metrics: Metrics::default(),
            results: Vec::new(),
        }
    }

    pub fn population(&self) -> &Population {
        &self.population
    }

    pub fn population_mut(&mut self) -> &mut Population {
        &mut self.population
    }

    pub fn engine(&self) -> &BayesDeanonymize {
        &self.engine
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn results(&self) -> &[IdentifyResult] {
        &self.results
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = Metrics::default();
        self.results.clear();
    }

    pub fn add_anchor(&mut self, id: NodeId) {
        self.engine.add_anchor(id, &self.population);
    }

    pub fn restrict_search<I: IntoIterator<Item = NodeId>>(&mut self, nodes: I) {
        self.engine.restrict_search(nodes);
    }

    fn evaluate_node(&mut self, target_id: NodeId) -> IdentifyResult {
        let target = self.population.node(target_id);
        let raw = match target.genome {
            Some(genome) => self.engine.identify(
                genome,
                target,
                &self.population,
                &self.detector,
                &mut *self.sink,
            ),
            None => {
                log::warn!("target {target_id} has no genome, recording a no-opinion result");
                RawIdentified {
                    sibling_group: AHashSet::new(),
                    ln_ratio: f64::NEG_INFINITY,
                    identified: None,
                }
            }
        };

        let correct = raw.sibling_group.contains(&target_id);
        let generation = self.population.node(target_id).generation;
        self.metrics.record(generation, correct);
        log::debug!(
            "target {target_id}: identified {:?}, ln ratio {:.3}, {}",
            raw.identified,
            raw.ln_ratio,
            if correct { "correct" } else { "incorrect" }
        );
        self.sink.write(
            "evaluate",
            json!({
                "target node": target_id,
                "log ratio": raw.ln_ratio,
                "identified": raw.sibling_group.iter().map(|id| id.0).collect::<Vec<_>>(),
                "run_number": self.run_number,
            }),
        );

        let result = IdentifyResult {
            target: target_id,
            sibling_group: raw.sibling_group,
            identified: raw.identified,
            ln_ratio: raw.ln_ratio,
            correct,
            round: self.run_number,
        };
        self.results.push(result.clone());
        result
    }

    /// Identifies each target once, recording results and accuracy.
    pub fn run_evaluation(&mut self, targets: &[NodeId]) -> &[IdentifyResult] {
        log::info!("attempting to identify {} nodes", targets.len());
        let first = self.results.len();
        for &target in targets {
            self.evaluate_node(target);
        }
        self.run_number += 1;
        &self.results[first..]
    }

    pub fn log_metrics(&mut self) {
        let total = self.metrics.total();
        if total == 0 {
            return;
        }
        let accuracy = self.metrics.accuracy();
        let std_dev = (accuracy * (1.0 - accuracy) * total as f64).sqrt() / total as f64;
        log::info!(
            "{} correct, {} incorrect, {} total ({:.4} ± {:.4} accurate)",
            self.metrics.correct,
            self.metrics.incorrect,
            total,
            accuracy,
            std_dev
        );
        for (generation, correct, incorrect) in self.metrics.by_generation() {
            let gen_total = correct + incorrect;
            log::info!(
                "generation {generation}: {:.4} accuracy, {gen_total} total",
                correct as f64 / gen_total as f64
            );
        }
        self.sink.write("correct", json!(self.metrics.correct));
        self.sink.write("incorrect", json!(self.metrics.incorrect));
        self.sink.write("total", json!(total));
    }

    /// Runs one snowball round over `pool` (or the unprocessed remainder of
    /// an interrupted round, if the expansion state carries one).
    ///
    /// Every accepted identification immediately becomes an anchor, so later
    /// targets in the same round are identified against the grown set. A
    /// re-identified target displaces its previous claimant; a claimant left
    /// with no target is dropped from the anchor set again unless it was a
    /// starting anchor.
    pub fn run_expansion_round<R: Rng + ?Sized>(
        &mut self,
        pool: &[NodeId],
        config: &ExpansionConfig,
        expansion: &mut ExpansionData,
        checkpoint_path: Option<&Path>,
        rng: &mut R,
    ) -> Result<Vec<FlatIdentifyResult>, CheckpointError> {
        log::info!(
            "running expansion round {} with threshold {}",
            expansion.rounds(),
            config.confidence_threshold
        );
        self.sink
            .write("expansion_confidence_ratio", json!(config.confidence_threshold));

        let mut to_evaluate = match expansion.take_remaining() {
            Some(remaining) => {
                log::info!("resuming interrupted round: {} candidates left", remaining.len());
                remaining
            }
            None => pool.to_vec(),
        };
        if expansion.original_pool().is_none() {
            expansion.set_original_pool(to_evaluate.clone());
        }
        to_evaluate.shuffle(rng);

        let mut added = Vec::new();
        let mut correct_added = 0usize;
        for i in 0..to_evaluate.len() {
            let target = to_evaluate[i];
            let result = self.evaluate_node(target);
            if let Some(identified) = result.identified.filter(|_| result.ln_ratio > config.confidence_threshold) {
                log::debug!("accepting {identified} as anchor for target {target}");
                self.engine.add_anchor(identified, &self.population);
                let previous = expansion.add_node(&result, &mut self.population);
                if let Some(previous) = previous {
                    if !expansion.is_claimant(previous) && !expansion.is_start_anchor(previous) {
                        self.engine.remove_anchor(previous);
                    }
                }
                if result.correct {
                    correct_added += 1;
                }
                added.push(FlatIdentifyResult::from_result(&result));
            }

            let processed = i + 1;
            if processed % config.checkpoint_interval == 0 {
                if let Some(path) = checkpoint_path {
                    expansion.set_remaining(Some(to_evaluate[processed..].to_vec()));
                    save_json(path, expansion)?;
                    self.sink.write(
                        "expansion_data_written",
                        json!({ "current_node": target.0, "complete": false }),
                    );
                }
            }
        }

        expansion.set_remaining(None);
        expansion.add_round();
        if let Some(path) = checkpoint_path {
            save_json(path, expansion)?;
            self.sink
                .write("expansion_data_written", json!({ "complete": true }));
        }

        self.sink.write(
            "expansion_round",
            json!({
                "added": added.len(),
                "correct_added": correct_added,
                "accuracy": self.metrics.accuracy(),
            }),
        );
        self.log_metrics();
        if added.is_empty() {
            log::warn!(
                "no nodes added this round; the confidence threshold {} may be miscalibrated \
                 for the current anchor density",
                config.confidence_threshold
            );
        } else {
            log::info!(
                "added {} nodes this round ({} correct)",
                added.len(),
                correct_added
            );
        }
        Ok(added)
    }
}
