//! The Bayesian deanonymization engine.
//!
//! Given one target genome and a set of anchors with known identities, rank
//! every candidate identity by the likelihood of the observed IBD sharing
//! pattern. Each (candidate, anchor) pair either has a fitted hurdle-gamma
//! distribution from training, or falls back to the global cryptic
//! background distribution.
//!
//! The dominant cost is density evaluation over candidate x anchor pairs,
//! so the engine batches every fitted pair across all candidates into one
//! vectorized call and attributes slices of the result back to candidates by
//! prefix boundaries. Cryptic terms do not depend on the candidate, so they
//! are computed once per anchor and reused.

use ahash::{AHashMap, AHashSet};
use ndarray::Array1;
use rayon::prelude::*;
use serde_json::json;

use crate::classifier::{LengthClassifier, batch_evaluate_density};
use crate::logging::EventSink;
use crate::pop::{GenomeId, IbdDetector, Node, NodeId, Population};

/// How many ranked candidates to examine when picking the runner-up for the
/// confidence score. Eight is enough to contain the full sibling group in
/// populations with typical sibship sizes; tune it up for populations with
/// very large sibships.
pub const DEFAULT_TOP_CANDIDATES: usize = 8;

/// Default genealogical horizon for related-only search.
pub const DEFAULT_SEARCH_GENERATIONS_BACK: usize = 7;

#[derive(Debug, Clone)]
pub struct IdentifyConfig {
    /// Prune the candidate universe to individuals related to some anchor
    /// within `search_generations_back` generations. The key performance
    /// and precision lever: without it every query scans the whole
    /// population.
    pub only_related: bool,
    pub search_generations_back: usize,
    pub top_candidates: usize,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        IdentifyConfig {
            only_related: false,
            search_generations_back: DEFAULT_SEARCH_GENERATIONS_BACK,
            top_candidates: DEFAULT_TOP_CANDIDATES,
        }
    }
}

/// Outcome of a single identification.
#[derive(Debug, Clone)]
pub struct RawIdentified {
    /// True full-sibling group of the top candidate; identification counts
    /// as correct if the real target falls inside it.
    pub sibling_group: AHashSet<NodeId>,
    /// Log-likelihood gap between the top candidate and the best candidate
    /// outside its suspected sibling group. Negative infinity when there is
    /// no second opinion to compare against.
    pub ln_ratio: f64,
    pub identified: Option<NodeId>,
}

impl RawIdentified {
    fn no_opinion() -> Self {
        RawIdentified {
            sibling_group: AHashSet::new(),
            ln_ratio: f64::NEG_INFINITY,
            identified: None,
        }
    }
}

pub struct BayesDeanonymize {
    classifier: LengthClassifier,
    config: IdentifyConfig,
    anchor_set: AHashSet<NodeId>,
    /// Precomputed relatedness neighborhood per anchor (related-only mode).
    related: AHashMap<NodeId, AHashSet<NodeId>>,
    restrict_search: Option<AHashSet<NodeId>>,
    excluded_search: AHashSet<NodeId>,
    excluded_anchors: AHashSet<NodeId>,
}

impl BayesDeanonymize {
    pub fn new(classifier: LengthClassifier, config: IdentifyConfig, population: &Population) -> Self {
        let anchor_set: AHashSet<NodeId> = classifier.labeled_nodes().iter().copied().collect();
        let mut engine = BayesDeanonymize {
            classifier,
            config,
            anchor_set,
            related: AHashMap::new(),
            restrict_search: None,
            excluded_search: AHashSet::new(),
            excluded_anchors: AHashSet::new(),
        };
        if engine.config.only_related {
            log::info!(
                "only searching nodes related to anchors within {} generations",
                engine.config.search_generations_back
            );
            let anchors: Vec<NodeId> = engine.classifier.labeled_nodes().to_vec();
            for anchor in anchors {
                engine.compute_related(anchor, population);
            }
        }
        engine
    }

    pub fn classifier(&self) -> &LengthClassifier {
        &self.classifier
    }

    pub fn classifier_mut(&mut self) -> &mut LengthClassifier {
        &mut self.classifier
    }

    pub fn anchors(&self) -> &[NodeId] {
        self.classifier.labeled_nodes()
    }

    fn compute_related(&mut self, anchor: NodeId, population: &Population) {
        let neighborhood: AHashSet<NodeId> = population
            .all_related(anchor, true, self.config.search_generations_back)
            .into_iter()
            .filter(|&id| population.node(id).genome.is_some())
            .collect();
        self.related.insert(anchor, neighborhood);
    }

    /// Appends an anchor to the active set; no-op if already present. In
    /// related-only mode the anchor's neighborhood is computed here, at the
    /// time it is added.
    pub fn add_anchor(&mut self, id: NodeId, population: &Population) {
        if !self.anchor_set.insert(id) {
            return;
        }
        self.classifier.add_labeled_node(id);
        if self.config.only_related {
            self.compute_related(id, population);
        }
    }

    pub fn remove_anchor(&mut self, id: NodeId) {
        if self.anchor_set.remove(&id) {
            self.classifier.remove_labeled_node(id);
            self.related.remove(&id);
        }
    }

    /// Intersects the searchable candidate universe with the given set.
    pub fn restrict_search<I: IntoIterator<Item = NodeId>>(&mut self, nodes: I) {
        self.restrict_search = Some(nodes.into_iter().collect());
    }

    pub fn clear_search_restriction(&mut self) {
        self.restrict_search = None;
    }

    /// Removes individuals from the candidate universe without touching the
    /// anchor set; used for out-of-genealogy ablations.
    pub fn exclude_from_search<I: IntoIterator<Item = NodeId>>(&mut self, nodes: I) {
        self.excluded_search = nodes.into_iter().collect();
    }

    /// Withholds anchors from the evidence set without removing them.
    pub fn exclude_anchors<I: IntoIterator<Item = NodeId>>(&mut self, nodes: I) {
        self.excluded_anchors = nodes.into_iter().collect();
    }

    /// The candidate universe for a target of the given sex: everyone with a
    /// genome and the right sex, minus anchors and exclusions, pruned to
    /// anchor neighborhoods in related-only mode.
    fn to_search(&self, target: &Node, shared: &[(NodeId, f64)], population: &Population) -> Vec<NodeId> {
        let base = |id: NodeId, node: &Node| {
            node.genome.is_some()
                && node.sex == target.sex
                && !self.anchor_set.contains(&id)
                && !self.excluded_search.contains(&id)
        };

        let mut universe: AHashSet<NodeId> = if self.config.only_related {
            let mut potential = AHashSet::new();
            for &(anchor, length) in shared {
                if length > 0.0 {
                    if let Some(neighborhood) = self.related.get(&anchor) {
                        potential.extend(neighborhood.iter().copied());
                    }
                }
            }
            potential
                .into_iter()
                .filter(|&id| base(id, population.node(id)))
                .collect()
        } else {
            population
                .members()
                .filter(|node| base(node.id, node))
                .map(|node| node.id)
                .collect()
        };

        if let Some(restriction) = &self.restrict_search {
            universe.retain(|id| restriction.contains(id));
        }

        let mut candidates: Vec<NodeId> = universe.into_iter().collect();
        candidates.sort_unstable();
        candidates
    }

    /// Identifies the most probable identity for `genome`.
    ///
    /// `target` is the ground-truth individual, used only for the candidate
    /// sex filter and result scoring; the evidence path never reads its
    /// links. Returns the true full-sibling group of the top candidate, the
    /// log-likelihood-ratio confidence, and the top candidate itself.
    pub fn identify<D: IbdDetector>(
        &self,
        genome: GenomeId,
        target: &Node,
        population: &Population,
        detector: &D,
        sink: &mut dyn EventSink,
    ) -> RawIdentified {
        // Observed IBD length against every active anchor, through the
        // anchor's suspected genome when an override is in place.
        let mut shared: Vec<(NodeId, f64)> = Vec::with_capacity(self.anchors().len());
        for &anchor in self.classifier.labeled_nodes() {
            if self.excluded_anchors.contains(&anchor) {
                continue;
            }
            let Some(anchor_genome) = population.node(anchor).observed_genome() else {
                continue;
            };
            shared.push((anchor, detector.shared_segment_length(genome, anchor_genome)));
        }

        let candidates = self.to_search(target, &shared, population);
        if candidates.is_empty() {
            return RawIdentified::no_opinion();
        }

        // Cryptic log-densities depend only on the anchor's observed length,
        // so compute them once and reuse across every candidate.
        let anchor_lengths = Array1::from_iter(shared.iter().map(|&(_, length)| length));
        let cryptic_density = self.classifier.batch_smoothing_density(anchor_lengths.view());
        let cryptic_ln: AHashMap<NodeId, f64> = shared
            .iter()
            .zip(cryptic_density.iter())
            .map(|(&(anchor, _), &density)| (anchor, density.ln()))
            .collect();
        let total_cryptic_ln: f64 = cryptic_ln.values().sum();
        let shared_by_anchor: AHashMap<NodeId, f64> = shared.iter().copied().collect();

        // Batch every fitted (candidate, anchor) pair across all candidates
        // into one density evaluation; `bounds[i]..bounds[i+1]` is candidate
        // i's slice of the batch.
        let mut batch_lengths = Vec::new();
        let mut batch_shapes = Vec::new();
        let mut batch_scales = Vec::new();
        let mut batch_zero_probs = Vec::new();
        let mut bounds = Vec::with_capacity(candidates.len() + 1);
        // Cryptic part per candidate: total minus the anchors that have a
        // fitted distribution with it.
        let mut cryptic_part = vec![total_cryptic_ln; candidates.len()];

        bounds.push(0);
        for (i, &candidate) in candidates.iter().enumerate() {
            if let Some(entry) = self.classifier.fitted_anchors(candidate) {
                for (anchor, params) in entry.iter() {
                    let Some(&length) = shared_by_anchor.get(&anchor) else {
                        // Not an active anchor in this query.
                        continue;
                    };
                    batch_lengths.push(length);
                    batch_shapes.push(params.shape);
                    batch_scales.push(params.scale);
                    batch_zero_probs.push(params.zero_prob);
                    cryptic_part[i] -= cryptic_ln[&anchor];
                }
            }
            bounds.push(batch_lengths.len());
        }

        let densities = if batch_lengths.is_empty() {
            Array1::zeros(0)
        } else {
            let (densities, _floored) = batch_evaluate_density(
                Array1::from(batch_lengths).view(),
                Array1::from(batch_shapes).view(),
                Array1::from(batch_scales).view(),
                Array1::from(batch_zero_probs).view(),
            );
            densities
        };
        let log_densities = densities.mapv(f64::ln);
        let log_density_slice = log_densities.as_slice().unwrap_or(&[]);

        let log_probs: Vec<f64> = (0..candidates.len())
            .into_par_iter()
            .map(|i| {
                let fitted: f64 = log_density_slice[bounds[i]..bounds[i + 1]].iter().sum();
                fitted + cryptic_part[i]
            })
            .collect();

        if sink.enabled() {
            let probs: serde_json::Map<String, serde_json::Value> = candidates
                .iter()
                .zip(&log_probs)
                .map(|(id, &lp)| (id.to_string(), json!(lp)))
                .collect();
            sink.write("identify", json!({ "node": target.id, "probs": probs }));
        }

        let mut ranked: Vec<(NodeId, f64)> =
            candidates.iter().copied().zip(log_probs.iter().copied()).collect();
        // Descending by log-probability; id order breaks exact ties so the
        // ranking is deterministic.
        ranked.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(self.config.top_candidates.max(1));

        let (top, top_log_prob) = ranked[0];
        let ln_ratio = if ranked.len() < 2 {
            f64::NEG_INFINITY
        } else {
            // The runner-up is the best candidate that is not a suspected
            // sibling of the top; comparing against a sibling would make
            // every large sibship look ambiguous. If the whole examined
            // prefix is one sibship, fall back to rank 2.
            let suspected_group = population.suspected_sibling_group(top);
            let runner_up_log_prob = ranked[1..]
                .iter()
                .find(|(id, _)| !suspected_group.contains(id))
                .map(|&(_, lp)| lp)
                .unwrap_or(ranked[1].1);
            top_log_prob - runner_up_log_prob
        };

        if sink.enabled() {
            sink.write(
                "identified",
                json!({ "node": target.id, "chosen": top.0, "ln_ratio": ln_ratio }),
            );
        }

        RawIdentified {
            sibling_group: population.sibling_group(top),
            ln_ratio,
            identified: Some(top),
        }
    }
}
