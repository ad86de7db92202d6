//! The length classifier: a sparse store of fitted hurdle-gamma
//! distributions keyed by (candidate, anchor), plus the single cryptic
//! background distribution used for every pair with no fitted relationship.
//!
//! Storage is a struct-of-arrays per candidate (sorted anchor ids with
//! parallel shape/scale/zero-probability arrays), which keeps lookups sparse
//! while letting the engine batch thousands of density evaluations into one
//! vectorized call. Absent pairs are genuinely absent, never zero-filled:
//! "no fitted distribution" is information, and the caller must fall back to
//! the cryptic distribution.

use ahash::AHashMap;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

use crate::gamma::{HurdleGammaParams, fit_hurdle_gamma, fit_hurdle_gamma_rows};
use crate::pop::{IbdDetector, NodeId, Population};
use crate::special::gamma_pdf;

/// Floor applied to any non-positive or non-finite density so that
/// downstream `ln()` stays finite. A deliberate smoothing constant, not an
/// error condition.
pub const DENSITY_FLOOR: f64 = 1e-12;

/// Background distribution for cryptic relatedness, fitted on a large
/// simulated population. Used when a classifier is built or imported without
/// its own cryptic fit.
pub const DEFAULT_CRYPTIC: HurdleGammaParams =
    HurdleGammaParams::new(1.2088571040214136, 11_686_532.312642237, 0.9876864782229996);

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Cryptic distribution to start from; replaced by [`fit_cryptic`] when
    /// training data allows.
    pub cryptic: HurdleGammaParams,
    /// How many anchors to draw cryptic pairs from. Pairs are taken from a
    /// deterministically shuffled prefix so that evaluation sees the same
    /// "analyst-visible" anchors.
    pub cryptic_anchor_sample: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            cryptic: DEFAULT_CRYPTIC,
            cryptic_anchor_sample: 1000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("I/O error reading training corpus: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "cryptic fit failed: only {positive} positive lengths among {pairs} unrelated anchor pairs"
    )]
    InsufficientCrypticData { pairs: usize, positive: usize },
}

/// Fitted anchors for one candidate, sorted by anchor id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateEntry {
    anchors: Vec<NodeId>,
    shapes: Vec<f64>,
    scales: Vec<f64>,
    zero_probs: Vec<f64>,
}

impl CandidateEntry {
    fn insert(&mut self, anchor: NodeId, params: HurdleGammaParams) {
        match self.anchors.binary_search(&anchor) {
            Ok(i) => {
                self.shapes[i] = params.shape;
                self.scales[i] = params.scale;
                self.zero_probs[i] = params.zero_prob;
            }
            Err(i) => {
                self.anchors.insert(i, anchor);
                self.shapes.insert(i, params.shape);
                self.scales.insert(i, params.scale);
                self.zero_probs.insert(i, params.zero_prob);
            }
        }
    }

    pub fn get(&self, anchor: NodeId) -> Option<HurdleGammaParams> {
        let i = self.anchors.binary_search(&anchor).ok()?;
        Some(HurdleGammaParams::new(
            self.shapes[i],
            self.scales[i],
            self.zero_probs[i],
        ))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, HurdleGammaParams)> + '_ {
        self.anchors.iter().enumerate().map(|(i, &anchor)| {
            (
                anchor,
                HurdleGammaParams::new(self.shapes[i], self.scales[i], self.zero_probs[i]),
            )
        })
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

/// Classifies identity hypotheses by the total length of shared segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LengthClassifier {
    distributions: AHashMap<NodeId, CandidateEntry>,
    labeled_nodes: Vec<NodeId>,
    cryptic: HurdleGammaParams,
}

impl LengthClassifier {
    pub fn new(cryptic: HurdleGammaParams) -> Self {
        LengthClassifier {
            distributions: AHashMap::new(),
            labeled_nodes: Vec::new(),
            cryptic,
        }
    }

    /// The anchors whose training data contributed to this store.
    pub fn labeled_nodes(&self) -> &[NodeId] {
        &self.labeled_nodes
    }

    /// Appends an anchor to the labeled set; no-op if already present. A
    /// newly added anchor with no stored distributions relies entirely on
    /// the cryptic fallback.
    pub fn add_labeled_node(&mut self, id: NodeId) {
        if !self.labeled_nodes.contains(&id) {
            self.labeled_nodes.push(id);
        }
    }

    pub fn remove_labeled_node(&mut self, id: NodeId) {
        self.labeled_nodes.retain(|&n| n != id);
    }

    pub fn set_labeled_nodes(&mut self, ids: Vec<NodeId>) {
        self.labeled_nodes = ids;
    }

    pub fn cryptic_params(&self) -> HurdleGammaParams {
        self.cryptic
    }

    pub fn set_cryptic_params(&mut self, params: HurdleGammaParams) {
        self.cryptic = params;
    }

    pub fn insert_distribution(
        &mut self,
        candidate: NodeId,
        anchor: NodeId,
        params: HurdleGammaParams,
    ) {
        self.distributions
            .entry(candidate)
            .or_default()
            .insert(anchor, params);
    }

    pub fn get_distribution(
        &self,
        candidate: NodeId,
        anchor: NodeId,
    ) -> Option<HurdleGammaParams> {
        self.distributions.get(&candidate)?.get(anchor)
    }

    pub fn contains(&self, candidate: NodeId, anchor: NodeId) -> bool {
        self.get_distribution(candidate, anchor).is_some()
    }

    /// All fitted anchors for a candidate, or `None` when the candidate has
    /// no fitted pair at all (fully cryptic).
    pub fn fitted_anchors(&self, candidate: NodeId) -> Option<&CandidateEntry> {
        self.distributions.get(&candidate)
    }

    pub fn num_distributions(&self) -> usize {
        self.distributions.values().map(CandidateEntry::len).sum()
    }

    /// Vectorized hurdle density under the cryptic background distribution,
    /// for anchors with no fitted relationship to a candidate.
    pub fn batch_smoothing_density(&self, lengths: ArrayView1<'_, f64>) -> Array1<f64> {
        let HurdleGammaParams {
            shape,
            scale,
            zero_prob,
        } = self.cryptic;
        lengths.mapv(|length| floor_density(hurdle_density(length, shape, scale, zero_prob)))
    }
}

fn hurdle_density(length: f64, shape: f64, scale: f64, zero_prob: f64) -> f64 {
    if length == 0.0 {
        zero_prob
    } else {
        (1.0 - zero_prob) * gamma_pdf(length, shape, scale)
    }
}

fn floor_density(value: f64) -> f64 {
    // `!(value > 0.0)` also catches NaN from pathological parameters.
    if value > 0.0 && value.is_finite() {
        value
    } else {
        DENSITY_FLOOR
    }
}

/// Vectorized hurdle-gamma density evaluation over parallel parameter
/// arrays. Returns the densities and a flag per entry marking values that
/// were raised to [`DENSITY_FLOOR`].
///
/// Mismatched input lengths are a caller bug and panic immediately.
pub fn batch_evaluate_density(
    lengths: ArrayView1<'_, f64>,
    shapes: ArrayView1<'_, f64>,
    scales: ArrayView1<'_, f64>,
    zero_probs: ArrayView1<'_, f64>,
) -> (Array1<f64>, Vec<bool>) {
    assert!(
        lengths.len() == shapes.len()
            && lengths.len() == scales.len()
            && lengths.len() == zero_probs.len(),
        "batch_evaluate_density: mismatched input lengths ({}, {}, {}, {})",
        lengths.len(),
        shapes.len(),
        scales.len(),
        zero_probs.len()
    );
    let mut floored = vec![false; lengths.len()];
    let mut densities = Array1::zeros(lengths.len());
    for i in 0..lengths.len() {
        let raw = hurdle_density(lengths[i], shapes[i], scales[i], zero_probs[i]);
        let value = floor_density(raw);
        floored[i] = !(raw > 0.0 && raw.is_finite());
        densities[i] = value;
    }
    (densities, floored)
}

/// Training observations contributed by one anchor: `(candidate, length)`
/// pairs accumulated over simulation iterations.
#[derive(Debug, Clone)]
pub struct AnchorRecords {
    pub anchor: NodeId,
    pub observations: Vec<(NodeId, f64)>,
}

/// Reads a training corpus directory: one file per anchor, named by the
/// anchor id, containing tab-separated `candidate_id length` lines.
///
/// An interrupted training run can leave partial lines behind; malformed
/// lines and unparseable filenames are skipped with a warning rather than
/// failing the whole import.
pub fn read_corpus_dir(directory: &Path) -> Result<Vec<AnchorRecords>, ClassifierError> {
    let mut corpus = Vec::new();
    let mut entries: Vec<_> = fs::read_dir(directory)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        let Some(anchor) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            log::warn!("skipping corpus file with non-numeric name {name:?}");
            continue;
        };
        let reader = BufReader::new(File::open(entry.path())?);
        let mut observations = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let parsed = (|| {
                let candidate = fields.next()?.parse::<u32>().ok()?;
                let length = fields.next()?.trim_end().parse::<f64>().ok()?;
                Some((NodeId(candidate), length))
            })();
            match parsed {
                Some(observation) => observations.push(observation),
                None => log::warn!("skipping malformed corpus line: {line:?}"),
            }
        }
        corpus.push(AnchorRecords {
            anchor: NodeId(anchor),
            observations,
        });
    }
    Ok(corpus)
}

/// Builds a classifier from a training corpus: per (candidate, anchor) pair
/// with enough positive observations, fit and store a hurdle-gamma; the
/// contributing anchors become the labeled set. Pairs with insufficient data
/// are omitted, not zero-filled. Candidates absent from the population are
/// reported and skipped.
pub fn train_classifier<R: Rng + ?Sized>(
    corpus: &[AnchorRecords],
    population: &Population,
    config: &ClassifierConfig,
    rng: &mut R,
) -> LengthClassifier {
    let mut classifier = LengthClassifier::new(config.cryptic);
    for records in corpus {
        classifier.add_labeled_node(records.anchor);

        let mut by_candidate: AHashMap<NodeId, Vec<f64>> = AHashMap::new();
        for &(candidate, length) in &records.observations {
            if !population.contains(candidate) {
                log::warn!(
                    "anchor {}: no node with id {} in population, skipping observation",
                    records.anchor,
                    candidate
                );
                continue;
            }
            by_candidate.entry(candidate).or_default().push(length);
        }
        if by_candidate.is_empty() {
            continue;
        }

        // Pack this anchor's candidates into a NaN-padded matrix and fit
        // every row in one batched pass.
        let mut candidates: Vec<NodeId> = by_candidate.keys().copied().collect();
        candidates.sort_unstable();
        let width = by_candidate.values().map(Vec::len).max().unwrap_or(0);
        let mut matrix = Array2::from_elem((candidates.len(), width), f64::NAN);
        for (row, candidate) in candidates.iter().enumerate() {
            for (col, &length) in by_candidate[candidate].iter().enumerate() {
                matrix[[row, col]] = length;
            }
        }
        let fits = fit_hurdle_gamma_rows(matrix.view(), rng);
        for (candidate, fit) in candidates.into_iter().zip(fits) {
            if let Some(params) = fit {
                classifier.insert_distribution(candidate, records.anchor, params);
            }
        }
    }
    log::info!(
        "trained classifier: {} anchors, {} fitted distributions",
        classifier.labeled_nodes().len(),
        classifier.num_distributions()
    );
    classifier
}

/// Fits the cryptic background distribution from anchor pairs with no known
/// relationship inside the training horizon.
///
/// The anchor ids are sorted and then shuffled with the injected seeded RNG,
/// so that a deterministic seed reproduces the same analyst-visible prefix
/// across runs. Pairs that have a fitted distribution in either direction
/// are related within the horizon and excluded.
pub fn fit_cryptic<D, R>(
    classifier: &LengthClassifier,
    population: &Population,
    detector: &D,
    sample_size: usize,
    rng: &mut R,
) -> Result<HurdleGammaParams, ClassifierError>
where
    D: IbdDetector,
    R: Rng + ?Sized,
{
    let mut anchors: Vec<NodeId> = classifier.labeled_nodes().to_vec();
    anchors.sort_unstable();
    anchors.shuffle(rng);
    anchors.truncate(sample_size);

    let mut lengths = Vec::new();
    for (&a, &b) in anchors.iter().tuple_combinations() {
        if classifier.contains(a, b) || classifier.contains(b, a) {
            continue;
        }
        let (Some(genome_a), Some(genome_b)) =
            (population.node(a).genome, population.node(b).genome)
        else {
            continue;
        };
        lengths.push(detector.shared_segment_length(genome_a, genome_b));
    }

    let pairs = lengths.len();
    fit_hurdle_gamma(&lengths, rng).ok_or_else(|| ClassifierError::InsufficientCrypticData {
        pairs,
        positive: lengths.iter().filter(|&&x| x != 0.0).count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn params(shape: f64, scale: f64, zero_prob: f64) -> HurdleGammaParams {
        HurdleGammaParams::new(shape, scale, zero_prob)
    }

    #[test]
    fn sparse_lookup_and_fallback() {
        let mut classifier = LengthClassifier::new(DEFAULT_CRYPTIC);
        classifier.insert_distribution(NodeId(1), NodeId(7), params(2.0, 3.0, 0.5));
        assert!(classifier.get_distribution(NodeId(1), NodeId(7)).is_some());
        // Absent pairs are absent, not zero-filled.
        assert!(classifier.get_distribution(NodeId(1), NodeId(8)).is_none());
        assert!(classifier.get_distribution(NodeId(2), NodeId(7)).is_none());
    }

    #[test]
    fn candidate_entry_stays_sorted() {
        let mut entry = CandidateEntry::default();
        entry.insert(NodeId(9), params(1.0, 1.0, 0.1));
        entry.insert(NodeId(3), params(2.0, 2.0, 0.2));
        entry.insert(NodeId(6), params(3.0, 3.0, 0.3));
        let anchors: Vec<NodeId> = entry.iter().map(|(a, _)| a).collect();
        assert_eq!(anchors, vec![NodeId(3), NodeId(6), NodeId(9)]);
        assert_relative_eq!(entry.get(NodeId(6)).unwrap().shape, 3.0);
    }

    #[test]
    fn hurdle_density_zero_and_positive_branches() {
        let lengths = array![0.0, 2.0];
        let shapes = array![2.0, 2.0];
        let scales = array![3.0, 3.0];
        let zero_probs = array![0.7, 0.7];
        let (densities, floored) =
            batch_evaluate_density(lengths.view(), shapes.view(), scales.view(), zero_probs.view());
        assert_relative_eq!(densities[0], 0.7, epsilon = 1e-12);
        assert_relative_eq!(
            densities[1],
            0.3 * crate::special::gamma_pdf(2.0, 2.0, 3.0),
            epsilon = 1e-12
        );
        assert_eq!(floored, vec![false, false]);
    }

    #[test]
    fn density_floor_applies_to_pathological_parameters() {
        // zero_prob = 1 kills the positive branch; NaN shape poisons the pdf.
        let lengths = array![5.0, 5.0, 0.0];
        let shapes = array![2.0, f64::NAN, 2.0];
        let scales = array![3.0, 3.0, 3.0];
        let zero_probs = array![1.0, 0.5, 0.0];
        let (densities, floored) =
            batch_evaluate_density(lengths.view(), shapes.view(), scales.view(), zero_probs.view());
        for (i, &d) in densities.iter().enumerate() {
            assert!(d >= DENSITY_FLOOR, "entry {i} below floor: {d}");
            assert!(d.is_finite());
        }
        assert_eq!(floored, vec![true, true, true]);
    }

    #[test]
    #[should_panic(expected = "mismatched input lengths")]
    fn mismatched_batch_inputs_panic() {
        let lengths = array![1.0, 2.0];
        let shapes = array![1.0];
        let scales = array![1.0];
        let zero_probs = array![0.1];
        batch_evaluate_density(lengths.view(), shapes.view(), scales.view(), zero_probs.view());
    }

    #[test]
    fn smoothing_density_uses_cryptic_params() {
        let cryptic = params(2.0, 5.0, 0.9);
        let classifier = LengthClassifier::new(cryptic);
        let out = classifier.batch_smoothing_density(array![0.0, 4.0].view());
        assert_relative_eq!(out[0], 0.9, epsilon = 1e-12);
        assert_relative_eq!(
            out[1],
            0.1 * crate::special::gamma_pdf(4.0, 2.0, 5.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn store_round_trips_through_json() {
        let mut classifier = LengthClassifier::new(DEFAULT_CRYPTIC);
        classifier.add_labeled_node(NodeId(7));
        classifier.insert_distribution(NodeId(1), NodeId(7), params(2.0, 3.0e6, 0.25));
        let blob = serde_json::to_string(&classifier).unwrap();
        let restored: LengthClassifier = serde_json::from_str(&blob).unwrap();
        assert_eq!(restored.labeled_nodes(), &[NodeId(7)]);
        let p = restored.get_distribution(NodeId(1), NodeId(7)).unwrap();
        assert_relative_eq!(p.scale, 3.0e6);
        assert_relative_eq!(restored.cryptic_params().shape, DEFAULT_CRYPTIC.shape);
    }

    #[test]
    fn corpus_dir_training_skips_malformed_lines() {
        use crate::pop::{GenomeId, Node, Sex};
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("7")).unwrap();
        // Candidate 1 has 8 positive observations, candidate 2 only 2.
        for i in 0..8 {
            writeln!(file, "1\t{}", 1.0e6 * (i + 1) as f64).unwrap();
        }
        writeln!(file, "2\t1000000").unwrap();
        writeln!(file, "2\t2000000").unwrap();
        writeln!(file, "garbage line").unwrap();
        writeln!(file, "99\t5.0").unwrap(); // unknown candidate
        drop(file);
        File::create(dir.path().join("notes.txt")).unwrap();

        let nodes: Vec<Node> = [1u32, 2, 7]
            .iter()
            .map(|&id| Node {
                id: NodeId(id),
                sex: Sex::Male,
                generation: 0,
                mother: None,
                father: None,
                suspected_mother: None,
                suspected_father: None,
                children: Vec::new(),
                suspected_children: Vec::new(),
                twin: None,
                genome: Some(GenomeId(id)),
                suspected_genome: None,
            })
            .collect();
        let population = Population::from_nodes(nodes).unwrap();

        let corpus = read_corpus_dir(dir.path()).unwrap();
        assert_eq!(corpus.len(), 1);
        let mut rng = StdRng::seed_from_u64(5);
        let classifier = train_classifier(&corpus, &population, &ClassifierConfig::default(), &mut rng);
        assert_eq!(classifier.labeled_nodes(), &[NodeId(7)]);
        assert!(classifier.contains(NodeId(1), NodeId(7)));
        // Too few samples: omitted, falls back to cryptic.
        assert!(!classifier.contains(NodeId(2), NodeId(7)));
        assert!(!classifier.contains(NodeId(99), NodeId(7)));
    }
}
