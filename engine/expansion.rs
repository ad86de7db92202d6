//! Snowball expansion state.
//!
//! Accepted identifications become new anchors for later rounds, including
//! the wrong ones: an incorrect accepted identification plants the target's
//! true genome on the identified node as a "suspected genome" override,
//! propagating the attacker's erroneous belief exactly the way a real
//! adversary's database would.
//!
//! The claim bookkeeping enforces one invariant: at most one node claims a
//! given target at a time. When the same target is re-identified as someone
//! else in a later round, the earlier claimant is retracted and its genome
//! override reverted.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::evaluation::IdentifyResult;
use crate::pop::{NodeId, Population};

/// Person-independent snapshot of an identification, safe to checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatIdentifyResult {
    pub target: NodeId,
    pub sibling_group: Vec<NodeId>,
    pub identified: NodeId,
    pub ln_ratio: f64,
    pub correct: bool,
    pub round: u32,
}

impl FlatIdentifyResult {
    /// Flattens an accepted identification. Only results with an actual top
    /// candidate can be accepted, hence the panic on `None`.
    pub fn from_result(result: &IdentifyResult) -> Self {
        let identified = result
            .identified
            .expect("cannot flatten a no-opinion identification");
        let mut sibling_group: Vec<NodeId> = result.sibling_group.iter().copied().collect();
        sibling_group.sort_unstable();
        FlatIdentifyResult {
            target: result.target,
            sibling_group,
            identified,
            ln_ratio: result.ln_ratio,
            correct: result.correct,
            round: result.round,
        }
    }
}

/// Cross-round expansion state. The claim maps are rebuilt from `added` on
/// load ([`ExpansionData::rehydrate`]) rather than persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionData {
    start_anchors: Vec<NodeId>,
    added: Vec<FlatIdentifyResult>,
    rounds: u32,
    original_pool: Option<Vec<NodeId>>,
    remaining: Option<Vec<NodeId>>,
    #[serde(skip)]
    target_claims: AHashMap<NodeId, NodeId>,
    #[serde(skip)]
    identified_claims: AHashMap<NodeId, NodeId>,
}

impl ExpansionData {
    pub fn new(start_anchors: Vec<NodeId>) -> Self {
        ExpansionData {
            start_anchors,
            added: Vec::new(),
            rounds: 0,
            original_pool: None,
            remaining: None,
            target_claims: AHashMap::new(),
            identified_claims: AHashMap::new(),
        }
    }

    pub fn start_anchors(&self) -> &[NodeId] {
        &self.start_anchors
    }

    pub fn added(&self) -> &[FlatIdentifyResult] {
        &self.added
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn add_round(&mut self) {
        self.rounds += 1;
    }

    pub fn original_pool(&self) -> Option<&[NodeId]> {
        self.original_pool.as_deref()
    }

    pub fn set_original_pool(&mut self, pool: Vec<NodeId>) {
        self.original_pool = Some(pool);
    }

    pub fn remaining(&self) -> Option<&[NodeId]> {
        self.remaining.as_deref()
    }

    pub fn set_remaining(&mut self, remaining: Option<Vec<NodeId>>) {
        self.remaining = remaining;
    }

    /// Take the unprocessed pool left by an interrupted round, if any.
    pub fn take_remaining(&mut self) -> Option<Vec<NodeId>> {
        self.remaining.take()
    }

    pub fn identified_before(&self, target: NodeId) -> bool {
        self.target_claims.contains_key(&target)
    }

    /// Whether `node` currently claims some target.
    pub fn is_claimant(&self, node: NodeId) -> bool {
        self.identified_claims.contains_key(&node)
    }

    pub fn is_start_anchor(&self, node: NodeId) -> bool {
        self.start_anchors.contains(&node)
    }

    /// The full anchor set this state implies: the starting anchors plus
    /// every accepted identification.
    pub fn labeled_nodes(&self) -> Vec<NodeId> {
        let mut labeled = self.start_anchors.clone();
        labeled.extend(self.added.iter().map(|result| result.identified));
        labeled
    }

    /// Installs a claim and its genome-override side effect, retracting
    /// whatever it displaces. Returns the node that previously claimed this
    /// target, if any.
    fn add_identification(
        &mut self,
        correct: bool,
        identified: NodeId,
        target: NodeId,
        population: &mut Population,
    ) -> Option<NodeId> {
        // The identified node may be abandoning a previous target.
        if let Some(old_target) = self.identified_claims.get(&identified).copied() {
            self.target_claims.remove(&old_target);
        }
        // The target may have been claimed by someone else; revert that
        // claimant's override before installing the new claim.
        let old_identified = self.target_claims.get(&target).copied();
        if let Some(previous) = old_identified {
            population.set_suspected_genome(previous, None);
            self.identified_claims.remove(&previous);
        }

        let override_genome = if correct {
            None
        } else {
            population.node(target).genome
        };
        population.set_suspected_genome(identified, override_genome);

        self.target_claims.insert(target, identified);
        self.identified_claims.insert(identified, target);
        old_identified.filter(|&previous| previous != identified)
    }

    /// Records an accepted identification. If the target had been claimed
    /// before, returns the node it was previously identified as.
    pub fn add_node(
        &mut self,
        result: &IdentifyResult,
        population: &mut Population,
    ) -> Option<NodeId> {
        let flat = FlatIdentifyResult::from_result(result);
        let previous =
            self.add_identification(flat.correct, flat.identified, flat.target, population);
        self.added.push(flat);
        previous
    }

    /// Keeps only the latest claim per target, preserving order of the
    /// survivors.
    fn deduplicate(&mut self) {
        let mut seen = ahash::AHashSet::new();
        let mut kept: Vec<FlatIdentifyResult> = self
            .added
            .iter()
            .rev()
            .filter(|result| seen.insert(result.target))
            .cloned()
            .collect();
        kept.reverse();
        self.added = kept;
    }

    /// Rebuilds the claim maps and replays the genome overrides onto the
    /// population after loading a checkpoint.
    pub fn rehydrate(&mut self, population: &mut Population) {
        self.deduplicate();
        self.target_claims.clear();
        self.identified_claims.clear();
        let added = std::mem::take(&mut self.added);
        for result in &added {
            self.add_identification(result.correct, result.identified, result.target, population);
        }
        self.added = added;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pop::{GenomeId, Node, Sex};
    use ahash::AHashSet;

    fn population(ids: &[u32]) -> Population {
        let nodes = ids
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
        Population::from_nodes(nodes).unwrap()
    }

    fn result(target: u32, identified: u32, correct: bool, round: u32) -> IdentifyResult {
        IdentifyResult {
            target: NodeId(target),
            sibling_group: AHashSet::from_iter([NodeId(identified)]),
            identified: Some(NodeId(identified)),
            ln_ratio: 12.0,
            correct,
            round,
        }
    }

    #[test]
    fn incorrect_claim_overrides_suspected_genome() {
        let mut population = population(&[1, 2, 3]);
        let mut expansion = ExpansionData::new(vec![]);
        expansion.add_node(&result(1, 2, false, 0), &mut population);
        assert_eq!(
            population.node(NodeId(2)).suspected_genome,
            Some(GenomeId(1))
        );
        assert!(expansion.identified_before(NodeId(1)));
        assert!(expansion.is_claimant(NodeId(2)));
    }

    #[test]
    fn correct_claim_clears_override() {
        let mut population = population(&[1, 2]);
        population.set_suspected_genome(NodeId(1), Some(GenomeId(2)));
        let mut expansion = ExpansionData::new(vec![]);
        expansion.add_node(&result(1, 1, true, 0), &mut population);
        assert_eq!(population.node(NodeId(1)).suspected_genome, None);
    }

    #[test]
    fn reclaiming_a_target_retracts_the_old_claimant() {
        let mut population = population(&[1, 2, 3]);
        let mut expansion = ExpansionData::new(vec![]);
        // Round 1: target 1 wrongly identified as 2.
        assert_eq!(expansion.add_node(&result(1, 2, false, 1), &mut population), None);
        // Round 3: target 1 re-identified as 3.
        let previous = expansion.add_node(&result(1, 3, false, 3), &mut population);
        assert_eq!(previous, Some(NodeId(2)));
        // 2's override is reverted, 3 carries the new one.
        assert_eq!(population.node(NodeId(2)).suspected_genome, None);
        assert_eq!(
            population.node(NodeId(3)).suspected_genome,
            Some(GenomeId(1))
        );
        assert!(!expansion.is_claimant(NodeId(2)));
        assert!(expansion.is_claimant(NodeId(3)));
    }

    #[test]
    fn rehydrate_replays_latest_claims_only() {
        let mut population = population(&[1, 2, 3]);
        let mut expansion = ExpansionData::new(vec![NodeId(9)]);
        expansion.add_node(&result(1, 2, false, 1), &mut population);
        expansion.add_node(&result(1, 3, false, 2), &mut population);

        // Simulate a checkpoint cycle: claims are not persisted.
        let blob = serde_json::to_string(&expansion).unwrap();
        let mut restored: ExpansionData = serde_json::from_str(&blob).unwrap();
        let mut fresh = population.clone();
        fresh.set_suspected_genome(NodeId(2), None);
        fresh.set_suspected_genome(NodeId(3), None);
        restored.rehydrate(&mut fresh);

        assert_eq!(restored.added().len(), 1);
        assert_eq!(restored.added()[0].identified, NodeId(3));
        assert_eq!(fresh.node(NodeId(3)).suspected_genome, Some(GenomeId(1)));
        assert_eq!(fresh.node(NodeId(2)).suspected_genome, None);
        assert_eq!(
            restored.labeled_nodes(),
            vec![NodeId(9), NodeId(3)]
        );
    }
}
