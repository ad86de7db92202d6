//! The population boundary.
//!
//! The genealogy itself is produced elsewhere (by a population simulator or
//! an import from one); the engine only needs the narrow surface modeled
//! here: enumerate members, resolve ids, read sexes and parentage, walk
//! bounded-generation relatedness, and read or override the "suspected
//! genome" side channel that models attacker error.
//!
//! Every node carries two parallel sets of links: the *true* biological
//! mother/father/children, and the *suspected* links an attacker believes
//! in. The two can disagree (non-paternity, import error), and the engine
//! deliberately uses one or the other depending on context.

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

/// Identifier of an individual in the genealogy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to a diploid genome. Only an [`crate::pop::IbdDetector`]
/// interprets these; the engine just passes them around, which is what lets
/// the suspected-genome override work by swapping handles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GenomeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

/// One individual. `children` and `suspected_children` are derived from the
/// parent links at construction time and kept consistent by the population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub sex: Sex,
    /// Generation index, founders first.
    pub generation: usize,
    pub mother: Option<NodeId>,
    pub father: Option<NodeId>,
    pub suspected_mother: Option<NodeId>,
    pub suspected_father: Option<NodeId>,
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub suspected_children: Vec<NodeId>,
    #[serde(default)]
    pub twin: Option<NodeId>,
    /// The individual's true genome, if one was simulated for them.
    pub genome: Option<GenomeId>,
    /// Attacker-error side channel: when set, everyone treating this node as
    /// a known quantity reads this genome instead of the true one. Owned by
    /// the graph, written by the expansion driver.
    #[serde(default)]
    pub suspected_genome: Option<GenomeId>,
}

impl Node {
    /// The genome the attacker believes belongs to this node.
    pub fn observed_genome(&self) -> Option<GenomeId> {
        self.suspected_genome.or(self.genome)
    }
}

#[derive(Debug, Error)]
pub enum PopulationError {
    #[error("I/O error reading population: {0}")]
    Io(#[from] std::io::Error),
    #[error("population JSON is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate node id {0}")]
    DuplicateId(NodeId),
    #[error("node {child} references unknown parent {parent}")]
    UnknownParent { child: NodeId, parent: NodeId },
}

/// A forest of individuals with true and suspected parentage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<Node>", into = "Vec<Node>")]
pub struct Population {
    nodes: Vec<Node>,
    index: AHashMap<NodeId, usize>,
}

impl TryFrom<Vec<Node>> for Population {
    type Error = PopulationError;
    fn try_from(nodes: Vec<Node>) -> Result<Self, PopulationError> {
        Population::from_nodes(nodes)
    }
}

impl From<Population> for Vec<Node> {
    fn from(population: Population) -> Vec<Node> {
        population.nodes
    }
}

impl Population {
    /// Builds a population from node records, deriving the child lists from
    /// the parent links. Suspected child lists come from suspected parent
    /// links, so the two trees can disagree.
    pub fn from_nodes(mut nodes: Vec<Node>) -> Result<Self, PopulationError> {
        let mut index = AHashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id, i).is_some() {
                return Err(PopulationError::DuplicateId(node.id));
            }
        }
        for node in &nodes {
            for parent in [
                node.mother,
                node.father,
                node.suspected_mother,
                node.suspected_father,
            ]
            .into_iter()
            .flatten()
            {
                if !index.contains_key(&parent) {
                    return Err(PopulationError::UnknownParent {
                        child: node.id,
                        parent,
                    });
                }
            }
        }

        let mut children: AHashMap<NodeId, Vec<NodeId>> = AHashMap::new();
        let mut suspected_children: AHashMap<NodeId, Vec<NodeId>> = AHashMap::new();
        for node in &nodes {
            for parent in [node.mother, node.father].into_iter().flatten() {
                children.entry(parent).or_default().push(node.id);
            }
            for parent in [node.suspected_mother, node.suspected_father]
                .into_iter()
                .flatten()
            {
                suspected_children.entry(parent).or_default().push(node.id);
            }
        }
        for node in &mut nodes {
            node.children = children.remove(&node.id).unwrap_or_default();
            node.suspected_children = suspected_children.remove(&node.id).unwrap_or_default();
        }
        Ok(Population { nodes, index })
    }

    pub fn load_json(path: &Path) -> Result<Self, PopulationError> {
        let reader = BufReader::new(File::open(path)?);
        let nodes: Vec<Node> = serde_json::from_reader(reader)?;
        Population::from_nodes(nodes)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Resolves an id. A missing id is a caller-contract violation, not a
    /// data condition, so this panics rather than returning an option.
    pub fn node(&self, id: NodeId) -> &Node {
        let i = *self
            .index
            .get(&id)
            .unwrap_or_else(|| panic!("no node with id {id} in population"));
        &self.nodes[i]
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index.contains_key(&id)
    }

    /// Installs or clears the suspected-genome override on a node.
    pub fn set_suspected_genome(&mut self, id: NodeId, genome: Option<GenomeId>) {
        let i = *self
            .index
            .get(&id)
            .unwrap_or_else(|| panic!("no node with id {id} in population"));
        self.nodes[i].suspected_genome = genome;
    }

    /// The node together with all its full biological siblings: the
    /// intersection of its mother's and father's children. A node missing
    /// either true parent is its own sibling group.
    pub fn sibling_group(&self, id: NodeId) -> AHashSet<NodeId> {
        let node = self.node(id);
        let (Some(mother), Some(father)) = (node.mother, node.father) else {
            return AHashSet::from_iter([id]);
        };
        let maternal: AHashSet<NodeId> = self.node(mother).children.iter().copied().collect();
        self.node(father)
            .children
            .iter()
            .copied()
            .filter(|c| maternal.contains(c))
            .collect()
    }

    /// Same grouping through the suspected links; this is what the attacker
    /// can actually compute.
    pub fn suspected_sibling_group(&self, id: NodeId) -> AHashSet<NodeId> {
        let node = self.node(id);
        let (Some(mother), Some(father)) = (node.suspected_mother, node.suspected_father) else {
            return AHashSet::from_iter([id]);
        };
        let maternal: AHashSet<NodeId> = self
            .node(mother)
            .suspected_children
            .iter()
            .copied()
            .collect();
        self.node(father)
            .suspected_children
            .iter()
            .copied()
            .filter(|c| maternal.contains(c))
            .collect()
    }

    /// Ancestors reached within `generations_back` steps that have no known
    /// parents of their own inside that horizon.
    fn ancestor_roots(
        &self,
        id: NodeId,
        suspected: bool,
        generations_back: usize,
    ) -> AHashSet<NodeId> {
        let parents = |n: &Node| {
            if suspected {
                (n.suspected_mother, n.suspected_father)
            } else {
                (n.mother, n.father)
            }
        };
        let mut roots = AHashSet::new();
        let mut current: AHashSet<NodeId> = AHashSet::from_iter([id]);
        let mut depth = 0;
        while depth < generations_back && !current.is_empty() {
            let mut next = AHashSet::new();
            for &node_id in &current {
                let (mother, father) = parents(self.node(node_id));
                if mother.is_none() && father.is_none() {
                    roots.insert(node_id);
                }
                next.extend(mother);
                next.extend(father);
            }
            current = next;
            depth += 1;
        }
        roots.extend(current);
        roots
    }

    fn descendants_of(&self, id: NodeId, suspected: bool) -> AHashSet<NodeId> {
        let mut descendants = AHashSet::new();
        let mut to_visit = vec![id];
        while let Some(current) = to_visit.pop() {
            if !descendants.insert(current) {
                continue;
            }
            let node = self.node(current);
            let children = if suspected {
                &node.suspected_children
            } else {
                &node.children
            };
            to_visit.extend(children.iter().copied());
        }
        descendants
    }

    /// Every node related to `id` within the genealogical horizon: walk up
    /// at most `generations_back` generations to the ancestor roots, then
    /// take everything descended from them. This is the neighborhood the
    /// engine prunes its candidate universe to in related-only mode.
    pub fn all_related(
        &self,
        id: NodeId,
        suspected: bool,
        generations_back: usize,
    ) -> AHashSet<NodeId> {
        let roots = self.ancestor_roots(id, suspected, generations_back);
        let mut related = AHashSet::new();
        for root in roots {
            related.extend(self.descendants_of(root, suspected));
        }
        related
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u32, sex: Sex, generation: usize) -> Node {
        Node {
            id: NodeId(id),
            sex,
            generation,
            mother: None,
            father: None,
            suspected_mother: None,
            suspected_father: None,
            children: Vec::new(),
            suspected_children: Vec::new(),
            twin: None,
            genome: Some(GenomeId(id)),
            suspected_genome: None,
        }
    }

    fn child(id: u32, sex: Sex, mother: u32, father: u32) -> Node {
        let mut n = node(id, sex, 1);
        n.mother = Some(NodeId(mother));
        n.father = Some(NodeId(father));
        n.suspected_mother = Some(NodeId(mother));
        n.suspected_father = Some(NodeId(father));
        n
    }

    /// Two founder couples; 10 and 11 are full siblings, 12 is a half
    /// sibling through the father.
    fn family() -> Population {
        let mut nodes = vec![
            node(0, Sex::Female, 0),
            node(1, Sex::Male, 0),
            node(2, Sex::Female, 0),
            child(10, Sex::Male, 0, 1),
            child(11, Sex::Female, 0, 1),
        ];
        let mut half = node(12, Sex::Male, 1);
        half.mother = Some(NodeId(2));
        half.father = Some(NodeId(1));
        half.suspected_mother = Some(NodeId(2));
        half.suspected_father = Some(NodeId(1));
        nodes.push(half);
        Population::from_nodes(nodes).unwrap()
    }

    #[test]
    fn sibling_group_excludes_half_siblings() {
        let population = family();
        let group = population.sibling_group(NodeId(10));
        assert_eq!(group, AHashSet::from_iter([NodeId(10), NodeId(11)]));
    }

    #[test]
    fn parentless_node_is_its_own_sibling_group() {
        let population = family();
        assert_eq!(
            population.sibling_group(NodeId(0)),
            AHashSet::from_iter([NodeId(0)])
        );
    }

    #[test]
    fn suspected_group_follows_suspected_links() {
        // Move 11's suspected mother to founder 2: she is no longer a
        // suspected full sibling of 10, though she remains a true one.
        let mut nodes: Vec<Node> = Vec::from(family());
        for n in &mut nodes {
            if n.id == NodeId(11) {
                n.suspected_mother = Some(NodeId(2));
            }
        }
        let population = Population::from_nodes(nodes).unwrap();
        assert_eq!(
            population.suspected_sibling_group(NodeId(10)),
            AHashSet::from_iter([NodeId(10)])
        );
        assert!(population.sibling_group(NodeId(10)).contains(&NodeId(11)));
    }

    #[test]
    fn all_related_covers_the_family() {
        let population = family();
        let related = population.all_related(NodeId(10), false, 3);
        // Through father 1 the half sibling 12 is reachable.
        for id in [0, 1, 10, 11, 12] {
            assert!(related.contains(&NodeId(id)), "missing {id}");
        }
        // Founder 2 is only a parent of 12, not an ancestor root of 10.
        assert!(!related.contains(&NodeId(2)));
    }

    #[test]
    fn bounded_horizon_limits_relatedness() {
        let population = family();
        // Zero generations back: the node's own roots are just itself.
        let related = population.all_related(NodeId(10), false, 0);
        assert_eq!(related, AHashSet::from_iter([NodeId(10)]));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let nodes = vec![node(1, Sex::Male, 0), node(1, Sex::Female, 0)];
        assert!(matches!(
            Population::from_nodes(nodes),
            Err(PopulationError::DuplicateId(NodeId(1)))
        ));
    }

    #[test]
    fn observed_genome_prefers_override() {
        let mut population = family();
        assert_eq!(
            population.node(NodeId(10)).observed_genome(),
            Some(GenomeId(10))
        );
        population.set_suspected_genome(NodeId(10), Some(GenomeId(11)));
        assert_eq!(
            population.node(NodeId(10)).observed_genome(),
            Some(GenomeId(11))
        );
        population.set_suspected_genome(NodeId(10), None);
        assert_eq!(
            population.node(NodeId(10)).observed_genome(),
            Some(GenomeId(10))
        );
    }
}
