pub mod graph;
pub mod ibd;

pub use graph::{GenomeId, Node, NodeId, Population, Sex};
pub use ibd::{IbdDetector, PairTable};
