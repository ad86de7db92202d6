//! IBD detection boundary.
//!
//! The genome and recombination machinery lives outside this crate; all the
//! engine consumes is one capability: given two genome handles, the total
//! length of shared material above the configured cutoffs. The trait must be
//! deterministic for identical inputs or identification results stop being
//! reproducible.

use ahash::AHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

use crate::pop::graph::GenomeId;

pub trait IbdDetector {
    /// Total IBD length shared between `a` and `b`, zero meaning "no
    /// detectable shared material". Symmetric in its arguments.
    fn shared_segment_length(&self, a: GenomeId, b: GenomeId) -> f64;
}

#[derive(Debug, Error)]
pub enum PairTableError {
    #[error("I/O error reading IBD table: {0}")]
    Io(#[from] std::io::Error),
}

/// Detector backed by a precomputed symmetric pair table, as produced by an
/// external segment-detection run. Pairs absent from the table share
/// nothing.
#[derive(Debug, Default, Clone)]
pub struct PairTable {
    lengths: AHashMap<(GenomeId, GenomeId), f64>,
}

fn ordered(a: GenomeId, b: GenomeId) -> (GenomeId, GenomeId) {
    if a <= b { (a, b) } else { (b, a) }
}

impl PairTable {
    pub fn new() -> Self {
        PairTable::default()
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (GenomeId, GenomeId, f64)>,
    {
        let mut table = PairTable::new();
        for (a, b, length) in pairs {
            table.insert(a, b, length);
        }
        table
    }

    /// Loads a tab-separated `genome_a genome_b length` table, dropping
    /// entries below `minimum_length`. Malformed lines are skipped with a
    /// warning; an interrupted detector run can leave a trailing partial
    /// line.
    pub fn load_tsv(path: &Path, minimum_length: f64) -> Result<Self, PairTableError> {
        let reader = BufReader::new(File::open(path)?);
        let mut table = PairTable::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let parsed = (|| {
                let a = fields.next()?.parse::<u32>().ok()?;
                let b = fields.next()?.parse::<u32>().ok()?;
                let length = fields.next()?.parse::<f64>().ok()?;
                Some((GenomeId(a), GenomeId(b), length))
            })();
            match parsed {
                Some((a, b, length)) if length >= minimum_length => {
                    table.insert(a, b, length);
                }
                Some(_) => {}
                None => log::warn!("skipping malformed IBD table line: {line:?}"),
            }
        }
        Ok(table)
    }

    pub fn insert(&mut self, a: GenomeId, b: GenomeId, length: f64) {
        self.lengths.insert(ordered(a, b), length);
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }
}

impl IbdDetector for PairTable {
    fn shared_segment_length(&self, a: GenomeId, b: GenomeId) -> f64 {
        self.lengths.get(&ordered(a, b)).copied().unwrap_or(0.0)
    }
}
