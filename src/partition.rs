//! Identifier-Space Partitioning
//!
//! Deterministic, stateless sharding of the identifier space so several
//! harvesters can each claim a disjoint, stable slice without coordination.
//! An identifier hashes (sha1) into one of 1024 fixed buckets; a partition
//! spec such as `"1,3/4"` selects labels 1 and 3 out of 4, each label
//! covering a contiguous range of `ceil(1024/4)` buckets. Adjacent selected
//! labels coalesce into merged ranges so membership tests stay cheap.

use sha1::{Digest, Sha1};

/// Fixed number of hash buckets; shards of one total always tile these exactly.
pub const NR_OF_BUCKETS: u32 = 1024;

const MIN_TOTAL: u8 = 2;
const MAX_TOTAL: u8 = 10;

/// Invalid partition specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPartition(pub String);

impl std::fmt::Display for InvalidPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid partition: {}", self.0)
    }
}

impl std::error::Error for InvalidPartition {}

/// A selection of shard labels out of a fixed total, e.g. `1,3/4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    /// Selected labels, sorted and deduplicated, each in `1..=total`
    parts: Vec<u8>,
    total: u8,
}

impl Partition {
    pub fn new(mut parts: Vec<u8>, total: u8) -> Result<Self, InvalidPartition> {
        if total < MIN_TOTAL {
            return Err(InvalidPartition(format!(
                "expected at least {} partitions, got {}",
                MIN_TOTAL, total
            )));
        }
        if total > MAX_TOTAL {
            return Err(InvalidPartition(format!(
                "expected at most {} partitions, got {}",
                MAX_TOTAL, total
            )));
        }
        if parts.is_empty() {
            return Err(InvalidPartition("no parts selected".to_string()));
        }
        if parts.iter().any(|&p| p < 1 || p > total) {
            return Err(InvalidPartition(format!(
                "parts must be between 1 and {}",
                total
            )));
        }
        parts.sort_unstable();
        parts.dedup();
        Ok(Partition { parts, total })
    }

    pub fn parts(&self) -> &[u8] {
        &self.parts
    }

    pub fn total(&self) -> u8 {
        self.total
    }

    /// Bucket an identifier: low 10 bits of the big-endian sha1 digest.
    pub fn hash_bucket(identifier: &str) -> u32 {
        let digest = Sha1::digest(identifier.as_bytes());
        u32::from(u16::from_be_bytes([digest[18], digest[19]])) % NR_OF_BUCKETS
    }

    /// Half-open bucket ranges covered by the selected labels, with
    /// adjacent labels merged.
    pub fn ranges(&self) -> Vec<(u32, u32)> {
        let part_size = (NR_OF_BUCKETS + u32::from(self.total) - 1) / u32::from(self.total);
        let mut merged: Vec<(u32, u32)> = Vec::new();
        for &part in &self.parts {
            let start = u32::from(part - 1) * part_size;
            let end = u32::from(part) * part_size;
            match merged.last_mut() {
                Some(last) if last.1 == start => last.1 = end,
                _ => merged.push((start, end)),
            }
        }
        merged
    }

    /// Whether the identifier falls in this partition's slice.
    pub fn matches(&self, identifier: &str) -> bool {
        let bucket = Self::hash_bucket(identifier);
        self.ranges()
            .iter()
            .any(|&(start, end)| bucket >= start && bucket < end)
    }
}

impl std::str::FromStr for Partition {
    type Err = InvalidPartition;

    /// Parse the wire form `"p1,p2,.../N"`, e.g. `"1,3/4"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (parts_str, total_str) = s
            .split_once('/')
            .ok_or_else(|| InvalidPartition(format!("missing '/' in {:?}", s)))?;
        let total: u8 = total_str
            .parse()
            .map_err(|_| InvalidPartition(format!("bad total in {:?}", s)))?;
        let parts = parts_str
            .split(',')
            .map(|p| {
                p.parse::<u8>()
                    .map_err(|_| InvalidPartition(format!("bad part {:?} in {:?}", p, s)))
            })
            .collect::<Result<Vec<u8>, InvalidPartition>>()?;
        Partition::new(parts, total)
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts = self
            .parts
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<String>>()
            .join(",");
        write!(f, "{}/{}", parts, self.total)
    }
}
