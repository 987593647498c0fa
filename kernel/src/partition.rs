//! Contiguous, near-equal partitioning of the corpus.
//!
//! Same split rule as `numpy.array_split`: the first `n % k` subsets carry
//! one extra element. The partition is a pure function of the ordered corpus
//! and `k`, so the scheduler and the assembler can each rebuild it.

use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    files: Vec<PathBuf>,
    bounds: Vec<Range<usize>>,
}

impl Partition {
    /// Split `files` into `k` contiguous subsets. `k` must be non-zero.
    pub fn new(files: Vec<PathBuf>, k: usize) -> Self {
        assert!(k > 0, "subset count must be non-zero");
        let n = files.len();
        let (base, extra) = (n / k, n % k);
        let mut bounds = Vec::with_capacity(k);
        let mut start = 0;
        for i in 0..k {
            let len = base + usize::from(i < extra);
            bounds.push(start..start + len);
            start += len;
        }
        Self { files, bounds }
    }

    /// Number of subsets.
    pub fn k(&self) -> usize {
        self.bounds.len()
    }

    /// Corpus size.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn subset(&self, i: usize) -> &[PathBuf] {
        &self.files[self.bounds[i].clone()]
    }

    pub fn size(&self, i: usize) -> usize {
        self.bounds[i].len()
    }

    pub fn sizes(&self) -> Vec<usize> {
        self.bounds.iter().map(Range::len).collect()
    }

    /// Global index of the first element of subset `i`.
    pub fn offset(&self, i: usize) -> usize {
        self.bounds[i].start
    }

    /// `(subset, local)` for a global corpus index.
    pub fn locate(&self, global: usize) -> Option<(usize, usize)> {
        if global >= self.files.len() {
            return None;
        }
        let s = self.bounds.partition_point(|r| r.end <= global);
        Some((s, global - self.bounds[s].start))
    }
}

/// Corpus identifier to `(subset, local index)`.
#[derive(Debug, Clone, Default)]
pub struct FileIndexMap {
    map: HashMap<PathBuf, (usize, usize)>,
}

impl FileIndexMap {
    pub fn from_partition(partition: &Partition) -> Self {
        let mut map = HashMap::with_capacity(partition.len());
        for s in 0..partition.k() {
            for (local, file) in partition.subset(s).iter().enumerate() {
                map.insert(file.clone(), (s, local));
            }
        }
        Self { map }
    }

    pub fn get(&self, id: &Path) -> Option<(usize, usize)> {
        self.map.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
