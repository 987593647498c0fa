//! Reassembly of the corpus-wide matrix from stored blocks.
//!
//! Cross-subset entries come from block `(min, max)`. Self-similarity for
//! subset `s` is read from a block that already contains `s`:
//!
//! - `s < K-1`: top-left quadrant of `(s, s+1)`.
//! - `s = K-1`: bottom-right quadrant of `(0, K-1)`, offset by `|S0|`.
//! - `K = 1`: the whole of `(0, 0)`.
//!
//! Every block is checked against the rebuilt partition before any value is
//! read, and nothing is written unless the full matrix passes validation.

use std::path::Path;
use std::time::Instant;

use tracing::{debug, info};

use crate::error::{KernelMatrixError, Result};
use crate::matrix::{GlobalMatrix, SquareMatrix};
use crate::partition::{FileIndexMap, Partition};
use crate::scheduler::pair_tasks;
use crate::store::{BlockStore, KernelBlock};

/// Tolerance for the symmetry check.
pub const SYMMETRY_TOLERANCE: f64 = 1e-8;

/// Block and offset holding a subset's self-similarity quadrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfBlockSource {
    /// Top-left quadrant of `(s, s + 1)`.
    Leading { s: usize },
    /// Bottom-right quadrant of `(0, s)` for the last subset.
    Wraparound { s: usize, offset: usize },
    /// The single-subset block `(0, 0)`.
    Diagonal,
}

impl SelfBlockSource {
    pub fn for_subset(partition: &Partition, s: usize) -> Self {
        let k = partition.k();
        if k == 1 {
            Self::Diagonal
        } else if s + 1 < k {
            Self::Leading { s }
        } else {
            Self::Wraparound {
                s,
                offset: partition.size(0),
            }
        }
    }

    pub fn pair(&self) -> (usize, usize) {
        match *self {
            Self::Leading { s } => (s, s + 1),
            Self::Wraparound { s, .. } => (0, s),
            Self::Diagonal => (0, 0),
        }
    }

    pub fn offset(&self) -> usize {
        match *self {
            Self::Wraparound { offset, .. } => offset,
            _ => 0,
        }
    }
}

/// Position of one global entry inside a stored block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub pair: (usize, usize),
    pub row: usize,
    pub col: usize,
}

/// Resolve `(subset, local)` coordinates of two graphs to a block entry.
pub fn locate_entry(partition: &Partition, a: (usize, usize), b: (usize, usize)) -> BlockEntry {
    let ((sa, la), (sb, lb)) = (a, b);
    if sa == sb {
        let source = SelfBlockSource::for_subset(partition, sa);
        let offset = source.offset();
        BlockEntry {
            pair: source.pair(),
            row: offset + la,
            col: offset + lb,
        }
    } else if sa < sb {
        BlockEntry {
            pair: (sa, sb),
            row: la,
            col: partition.size(sa) + lb,
        }
    } else {
        BlockEntry {
            pair: (sb, sa),
            row: lb,
            col: partition.size(sb) + la,
        }
    }
}

pub struct Assembler<'a> {
    partition: &'a Partition,
    store: &'a BlockStore,
    fingerprint: [u8; 32],
}

impl<'a> Assembler<'a> {
    pub fn new(partition: &'a Partition, store: &'a BlockStore, fingerprint: [u8; 32]) -> Self {
        Self {
            partition,
            store,
            fingerprint,
        }
    }

    /// Blocks the assembly reads, canonical order.
    pub fn required_blocks(&self) -> Vec<(usize, usize)> {
        pair_tasks(self.partition.k())
            .into_iter()
            .map(|t| (t.i, t.j))
            .collect()
    }

    /// Build and validate the matrix without writing it.
    pub fn assemble(&self) -> Result<GlobalMatrix> {
        let start = Instant::now();
        let n = self.partition.len();
        let locations = self.locations()?;

        let required = self.required_blocks();
        let missing: Vec<(usize, usize)> = required
            .iter()
            .copied()
            .filter(|&(i, j)| !self.store.exists(i, j))
            .collect();
        if !missing.is_empty() {
            return Err(KernelMatrixError::MissingBlocks { missing });
        }
        for &(i, j) in &required {
            self.check_header(i, j)?;
        }
        info!(graphs = n, blocks = required.len(), "Assembling kernel matrix");

        let mut matrix = SquareMatrix::zeros(n);
        for &pair in &required {
            let block = self.store.get(pair.0, pair.1)?;
            self.fill_from(&block, &locations, &mut matrix);
            debug!(i = pair.0, j = pair.1, "Merged kernel block");
        }

        matrix.fill_diagonal(1.0);
        validate(&matrix)?;
        info!(
            graphs = n,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Assembled kernel matrix"
        );
        Ok(GlobalMatrix {
            files: self.partition.files().to_vec(),
            matrix,
        })
    }

    /// Assemble, then write the artifact. A failed assembly writes nothing.
    pub fn assemble_to(&self, path: &Path) -> Result<GlobalMatrix> {
        let global = self.assemble()?;
        global.write_to(path)?;
        info!(path = %path.display(), "Saved complete kernel matrix");
        Ok(global)
    }

    /// `(subset, local)` of every global index, via the file index map.
    fn locations(&self) -> Result<Vec<(usize, usize)>> {
        let map = FileIndexMap::from_partition(self.partition);
        let files = self.partition.files();
        if map.len() != files.len() {
            return Err(KernelMatrixError::CorpusMismatch(format!(
                "{} identifiers but {} distinct entries",
                files.len(),
                map.len()
            )));
        }
        files
            .iter()
            .enumerate()
            .map(|(global, file)| {
                let unresolved = |detail: String| {
                    KernelMatrixError::CorpusMismatch(format!(
                        "cannot resolve index {global} ({}): {detail}",
                        file.display()
                    ))
                };
                let (s, local) = map
                    .get(file)
                    .ok_or_else(|| unresolved("not in index map".to_string()))?;
                if local >= self.partition.size(s) || self.partition.offset(s) + local != global {
                    return Err(unresolved(format!("maps to subset {s} local {local}")));
                }
                Ok((s, local))
            })
            .collect()
    }

    fn check_header(&self, i: usize, j: usize) -> Result<()> {
        let header = self.store.get_header(i, j)?;
        let expected_j = if i == j { 0 } else { self.partition.size(j) };
        if (header.rows_i, header.rows_j) != (self.partition.size(i), expected_j) {
            return Err(KernelMatrixError::BlockShape {
                i,
                j,
                expected_i: self.partition.size(i),
                expected_j,
                found_i: header.rows_i,
                found_j: header.rows_j,
            });
        }
        if header.fingerprint != self.fingerprint {
            return Err(KernelMatrixError::CorpusMismatch(format!(
                "block ({i}, {j}) was computed against corpus {}, current corpus is {}",
                hex::encode(header.fingerprint),
                hex::encode(self.fingerprint)
            )));
        }
        Ok(())
    }

    /// Copy every global entry this block is the source of.
    fn fill_from(&self, block: &KernelBlock, locations: &[(usize, usize)], matrix: &mut SquareMatrix) {
        let pair = (block.header.i, block.header.j);
        let mut copy = |a: usize, b: usize| {
            let entry = locate_entry(self.partition, locations[a], locations[b]);
            debug_assert_eq!(entry.pair, pair);
            matrix.set_symmetric(a, b, block.matrix.get(entry.row, entry.col));
        };

        if pair.0 != pair.1 {
            for a in self.members(pair.0) {
                for b in self.members(pair.1) {
                    copy(a, b);
                }
            }
        }
        for s in 0..self.partition.k() {
            if SelfBlockSource::for_subset(self.partition, s).pair() != pair {
                continue;
            }
            let members: Vec<usize> = self.members(s).collect();
            for (x, &a) in members.iter().enumerate() {
                for &b in &members[x + 1..] {
                    copy(a, b);
                }
            }
        }
    }

    fn members(&self, s: usize) -> std::ops::Range<usize> {
        let start = self.partition.offset(s);
        start..start + self.partition.size(s)
    }
}

fn validate(matrix: &SquareMatrix) -> Result<()> {
    if let Some((a, b)) = matrix.asymmetry(SYMMETRY_TOLERANCE) {
        return Err(KernelMatrixError::Asymmetric {
            a,
            b,
            ab: matrix.get(a, b),
            ba: matrix.get(b, a),
        });
    }
    for a in 0..matrix.dim() {
        for (b, &value) in matrix.row(a).iter().enumerate() {
            if a != b && !(0.0..=1.0).contains(&value) {
                return Err(KernelMatrixError::OutOfRange { a, b, value });
            }
        }
    }
    Ok(())
}
