//! Error types for the kernel matrix pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::PairTask;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, KernelMatrixError>;

/// Errors raised while loading graphs, computing blocks, or assembling the matrix.
#[derive(Debug, Error)]
pub enum KernelMatrixError {
    /// Filesystem failure with the path that caused it.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be parsed or failed validation.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A graph file is not valid GraphML.
    #[error("Failed to parse graph {path}: {reason}")]
    GraphParse { path: PathBuf, reason: String },

    /// A graph has no nodes or no edges.
    #[error("Degenerate graph {path}: {nodes} nodes, {edges} edges")]
    DegenerateGraph {
        path: PathBuf,
        nodes: usize,
        edges: usize,
    },

    /// JSON manifest or sidecar could not be (de)serialized.
    #[error("Serialization error for {path}: {reason}")]
    Serialization { path: PathBuf, reason: String },

    #[error("Kernel block ({i}, {j}) not found")]
    BlockNotFound { i: usize, j: usize },

    /// Blocks are append-only; a second write for the same key is refused.
    #[error("Kernel block ({i}, {j}) already exists")]
    BlockExists { i: usize, j: usize },

    #[error("Corrupt block file {path}: {reason}")]
    CorruptBlock { path: PathBuf, reason: String },

    /// A block's recorded quadrant sizes disagree with the rebuilt partition.
    #[error(
        "Kernel block ({i}, {j}) has shape ({found_i}, {found_j}), partition expects ({expected_i}, {expected_j})"
    )]
    BlockShape {
        i: usize,
        j: usize,
        expected_i: usize,
        expected_j: usize,
        found_i: usize,
        found_j: usize,
    },

    /// The corpus changed between the block run and the current run.
    #[error("Corpus mismatch: {0}")]
    CorpusMismatch(String),

    /// A subset lost graphs at task time that were present when the corpus was screened.
    #[error("Subset {subset} lost {} graph(s) at load time: {}", .dropped.len(), display_paths(.dropped))]
    SubsetShrank { subset: usize, dropped: Vec<PathBuf> },

    /// A pooled kernel computation failed.
    #[error("Kernel computation failed for task {task}: {reason}")]
    Kernel { task: PairTask, reason: String },

    /// Assembly cannot proceed without these blocks.
    #[error("Missing {} kernel block(s): {}", .missing.len(), display_pairs(.missing))]
    MissingBlocks { missing: Vec<(usize, usize)> },

    #[error("Matrix not symmetric at ({a}, {b}): {ab} vs {ba}")]
    Asymmetric { a: usize, b: usize, ab: f64, ba: f64 },

    #[error("Matrix entry ({a}, {b}) = {value} outside [0, 1]")]
    OutOfRange { a: usize, b: usize, value: f64 },
}

impl KernelMatrixError {
    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptBlock {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn serialization(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Serialization {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_pairs(pairs: &[(usize, usize)]) -> String {
    pairs
        .iter()
        .map(|(i, j)| format!("({i}, {j})"))
        .collect::<Vec<_>>()
        .join(", ")
}
