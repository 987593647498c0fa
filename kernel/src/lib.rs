//! WL Kernel Matrix - resumable all-pairs graph similarity
//!
//! Builds an N x N Weisfeiler-Lehman kernel matrix over a graph corpus too
//! large to compute in one pass:
//! - Partition the corpus into K contiguous subsets
//! - Compute one pooled kernel block per subset pair, skipping stored blocks
//! - Reassemble the full symmetric matrix from the blocks

pub mod assemble;
pub mod config;
pub mod corpus;
pub mod error;
pub mod graph;
pub mod loader;
pub mod matrix;
pub mod partition;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod wl;

#[cfg(feature = "python")]
mod bindings;

pub use assemble::{locate_entry, Assembler, BlockEntry, SelfBlockSource};
pub use config::MatrixConfig;
pub use corpus::{discover, CorpusManifest};
pub use error::{KernelMatrixError, Result};
pub use graph::GraphRecord;
pub use loader::{load_graphs, DroppedGraph, LoadBatch};
pub use matrix::{GlobalMatrix, SquareMatrix};
pub use partition::{FileIndexMap, Partition};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use scheduler::{pair_tasks, PairTask, RunReport, Scheduler, TaskShard};
pub use store::{BlockHeader, BlockStore, KernelBlock};
pub use wl::{KernelComputer, WeisfeilerLehman};
