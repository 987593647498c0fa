//! Parallel graph loading.
//!
//! Fan-out over rayon, fan-in in submission order. A file that fails to
//! parse, or parses to a graph with no nodes or no edges, yields an empty
//! slot and a [`DroppedGraph`] entry instead of failing the batch.

use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{KernelMatrixError, Result};
use crate::graph::{read_graphml, GraphRecord};

/// An identifier that produced no record, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedGraph {
    pub id: PathBuf,
    pub reason: String,
}

/// Output of one batch: one slot per input, in input order.
#[derive(Debug, Default)]
pub struct LoadBatch {
    pub slots: Vec<Option<GraphRecord>>,
    pub dropped: Vec<DroppedGraph>,
}

impl LoadBatch {
    pub fn loaded(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Every slot filled, or `SubsetShrank` naming the missing files.
    pub fn into_complete(self, subset: usize) -> Result<Vec<GraphRecord>> {
        if !self.dropped.is_empty() {
            return Err(KernelMatrixError::SubsetShrank {
                subset,
                dropped: self.dropped.into_iter().map(|d| d.id).collect(),
            });
        }
        Ok(self.slots.into_iter().flatten().collect())
    }
}

/// Load one graph, rejecting degenerate ones.
pub fn load_graph(path: &Path) -> Result<GraphRecord> {
    let record = read_graphml(path)?;
    if record.is_degenerate() {
        return Err(KernelMatrixError::DegenerateGraph {
            path: path.to_path_buf(),
            nodes: record.node_count(),
            edges: record.edge_count(),
        });
    }
    Ok(record)
}

/// Load `paths` in parallel; output order matches input order.
pub fn load_graphs(paths: &[PathBuf]) -> LoadBatch {
    let start = Instant::now();
    info!(files = paths.len(), "Loading graphs");

    let results: Vec<Result<GraphRecord>> = paths
        .par_iter()
        .map(|path| {
            debug!(path = %path.display(), "Processing graph");
            load_graph(path)
        })
        .collect();

    let mut batch = LoadBatch::default();
    for (path, result) in paths.iter().zip(results) {
        match result {
            Ok(record) => batch.slots.push(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Dropping graph");
                batch.dropped.push(DroppedGraph {
                    id: path.clone(),
                    reason: e.to_string(),
                });
                batch.slots.push(None);
            }
        }
    }

    info!(
        loaded = batch.loaded(),
        dropped = batch.dropped.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Finished loading graphs"
    );
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    const CHAIN: &str = r#"<graphml><graph edgedefault="directed">
<node id="a"/><node id="b"/><edge source="a" target="b"/></graph></graphml>"#;
    const LONELY: &str = r#"<graphml><graph edgedefault="directed"><node id="a"/></graph></graphml>"#;

    #[test]
    fn test_order_preserved_with_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            write(dir.path(), "0.graphml", CHAIN),
            write(dir.path(), "1.graphml", LONELY),
            write(dir.path(), "2.graphml", "not xml <"),
            write(dir.path(), "3.graphml", CHAIN),
        ];
        let batch = load_graphs(&paths);
        assert_eq!(batch.slots.len(), 4);
        assert_eq!(batch.loaded(), 2);
        assert_eq!(batch.slots[0].as_ref().unwrap().id(), paths[0].as_path());
        assert!(batch.slots[1].is_none());
        assert!(batch.slots[2].is_none());
        assert_eq!(batch.slots[3].as_ref().unwrap().id(), paths[3].as_path());
        let dropped: Vec<_> = batch.dropped.iter().map(|d| d.id.clone()).collect();
        assert_eq!(dropped, vec![paths[1].clone(), paths[2].clone()]);
    }

    #[test]
    fn test_missing_file_is_dropped() {
        let batch = load_graphs(&[PathBuf::from("/nonexistent/graph.graphml")]);
        assert_eq!(batch.loaded(), 0);
        assert!(batch.dropped[0].reason.contains("I/O error"));
    }

    #[test]
    fn test_into_complete_rejects_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![
            write(dir.path(), "a.graphml", CHAIN),
            write(dir.path(), "b.graphml", LONELY),
        ];
        let err = load_graphs(&paths).into_complete(4).unwrap_err();
        match err {
            KernelMatrixError::SubsetShrank { subset, dropped } => {
                assert_eq!(subset, 4);
                assert_eq!(dropped, vec![paths[1].clone()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
