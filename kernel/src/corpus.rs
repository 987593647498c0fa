//! Corpus discovery and the effective-corpus manifest.
//!
//! The manifest is the one ordered list of usable graphs that both the
//! scheduler and the assembler partition. It is written next to the blocks
//! on the first run and reused afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{KernelMatrixError, Result};
use crate::loader::{load_graphs, DroppedGraph};
use crate::partition::Partition;

/// Graphs parsed per screening batch; bounds peak memory.
const SCREEN_CHUNK: usize = 256;

/// List `<root>/<category>/*.<extension>`, sorted, minus `exclude`.
///
/// Exclusions match either the full path or a path relative to `root`.
pub fn discover(root: &Path, extension: &str, exclude: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for category in read_dir_sorted(root)? {
        if !category.is_dir() {
            continue;
        }
        for file in read_dir_sorted(&category)? {
            let matches = file.is_file()
                && file.extension().and_then(|e| e.to_str()) == Some(extension);
            if matches {
                files.push(file);
            }
        }
    }
    files.sort();

    let listed = files.len();
    files.retain(|f| {
        !exclude
            .iter()
            .any(|e| f == e || f.strip_prefix(root).map_or(false, |rel| rel == e))
    });
    info!(
        root = %root.display(),
        listed,
        excluded = listed - files.len(),
        "Discovered corpus"
    );
    Ok(files)
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| KernelMatrixError::io(dir, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| KernelMatrixError::io(dir, e))?;
    entries.sort();
    Ok(entries)
}

/// SHA256 over the subset count, the kernel depth and the ordered identifiers.
pub fn fingerprint(subsets: usize, wl_iterations: usize, files: &[PathBuf]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(format!("subsets:{subsets}\n").as_bytes());
    hasher.update(format!("wl_iterations:{wl_iterations}\n").as_bytes());
    for file in files {
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().into()
}

/// The effective corpus: ordered usable graphs plus what was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusManifest {
    pub subsets: usize,
    /// WL depth every block of this corpus is computed with.
    pub wl_iterations: usize,
    pub files: Vec<PathBuf>,
    pub dropped: Vec<DroppedGraph>,
    /// Hex-encoded [`fingerprint`] of `subsets`, `wl_iterations` and `files`.
    pub fingerprint: String,
}

impl CorpusManifest {
    pub fn new(
        subsets: usize,
        wl_iterations: usize,
        files: Vec<PathBuf>,
        dropped: Vec<DroppedGraph>,
    ) -> Self {
        let fingerprint = hex::encode(fingerprint(subsets, wl_iterations, &files));
        Self {
            subsets,
            wl_iterations,
            files,
            dropped,
            fingerprint,
        }
    }

    /// Parse every listed graph once and keep the ones that load.
    pub fn screen(listing: &[PathBuf], subsets: usize, wl_iterations: usize) -> Self {
        let mut files = Vec::with_capacity(listing.len());
        let mut dropped = Vec::new();
        for chunk in listing.chunks(SCREEN_CHUNK) {
            let batch = load_graphs(chunk);
            for (path, slot) in chunk.iter().zip(&batch.slots) {
                if slot.is_some() {
                    files.push(path.clone());
                }
            }
            dropped.extend(batch.dropped);
        }
        if !dropped.is_empty() {
            warn!(
                dropped = dropped.len(),
                kept = files.len(),
                "Screening removed graphs from the corpus"
            );
        }
        Self::new(subsets, wl_iterations, files, dropped)
    }

    pub fn fingerprint_bytes(&self) -> Result<[u8; 32]> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(&self.fingerprint, &mut out).map_err(|e| {
            KernelMatrixError::CorpusMismatch(format!("unreadable manifest fingerprint: {e}"))
        })?;
        if out != fingerprint(self.subsets, self.wl_iterations, &self.files) {
            return Err(KernelMatrixError::CorpusMismatch(
                "manifest fingerprint does not match its file list".to_string(),
            ));
        }
        Ok(out)
    }

    /// Check that a fresh discovery, `k` and the WL depth still describe this manifest.
    pub fn verify(&self, listing: &[PathBuf], subsets: usize, wl_iterations: usize) -> Result<()> {
        if subsets != self.subsets {
            return Err(KernelMatrixError::CorpusMismatch(format!(
                "blocks were computed with {} subsets, configuration asks for {subsets}",
                self.subsets
            )));
        }
        if wl_iterations != self.wl_iterations {
            return Err(KernelMatrixError::CorpusMismatch(format!(
                "blocks were computed with {} WL iterations, configuration asks for {wl_iterations}",
                self.wl_iterations
            )));
        }
        let mut known: Vec<&PathBuf> = self
            .files
            .iter()
            .chain(self.dropped.iter().map(|d| &d.id))
            .collect();
        known.sort();
        let mut current: Vec<&PathBuf> = listing.iter().collect();
        current.sort();
        if known != current {
            let added = current.iter().filter(|f| known.binary_search(*f).is_err()).count();
            let removed = known.iter().filter(|f| current.binary_search(*f).is_err()).count();
            return Err(KernelMatrixError::CorpusMismatch(format!(
                "corpus listing changed since the manifest was written ({added} added, {removed} removed)"
            )));
        }
        Ok(())
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.files.clone(), self.subsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK: &str = r#"<graphml><graph><edge source="a" target="b"/></graph></graphml>"#;
    const EMPTY: &str = r#"<graphml><graph edgedefault="directed"></graph></graphml>"#;

    fn tree(root: &Path, files: &[(&str, &str)]) {
        for (rel, body) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
    }

    #[test]
    fn test_discover_sorted_one_level() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tree(
            root,
            &[
                ("Tech/b.graphml", OK),
                ("Art/z.graphml", OK),
                ("Art/a.graphml", OK),
                ("Art/notes.txt", "x"),
                ("top.graphml", OK),
                ("Tech/deep/c.graphml", OK),
            ],
        );
        let files = discover(root, "graphml", &[]).unwrap();
        let rel: Vec<_> = files.iter().map(|f| f.strip_prefix(root).unwrap().to_path_buf()).collect();
        assert_eq!(
            rel,
            vec![
                PathBuf::from("Art/a.graphml"),
                PathBuf::from("Art/z.graphml"),
                PathBuf::from("Tech/b.graphml"),
            ]
        );
    }

    #[test]
    fn test_discover_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tree(root, &[("Art/a.graphml", OK), ("Art/pic.graphml", OK), ("Tech/x.graphml", OK)]);
        let files = discover(
            root,
            "graphml",
            &[PathBuf::from("Art/pic.graphml"), root.join("Tech/x.graphml")],
        )
        .unwrap();
        assert_eq!(files, vec![root.join("Art/a.graphml")]);
    }

    #[test]
    fn test_screen_drops_degenerate() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        tree(root, &[("A/1.graphml", OK), ("A/2.graphml", EMPTY), ("A/3.graphml", OK)]);
        let listing = discover(root, "graphml", &[]).unwrap();
        let manifest = CorpusManifest::screen(&listing, 2, 3);
        assert_eq!(manifest.files, vec![root.join("A/1.graphml"), root.join("A/3.graphml")]);
        assert_eq!(manifest.dropped.len(), 1);
        assert_eq!(manifest.dropped[0].id, root.join("A/2.graphml"));
        assert!(manifest.verify(&listing, 2, 3).is_ok());
        assert_eq!(manifest.fingerprint_bytes().unwrap(), fingerprint(2, 3, &manifest.files));
    }

    #[test]
    fn test_verify_detects_changes() {
        let files = vec![PathBuf::from("a"), PathBuf::from("b")];
        let manifest = CorpusManifest::new(3, 5, files.clone(), vec![]);
        assert!(manifest.verify(&files, 3, 5).is_ok());
        assert!(manifest.verify(&files, 4, 5).is_err());
        let err = manifest.verify(&files, 3, 2).unwrap_err();
        assert!(err.to_string().contains("5 WL iterations"));
        let grown = vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")];
        let err = manifest.verify(&grown, 3, 5).unwrap_err();
        assert!(err.to_string().contains("1 added, 0 removed"));
    }

    #[test]
    fn test_fingerprint_depends_on_order_k_and_depth() {
        let ab = vec![PathBuf::from("a"), PathBuf::from("b")];
        let ba = vec![PathBuf::from("b"), PathBuf::from("a")];
        assert_ne!(fingerprint(2, 5, &ab), fingerprint(2, 5, &ba));
        assert_ne!(fingerprint(2, 5, &ab), fingerprint(3, 5, &ab));
        assert_ne!(fingerprint(2, 5, &ab), fingerprint(2, 3, &ab));
        assert_eq!(fingerprint(2, 5, &ab), fingerprint(2, 5, &ab));
    }

    #[test]
    fn test_tampered_manifest() {
        let mut manifest = CorpusManifest::new(2, 5, vec![PathBuf::from("a")], vec![]);
        manifest.files.push(PathBuf::from("b"));
        assert!(manifest.fingerprint_bytes().is_err());

        let mut manifest = CorpusManifest::new(2, 5, vec![PathBuf::from("a")], vec![]);
        manifest.wl_iterations = 3;
        assert!(manifest.fingerprint_bytes().is_err());
    }
}
