//! Append-only block store keyed by `(i, j)`.
//!
//! File layout (little-endian):
//!
//! ```text
//! "WLKB" | version u32 | i u32 | j u32 | rows_i u64 | rows_j u64 | fingerprint [32]
//! dim*dim f64, row-major
//! SHA256 of everything above
//! ```
//!
//! Writes go through a synced temp file that is persisted without clobbering,
//! so a block is either fully present under its final name or absent.

use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::corpus::CorpusManifest;
use crate::error::{KernelMatrixError, Result};
use crate::matrix::{read_f64, read_u64, write_atomic, SquareMatrix};

const BLOCK_MAGIC: &[u8; 4] = b"WLKB";
const BLOCK_VERSION: u32 = 1;
const HEADER_LEN: usize = 64;
const DIGEST_LEN: usize = 32;
const MANIFEST_FILE: &str = "corpus.json";

/// Identity and shape of a stored block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub i: usize,
    pub j: usize,
    /// Rows belonging to subset `i`.
    pub rows_i: usize,
    /// Rows belonging to subset `j`; zero when `i == j`.
    pub rows_j: usize,
    /// Fingerprint of the corpus the block was computed against.
    pub fingerprint: [u8; 32],
}

impl BlockHeader {
    pub fn dim(&self) -> usize {
        self.rows_i + self.rows_j
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(BLOCK_MAGIC);
        out.extend_from_slice(&BLOCK_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.i as u32).to_le_bytes());
        out.extend_from_slice(&(self.j as u32).to_le_bytes());
        out.extend_from_slice(&(self.rows_i as u64).to_le_bytes());
        out.extend_from_slice(&(self.rows_j as u64).to_le_bytes());
        out.extend_from_slice(&self.fingerprint);
        out
    }

    fn decode(path: &Path, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != BLOCK_MAGIC {
            return Err(KernelMatrixError::corrupt(path, "bad magic"));
        }
        let u32_at = |at: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(buf)
        };
        let version = u32_at(4);
        if version != BLOCK_VERSION {
            return Err(KernelMatrixError::corrupt(
                path,
                format!("unsupported version {version}"),
            ));
        }
        let rows_at = |at: usize| {
            let rows = read_u64(&bytes[at..at + 8]);
            u32::try_from(rows)
                .map(|r| r as usize)
                .map_err(|_| KernelMatrixError::corrupt(path, format!("implausible row count {rows}")))
        };
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&bytes[32..64]);
        Ok(Self {
            i: u32_at(8) as usize,
            j: u32_at(12) as usize,
            rows_i: rows_at(16)?,
            rows_j: rows_at(24)?,
            fingerprint,
        })
    }

    /// Expected on-disk size; `None` if it does not fit in a `u64`.
    fn file_len(&self) -> Option<u64> {
        let dim = self.rows_i.checked_add(self.rows_j)? as u64;
        dim.checked_mul(dim)?
            .checked_mul(8)?
            .checked_add((HEADER_LEN + DIGEST_LEN) as u64)
    }
}

/// Pooled similarity matrix for one pair task.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelBlock {
    pub header: BlockHeader,
    pub matrix: SquareMatrix,
}

#[derive(Debug, Clone)]
pub struct BlockStore {
    dir: PathBuf,
}

impl BlockStore {
    /// Open (creating if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| KernelMatrixError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn block_path(&self, i: usize, j: usize) -> PathBuf {
        self.dir.join(format!("kernel_matrix_{i}_{j}.blk"))
    }

    /// Metadata-only existence check.
    pub fn exists(&self, i: usize, j: usize) -> bool {
        self.block_path(i, j).is_file()
    }

    /// Persist a block. Refuses to replace an existing one.
    pub fn put(&self, block: &KernelBlock) -> Result<PathBuf> {
        let KernelBlock { header, matrix } = block;
        let path = self.block_path(header.i, header.j);
        if matrix.dim() != header.dim() {
            return Err(KernelMatrixError::corrupt(
                &path,
                format!(
                    "matrix is {0}x{0}, header says {1}x{1}",
                    matrix.dim(),
                    header.dim()
                ),
            ));
        }
        if self.exists(header.i, header.j) {
            return Err(KernelMatrixError::BlockExists {
                i: header.i,
                j: header.j,
            });
        }

        let mut bytes = header.encode();
        bytes.reserve(matrix.as_slice().len() * 8 + DIGEST_LEN);
        for v in matrix.as_slice() {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        bytes.extend_from_slice(&digest);

        let mut tmp = tempfile::Builder::new()
            .prefix(".kernel_matrix_")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| KernelMatrixError::io(&self.dir, e))?;
        tmp.write_all(&bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| KernelMatrixError::io(tmp.path(), e))?;
        tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                KernelMatrixError::BlockExists {
                    i: header.i,
                    j: header.j,
                }
            } else {
                KernelMatrixError::io(&path, e.error)
            }
        })?;

        info!(i = header.i, j = header.j, dim = header.dim(), "Saved kernel block");
        Ok(path)
    }

    /// Read only the header of block `(i, j)`.
    pub fn get_header(&self, i: usize, j: usize) -> Result<BlockHeader> {
        let path = self.block_path(i, j);
        let mut file = self.open_block(&path, i, j)?;
        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf)
            .map_err(|_| KernelMatrixError::corrupt(&path, "truncated header"))?;
        let header = BlockHeader::decode(&path, &buf)?;
        check_identity(&path, &header, i, j)?;
        let expected = expected_len(&path, &header)?;

        let len = file
            .metadata()
            .map_err(|e| KernelMatrixError::io(&path, e))?
            .len();
        if len != expected {
            return Err(KernelMatrixError::corrupt(
                &path,
                format!("file is {len} bytes, expected {expected}"),
            ));
        }
        Ok(header)
    }

    /// Load and verify block `(i, j)`.
    pub fn get(&self, i: usize, j: usize) -> Result<KernelBlock> {
        let path = self.block_path(i, j);
        let mut file = self.open_block(&path, i, j)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| KernelMatrixError::io(&path, e))?;

        let header = BlockHeader::decode(&path, &bytes)?;
        check_identity(&path, &header, i, j)?;
        if bytes.len() as u64 != expected_len(&path, &header)? {
            return Err(KernelMatrixError::corrupt(&path, "truncated block"));
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err(KernelMatrixError::corrupt(&path, "checksum mismatch"));
        }
        let data = body[HEADER_LEN..].chunks_exact(8).map(read_f64).collect();
        debug!(i, j, "Loaded kernel block");
        Ok(KernelBlock {
            matrix: SquareMatrix::from_raw(header.dim(), data),
            header,
        })
    }

    fn open_block(&self, path: &Path, i: usize, j: usize) -> Result<File> {
        File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => KernelMatrixError::BlockNotFound { i, j },
            _ => KernelMatrixError::io(path, e),
        })
    }

    // ------------------------------------------------------------------------
    // Corpus manifest
    // ------------------------------------------------------------------------

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn load_manifest(&self) -> Result<Option<CorpusManifest>> {
        let path = self.manifest_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KernelMatrixError::io(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| KernelMatrixError::serialization(&path, e))
    }

    pub fn save_manifest(&self, manifest: &CorpusManifest) -> Result<()> {
        let path = self.manifest_path();
        let raw = serde_json::to_vec_pretty(manifest)
            .map_err(|e| KernelMatrixError::serialization(&path, e))?;
        write_atomic(&path, &raw)
    }
}

fn check_identity(path: &Path, header: &BlockHeader, i: usize, j: usize) -> Result<()> {
    if (header.i, header.j) != (i, j) {
        return Err(KernelMatrixError::corrupt(
            path,
            format!("holds block ({}, {})", header.i, header.j),
        ));
    }
    Ok(())
}

fn expected_len(path: &Path, header: &BlockHeader) -> Result<u64> {
    header
        .file_len()
        .ok_or_else(|| KernelMatrixError::corrupt(path, "implausible block dimensions"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(i: usize, j: usize, rows_i: usize, rows_j: usize) -> KernelBlock {
        let dim = rows_i + rows_j;
        let mut matrix = SquareMatrix::zeros(dim);
        for a in 0..dim {
            for b in a + 1..dim {
                matrix.set_symmetric(a, b, (a * dim + b) as f64 / (dim * dim) as f64);
            }
        }
        matrix.fill_diagonal(1.0);
        KernelBlock {
            header: BlockHeader {
                i,
                j,
                rows_i,
                rows_j,
                fingerprint: [7; 32],
            },
            matrix,
        }
    }

    #[test]
    fn test_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path().join("blocks")).unwrap();
        assert!(!store.exists(0, 1));
        let b = block(0, 1, 2, 3);
        let path = store.put(&b).unwrap();
        assert!(path.ends_with("kernel_matrix_0_1.blk"));
        assert!(store.exists(0, 1));
        assert!(!store.exists(1, 0));
        assert_eq!(store.get(0, 1).unwrap(), b);
        assert_eq!(store.get_header(0, 1).unwrap(), b.header);
    }

    #[test]
    fn test_put_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        store.put(&block(1, 2, 1, 1)).unwrap();
        let err = store.put(&block(1, 2, 1, 1)).unwrap_err();
        assert!(matches!(err, KernelMatrixError::BlockExists { i: 1, j: 2 }));
    }

    #[test]
    fn test_get_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get(3, 4),
            Err(KernelMatrixError::BlockNotFound { i: 3, j: 4 })
        ));
        assert!(matches!(
            store.get_header(3, 4),
            Err(KernelMatrixError::BlockNotFound { .. })
        ));
    }

    #[test]
    fn test_shape_checked_on_put() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let mut b = block(0, 1, 2, 2);
        b.header.rows_j = 3;
        assert!(store.put(&b).is_err());
        assert!(!store.exists(0, 1));
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let path = store.put(&block(0, 2, 2, 2)).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_LEN + 3] ^= 0x01;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            store.get(0, 2),
            Err(KernelMatrixError::CorruptBlock { .. })
        ));

        bytes.truncate(HEADER_LEN + 8);
        fs::write(&path, &bytes).unwrap();
        assert!(store.get_header(0, 2).is_err());
    }

    #[test]
    fn test_oversized_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        let path = store.put(&block(0, 1, 1, 1)).unwrap();

        // High byte of rows_i.
        let mut bytes = fs::read(&path).unwrap();
        bytes[23] = 0x40;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            store.get_header(0, 1),
            Err(KernelMatrixError::CorruptBlock { .. })
        ));
        assert!(matches!(
            store.get(0, 1),
            Err(KernelMatrixError::CorruptBlock { .. })
        ));
    }

    #[test]
    fn test_overflowing_dimensions() {
        let header = BlockHeader {
            i: 0,
            j: 1,
            rows_i: u32::MAX as usize,
            rows_j: u32::MAX as usize,
            fingerprint: [0; 32],
        };
        assert_eq!(header.file_len(), None);
        assert_eq!(block(0, 1, 2, 3).header.file_len(), Some(64 + 25 * 8 + 32));
    }

    #[test]
    fn test_no_temp_files_left() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path()).unwrap();
        store.put(&block(0, 1, 1, 1)).unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["kernel_matrix_0_1.blk".to_string()]);
    }
}
