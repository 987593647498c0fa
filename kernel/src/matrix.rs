//! Dense square matrices and the final matrix artifact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{KernelMatrixError, Result};

/// Row-major `dim x dim` matrix of `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct SquareMatrix {
    dim: usize,
    data: Vec<f64>,
}

impl SquareMatrix {
    pub fn zeros(dim: usize) -> Self {
        Self {
            dim,
            data: vec![0.0; dim * dim],
        }
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let dim = rows.len();
        let data: Vec<f64> = rows.into_iter().flatten().collect();
        assert_eq!(data.len(), dim * dim, "rows do not form a square matrix");
        Self { dim, data }
    }

    pub(crate) fn from_raw(dim: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), dim * dim);
        Self { dim, data }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.dim + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.dim + col] = value;
    }

    /// Write `value` at `(a, b)` and `(b, a)`.
    pub fn set_symmetric(&mut self, a: usize, b: usize, value: f64) {
        self.set(a, b, value);
        self.set(b, a, value);
    }

    pub fn fill_diagonal(&mut self, value: f64) {
        for i in 0..self.dim {
            self.set(i, i, value);
        }
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.dim..(row + 1) * self.dim]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        (0..self.dim).map(|r| self.row(r).to_vec()).collect()
    }

    /// First pair `(a, b)`, `a < b`, that differs by more than `tol`.
    pub fn asymmetry(&self, tol: f64) -> Option<(usize, usize)> {
        (0..self.dim)
            .flat_map(|a| (a + 1..self.dim).map(move |b| (a, b)))
            .find(|&(a, b)| (self.get(a, b) - self.get(b, a)).abs() > tol)
    }
}

// ============================================================================
// GLOBAL MATRIX ARTIFACT
// ============================================================================

const MATRIX_MAGIC: &[u8; 4] = b"WLGM";

/// The assembled corpus-wide matrix plus the identifier of each row.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalMatrix {
    pub files: Vec<PathBuf>,
    pub matrix: SquareMatrix,
}

#[derive(Serialize, Deserialize)]
struct MatrixIndex {
    files: Vec<PathBuf>,
}

impl GlobalMatrix {
    /// Path of the JSON sidecar listing row identifiers.
    pub fn index_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".index.json");
        PathBuf::from(name)
    }

    /// Atomically write the matrix and its index sidecar.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let n = self.matrix.dim();
        let mut bytes = Vec::with_capacity(12 + n * n * 8 + 32);
        bytes.extend_from_slice(MATRIX_MAGIC);
        bytes.extend_from_slice(&(n as u64).to_le_bytes());
        for v in self.matrix.as_slice() {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        bytes.extend_from_slice(&digest);

        let index = serde_json::to_vec_pretty(&MatrixIndex {
            files: self.files.clone(),
        })
        .map_err(|e| KernelMatrixError::serialization(path, e))?;

        write_atomic(&Self::index_path(path), &index)?;
        write_atomic(path, &bytes)
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| KernelMatrixError::io(path, e))?;
        if bytes.len() < 12 + 32 || &bytes[..4] != MATRIX_MAGIC {
            return Err(KernelMatrixError::corrupt(path, "not a matrix file"));
        }
        let (body, digest) = bytes.split_at(bytes.len() - 32);
        if Sha256::digest(body).as_slice() != digest {
            return Err(KernelMatrixError::corrupt(path, "checksum mismatch"));
        }
        let n = read_u64(&body[4..12]);
        let values = &body[12..];
        let expected = n
            .checked_mul(n)
            .and_then(|cells| cells.checked_mul(8))
            .ok_or_else(|| KernelMatrixError::corrupt(path, "implausible matrix dimension"))?;
        if values.len() as u64 != expected {
            return Err(KernelMatrixError::corrupt(path, "truncated matrix"));
        }
        let n = n as usize;
        let data = values.chunks_exact(8).map(read_f64).collect();

        let index_path = Self::index_path(path);
        let raw = fs::read(&index_path).map_err(|e| KernelMatrixError::io(&index_path, e))?;
        let index: MatrixIndex = serde_json::from_slice(&raw)
            .map_err(|e| KernelMatrixError::serialization(&index_path, e))?;
        if index.files.len() != n {
            return Err(KernelMatrixError::corrupt(
                &index_path,
                format!("{} identifiers for a {n}x{n} matrix", index.files.len()),
            ));
        }

        Ok(Self {
            files: index.files,
            matrix: SquareMatrix::from_raw(n, data),
        })
    }
}

pub(crate) fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

pub(crate) fn read_f64(bytes: &[u8]) -> f64 {
    f64::from_bits(read_u64(bytes))
}

/// Write through a synced temp file in the target directory, then rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| KernelMatrixError::io(dir, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| KernelMatrixError::io(dir, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| KernelMatrixError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| KernelMatrixError::io(path, e.error))?;
    Ok(())
}
