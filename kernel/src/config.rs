//! Run configuration.
//!
//! Every path and tunable the pipeline needs lives here and is passed into
//! the components explicitly.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KernelMatrixError, Result};

pub const DEFAULT_SUBSETS: usize = 10;
pub const DEFAULT_WL_ITERATIONS: usize = 5;
pub const DEFAULT_EXTENSION: &str = "graphml";

/// Parameters for one kernel-matrix run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatrixConfig {
    /// Root of the `<category>/<name>.<extension>` graph tree.
    pub corpus_root: PathBuf,
    /// Directory holding `kernel_matrix_{i}_{j}.blk` files and `corpus.json`.
    pub block_dir: PathBuf,
    /// Final matrix artifact.
    pub output_path: PathBuf,
    #[serde(default = "default_subsets")]
    pub subsets: usize,
    #[serde(default = "default_wl_iterations")]
    pub wl_iterations: usize,
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Identifiers known in advance to be degenerate.
    #[serde(default)]
    pub exclude: Vec<PathBuf>,
    /// Size of a dedicated worker pool; the global rayon pool when `None`.
    #[serde(default)]
    pub threads: Option<usize>,
}

fn default_subsets() -> usize {
    DEFAULT_SUBSETS
}

fn default_wl_iterations() -> usize {
    DEFAULT_WL_ITERATIONS
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

impl MatrixConfig {
    pub fn builder() -> MatrixConfigBuilder {
        MatrixConfigBuilder::default()
    }

    /// Read and validate a TOML config file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| KernelMatrixError::io(path, e))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: MatrixConfig =
            toml::from_str(raw).map_err(|e| KernelMatrixError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.subsets == 0 {
            return Err(KernelMatrixError::Config(
                "subsets must be at least 1".to_string(),
            ));
        }
        if self.wl_iterations == 0 {
            return Err(KernelMatrixError::Config(
                "wl_iterations must be at least 1".to_string(),
            ));
        }
        if self.extension.trim_start_matches('.').is_empty() {
            return Err(KernelMatrixError::Config(
                "extension must not be empty".to_string(),
            ));
        }
        if self.threads == Some(0) {
            return Err(KernelMatrixError::Config(
                "threads must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// File extension without a leading dot.
    pub fn extension(&self) -> &str {
        self.extension.trim_start_matches('.')
    }

    /// Run `op` on the configured pool, or on the global one.
    pub fn install<T: Send>(&self, op: impl FnOnce() -> T + Send) -> Result<T> {
        match self.threads {
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| KernelMatrixError::Config(e.to_string()))?;
                Ok(pool.install(op))
            }
            None => Ok(op()),
        }
    }
}

/// Chained construction with validation in [`MatrixConfigBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct MatrixConfigBuilder {
    corpus_root: Option<PathBuf>,
    block_dir: Option<PathBuf>,
    output_path: Option<PathBuf>,
    subsets: Option<usize>,
    wl_iterations: Option<usize>,
    extension: Option<String>,
    exclude: Vec<PathBuf>,
    threads: Option<usize>,
}

impl MatrixConfigBuilder {
    pub fn corpus_root<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.corpus_root = Some(path.into());
        self
    }

    pub fn block_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.block_dir = Some(path.into());
        self
    }

    pub fn output_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn subsets(mut self, k: usize) -> Self {
        self.subsets = Some(k);
        self
    }

    pub fn wl_iterations(mut self, h: usize) -> Self {
        self.wl_iterations = Some(h);
        self
    }

    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = Some(ext.into());
        self
    }

    pub fn exclude<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.exclude.push(path.into());
        self
    }

    pub fn threads(mut self, n: usize) -> Self {
        self.threads = Some(n);
        self
    }

    /// Paths are required; everything else falls back to its default.
    pub fn build(self) -> Result<MatrixConfig> {
        let missing = |name: &str| KernelMatrixError::Config(format!("{name} is required"));
        let config = MatrixConfig {
            corpus_root: self.corpus_root.ok_or_else(|| missing("corpus_root"))?,
            block_dir: self.block_dir.ok_or_else(|| missing("block_dir"))?,
            output_path: self.output_path.ok_or_else(|| missing("output_path"))?,
            subsets: self.subsets.unwrap_or(DEFAULT_SUBSETS),
            wl_iterations: self.wl_iterations.unwrap_or(DEFAULT_WL_ITERATIONS),
            extension: self.extension.unwrap_or_else(default_extension),
            exclude: self.exclude,
            threads: self.threads,
        };
        config.validate()?;
        Ok(config)
    }
}
