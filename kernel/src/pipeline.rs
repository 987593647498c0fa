//! End-to-end wiring: discover, screen, schedule, assemble.

use tracing::{info, warn};

use crate::assemble::Assembler;
use crate::config::MatrixConfig;
use crate::corpus::{discover, CorpusManifest};
use crate::error::{KernelMatrixError, Result};
use crate::matrix::GlobalMatrix;
use crate::scheduler::{RunReport, Scheduler, TaskShard};
use crate::store::BlockStore;
use crate::wl::WeisfeilerLehman;

pub struct Pipeline {
    config: MatrixConfig,
    store: BlockStore,
}

/// Result of [`Pipeline::run`]. `matrix` is `None` when any task failed.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub report: RunReport,
    pub matrix: Option<GlobalMatrix>,
}

impl Pipeline {
    pub fn open(config: MatrixConfig) -> Result<Self> {
        config.validate()?;
        let store = BlockStore::open(&config.block_dir)?;
        Ok(Self { config, store })
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    fn listing(&self) -> Result<Vec<std::path::PathBuf>> {
        discover(
            &self.config.corpus_root,
            self.config.extension(),
            &self.config.exclude,
        )
    }

    /// Effective corpus: the stored manifest if present, otherwise a fresh
    /// screening that is then stored.
    pub fn prepare_corpus(&self) -> Result<CorpusManifest> {
        let listing = self.listing()?;
        if let Some(manifest) = self.store.load_manifest()? {
            manifest.verify(&listing, self.config.subsets, self.config.wl_iterations)?;
            manifest.fingerprint_bytes()?;
            info!(
                graphs = manifest.files.len(),
                dropped = manifest.dropped.len(),
                "Reusing corpus manifest"
            );
            return Ok(manifest);
        }

        let (subsets, depth) = (self.config.subsets, self.config.wl_iterations);
        let manifest = self
            .config
            .install(|| CorpusManifest::screen(&listing, subsets, depth))?;
        self.store.save_manifest(&manifest)?;
        info!(
            graphs = manifest.files.len(),
            dropped = manifest.dropped.len(),
            path = %self.store.manifest_path().display(),
            "Wrote corpus manifest"
        );
        Ok(manifest)
    }

    /// Compute every missing block in `shard`.
    pub fn build_blocks(&self, shard: TaskShard) -> Result<RunReport> {
        let manifest = self.prepare_corpus()?;
        let fingerprint = manifest.fingerprint_bytes()?;
        let partition = manifest.partition();
        info!(graphs = partition.len(), subsets = ?partition.sizes(), "Partitioned corpus");

        let computer = WeisfeilerLehman::new(manifest.wl_iterations);
        let scheduler =
            Scheduler::new(&partition, &self.store, &computer, fingerprint).with_shard(shard);
        self.config.install(|| scheduler.run())
    }

    /// Assemble the stored blocks into the final artifact.
    pub fn assemble(&self) -> Result<GlobalMatrix> {
        let manifest = self.store.load_manifest()?.ok_or_else(|| {
            KernelMatrixError::CorpusMismatch(format!(
                "no corpus manifest at {}",
                self.store.manifest_path().display()
            ))
        })?;
        manifest.verify(
            &self.listing()?,
            self.config.subsets,
            self.config.wl_iterations,
        )?;
        let fingerprint = manifest.fingerprint_bytes()?;
        let partition = manifest.partition();
        Assembler::new(&partition, &self.store, fingerprint).assemble_to(&self.config.output_path)
    }

    /// Build all blocks, then assemble if every task succeeded.
    pub fn run(&self) -> Result<PipelineOutcome> {
        let report = self.build_blocks(TaskShard::default())?;
        if !report.is_success() {
            warn!(
                failed = report.failed.len(),
                "Skipping assembly; rerun after fixing the failed tasks"
            );
            return Ok(PipelineOutcome {
                report,
                matrix: None,
            });
        }
        let matrix = self.assemble()?;
        Ok(PipelineOutcome {
            report,
            matrix: Some(matrix),
        })
    }
}
