//! Python Bindings for the kernel matrix builder

use std::path::PathBuf;

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;

use crate::config::MatrixConfig;
use crate::error::KernelMatrixError;
use crate::pipeline::Pipeline;
use crate::scheduler::TaskShard;
use crate::wl::{KernelComputer, WeisfeilerLehman};

fn to_py(e: KernelMatrixError) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

fn open(config_path: &str) -> PyResult<Pipeline> {
    let config = MatrixConfig::from_toml_file(config_path).map_err(to_py)?;
    Pipeline::open(config).map_err(to_py)
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Compute missing blocks: (computed, skipped, failed)
#[pyfunction]
#[pyo3(signature = (config_path, shard_index=0, shard_count=1))]
fn build_kernel_blocks(
    config_path: &str,
    shard_index: usize,
    shard_count: usize,
) -> PyResult<(usize, usize, usize)> {
    let pipeline = open(config_path)?;
    let shard = TaskShard::new(shard_index, shard_count).map_err(to_py)?;
    let report = pipeline.build_blocks(shard).map_err(to_py)?;
    Ok((report.computed.len(), report.skipped.len(), report.failed.len()))
}

/// Assemble stored blocks into the final matrix file; returns N
#[pyfunction]
fn assemble_kernel_matrix(config_path: &str) -> PyResult<usize> {
    let pipeline = open(config_path)?;
    let global = pipeline.assemble().map_err(to_py)?;
    Ok(global.matrix.dim())
}

// ============================================================================
// AD-HOC KERNEL
// ============================================================================

/// Normalized WL kernel over a small list of GraphML files
#[pyfunction]
#[pyo3(signature = (paths, iterations=5))]
fn kernel_matrix_for_graphs(paths: Vec<String>, iterations: usize) -> PyResult<Vec<Vec<f64>>> {
    let graphs = paths
        .into_iter()
        .map(|p| crate::loader::load_graph(&PathBuf::from(p)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(to_py)?;
    let matrix = WeisfeilerLehman::new(iterations)
        .compute(&graphs)
        .map_err(to_py)?;
    Ok(matrix.to_rows())
}

// ============================================================================
// MODULE EXPORT
// ============================================================================

#[pymodule]
fn wl_kernel_matrix(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(build_kernel_blocks, m)?)?;
    m.add_function(wrap_pyfunction!(assemble_kernel_matrix, m)?)?;
    m.add_function(wrap_pyfunction!(kernel_matrix_for_graphs, m)?)?;
    Ok(())
}
