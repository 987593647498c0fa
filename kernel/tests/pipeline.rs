//! End-to-end runs over a small on-disk corpus.

use std::fs;
use std::path::{Path, PathBuf};

use approx::assert_relative_eq;
use wl_kernel_matrix::{
    load_graphs, FileIndexMap, GlobalMatrix, KernelComputer, KernelMatrixError, MatrixConfig,
    PairTask, Pipeline, TaskShard, WeisfeilerLehman,
};

/// Interaction graph: `hub` replies to `fanout` users, who reply down a chain.
fn graphml(hub: &str, fanout: usize, chain: usize) -> String {
    let mut edges = String::new();
    for f in 0..fanout {
        edges.push_str(&format!(
            r#"<edge source="{hub}" target="user{f}"><data key="w">0.5</data></edge>"#
        ));
    }
    for c in 0..chain {
        edges.push_str(&format!(r#"<edge source="user{c}" target="user{}"/>"#, c + 1));
    }
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<graphml xmlns="http://graphml.graphdrawing.org/xmlns">
<key id="w" for="edge" attr.name="weight" attr.type="double"/>
<graph edgedefault="directed">{edges}</graph>
</graphml>"#
    )
}

fn write_graph(root: &Path, rel: &str, body: &str) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, body).unwrap();
    path
}

fn six_graph_corpus(root: &Path) {
    write_graph(root, "Art/a.graphml", &graphml("mod", 2, 1));
    write_graph(root, "Art/b.graphml", &graphml("mod", 3, 0));
    write_graph(root, "Art/c.graphml", &graphml("op", 2, 2));
    write_graph(root, "Tech/d.graphml", &graphml("mod", 4, 3));
    write_graph(root, "Tech/e.graphml", &graphml("op", 1, 1));
    write_graph(root, "Tech/f.graphml", &graphml("mod", 2, 1));
}

fn config(dir: &Path, subsets: usize) -> MatrixConfig {
    MatrixConfig::builder()
        .corpus_root(dir.join("graphs"))
        .block_dir(dir.join("kernel_matrices"))
        .output_path(dir.join("final").join("complete_kernel_matrix.bin"))
        .subsets(subsets)
        .wl_iterations(3)
        .threads(2)
        .build()
        .unwrap()
}

fn assert_global_invariants(global: &GlobalMatrix) {
    let m = &global.matrix;
    assert_eq!(m.dim(), global.files.len());
    assert_eq!(m.asymmetry(1e-8), None);
    for a in 0..m.dim() {
        assert_eq!(m.get(a, a), 1.0);
        for b in 0..m.dim() {
            assert!((0.0..=1.0).contains(&m.get(a, b)));
        }
    }
}

#[test]
fn six_graphs_three_subsets_matches_direct_kernel() {
    let dir = tempfile::tempdir().unwrap();
    six_graph_corpus(&dir.path().join("graphs"));
    let pipeline = Pipeline::open(config(dir.path(), 3)).unwrap();

    let outcome = pipeline.run().unwrap();
    assert_eq!(
        outcome.report.computed,
        vec![
            PairTask { i: 0, j: 1 },
            PairTask { i: 0, j: 2 },
            PairTask { i: 1, j: 2 },
        ]
    );
    let global = outcome.matrix.unwrap();
    assert_eq!(global.matrix.dim(), 6);
    assert_global_invariants(&global);

    // Same kernel over the whole corpus in one pool.
    let graphs = load_graphs(&global.files).into_complete(0).unwrap();
    let direct = WeisfeilerLehman::new(3).compute(&graphs).unwrap();
    for a in 0..6 {
        for b in 0..6 {
            assert_relative_eq!(global.matrix.get(a, b), direct.get(a, b), epsilon = 1e-12);
        }
    }

    // a and f are structurally identical; both live in different subsets.
    assert_relative_eq!(global.matrix.get(0, 5), 1.0, epsilon = 1e-12);

    // Subset 2 is {e, f}; its self-similarity came from block (0, 2).
    let block = pipeline.store().get(0, 2).unwrap();
    assert_eq!(global.matrix.get(4, 5), block.matrix.get(2, 3));

    let written = GlobalMatrix::read_from(&pipeline.config().output_path).unwrap();
    assert_eq!(written, global);
}

#[test]
fn degenerate_graph_shrinks_corpus_consistently() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("graphs");
    six_graph_corpus(&root);
    let empty = write_graph(
        &root,
        "Art/bb_lonely.graphml",
        r#"<graphml><graph edgedefault="directed"><node id="solo"/></graph></graphml>"#,
    );

    let pipeline = Pipeline::open(config(dir.path(), 3)).unwrap();
    let manifest = pipeline.prepare_corpus().unwrap();
    assert_eq!(manifest.files.len(), 6);
    assert!(!manifest.files.contains(&empty));
    assert_eq!(manifest.dropped.len(), 1);
    assert_eq!(manifest.dropped[0].id, empty);

    let partition = manifest.partition();
    assert_eq!(partition.sizes(), vec![2, 2, 2]);
    let map = FileIndexMap::from_partition(&partition);
    for file in &manifest.files {
        let (s, local) = map.get(file).unwrap();
        assert!(local < partition.size(s));
    }
    assert_eq!(map.get(&empty), None);

    let global = pipeline.run().unwrap().matrix.unwrap();
    assert_eq!(global.files, manifest.files);
    assert_global_invariants(&global);
}

#[test]
fn second_run_computes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    six_graph_corpus(&dir.path().join("graphs"));

    let first = Pipeline::open(config(dir.path(), 3)).unwrap().run().unwrap();
    assert_eq!(first.report.computed.len(), 3);

    let second = Pipeline::open(config(dir.path(), 3)).unwrap().run().unwrap();
    assert!(second.report.computed.is_empty());
    assert_eq!(second.report.skipped.len(), 3);
    assert_eq!(second.matrix.unwrap(), first.matrix.unwrap());
}

#[test]
fn sharded_runs_combine() {
    let dir = tempfile::tempdir().unwrap();
    six_graph_corpus(&dir.path().join("graphs"));
    let pipeline = Pipeline::open(config(dir.path(), 4)).unwrap();

    let a = pipeline.build_blocks(TaskShard::new(0, 2).unwrap()).unwrap();
    assert!(matches!(
        pipeline.assemble(),
        Err(KernelMatrixError::MissingBlocks { .. })
    ));
    assert!(!pipeline.config().output_path.exists());

    let b = pipeline.build_blocks(TaskShard::new(1, 2).unwrap()).unwrap();
    assert_eq!(a.computed.len() + b.computed.len(), 6);
    assert_global_invariants(&pipeline.assemble().unwrap());
}

#[test]
fn changed_corpus_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("graphs");
    six_graph_corpus(&root);
    let pipeline = Pipeline::open(config(dir.path(), 3)).unwrap();
    pipeline.build_blocks(TaskShard::default()).unwrap();

    write_graph(&root, "Tech/g.graphml", &graphml("new", 2, 2));
    assert!(matches!(
        pipeline.assemble(),
        Err(KernelMatrixError::CorpusMismatch(_))
    ));
    assert!(matches!(
        Pipeline::open(config(dir.path(), 4)).unwrap().prepare_corpus(),
        Err(KernelMatrixError::CorpusMismatch(_))
    ));
}

#[test]
fn shards_with_different_depths_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    six_graph_corpus(&dir.path().join("graphs"));
    Pipeline::open(config(dir.path(), 4))
        .unwrap()
        .build_blocks(TaskShard::new(0, 2).unwrap())
        .unwrap();

    let mut deeper = config(dir.path(), 4);
    deeper.wl_iterations = 5;
    let pipeline = Pipeline::open(deeper).unwrap();
    assert!(matches!(
        pipeline.build_blocks(TaskShard::new(1, 2).unwrap()),
        Err(KernelMatrixError::CorpusMismatch(_))
    ));
    assert!(matches!(
        pipeline.assemble(),
        Err(KernelMatrixError::CorpusMismatch(_))
    ));
    assert!(!pipeline.config().output_path.exists());
}

#[test]
fn failed_task_skips_assembly() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("graphs");
    six_graph_corpus(&root);
    let pipeline = Pipeline::open(config(dir.path(), 3)).unwrap();
    pipeline.prepare_corpus().unwrap();

    // Corrupt a screened graph before the blocks are computed.
    fs::write(root.join("Tech/f.graphml"), "<graphml><graph>").unwrap();
    let outcome = pipeline.run().unwrap();
    assert!(outcome.matrix.is_none());
    assert_eq!(outcome.report.computed, vec![PairTask { i: 0, j: 1 }]);
    assert_eq!(outcome.report.failed.len(), 2);
    assert!(!pipeline.config().output_path.exists());
}

#[test]
fn single_subset_run() {
    let dir = tempfile::tempdir().unwrap();
    six_graph_corpus(&dir.path().join("graphs"));
    let outcome = Pipeline::open(config(dir.path(), 1)).unwrap().run().unwrap();
    assert_eq!(outcome.report.computed, vec![PairTask { i: 0, j: 0 }]);
    assert_global_invariants(&outcome.matrix.unwrap());
}
