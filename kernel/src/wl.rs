//! Weisfeiler-Lehman subtree kernel (O(N²) pairwise).
//!
//! Each iteration relabels every node by its current label plus the sorted
//! multiset of its out-neighbors' labels. A graph's feature vector is the
//! histogram of labels seen across all iterations; the kernel is the dot
//! product of feature vectors, normalized by the geometric mean of the two
//! self-similarities.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::error::Result;
use crate::graph::GraphRecord;
use crate::matrix::SquareMatrix;

/// Computes a normalized similarity matrix over a pooled graph list.
pub trait KernelComputer: Sync {
    fn compute(&self, graphs: &[GraphRecord]) -> Result<SquareMatrix>;
}

#[derive(Debug, Clone, Copy)]
pub struct WeisfeilerLehman {
    iterations: usize,
}

impl WeisfeilerLehman {
    /// `iterations` label sets, including the initial labels.
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Sparse feature vectors, sorted by label id.
    pub fn features(&self, graphs: &[GraphRecord]) -> Vec<Vec<(u32, f64)>> {
        let mut next_id = 0u32;

        let mut initial: HashMap<&str, u32> = HashMap::new();
        let mut labels: Vec<Vec<u32>> = graphs
            .iter()
            .map(|g| {
                g.labels()
                    .iter()
                    .map(|l| {
                        *initial.entry(l.as_str()).or_insert_with(|| {
                            next_id += 1;
                            next_id - 1
                        })
                    })
                    .collect()
            })
            .collect();

        let mut histograms: Vec<HashMap<u32, f64>> = labels.iter().map(|l| histogram(l)).collect();

        for _ in 1..self.iterations {
            let signatures: Vec<Vec<(u32, Vec<u32>)>> = graphs
                .par_iter()
                .zip(labels.par_iter())
                .map(|(g, current)| signatures(g, current))
                .collect();

            // Compression is sequential so label ids are reproducible.
            let mut dictionary: HashMap<(u32, Vec<u32>), u32> = HashMap::new();
            labels = signatures
                .into_iter()
                .map(|sigs| {
                    sigs.into_iter()
                        .map(|sig| {
                            *dictionary.entry(sig).or_insert_with(|| {
                                next_id += 1;
                                next_id - 1
                            })
                        })
                        .collect()
                })
                .collect();

            for (hist, current) in histograms.iter_mut().zip(&labels) {
                for &label in current {
                    *hist.entry(label).or_insert(0.0) += 1.0;
                }
            }
        }

        histograms
            .into_iter()
            .map(|h| {
                let mut v: Vec<(u32, f64)> = h.into_iter().collect();
                v.sort_unstable_by_key(|&(label, _)| label);
                v
            })
            .collect()
    }
}

impl KernelComputer for WeisfeilerLehman {
    fn compute(&self, graphs: &[GraphRecord]) -> Result<SquareMatrix> {
        let features = self.features(graphs);
        Ok(normalized_gram(&features))
    }
}

fn histogram(labels: &[u32]) -> HashMap<u32, f64> {
    let mut h = HashMap::new();
    for &label in labels {
        *h.entry(label).or_insert(0.0) += 1.0;
    }
    h
}

fn signatures(graph: &GraphRecord, current: &[u32]) -> Vec<(u32, Vec<u32>)> {
    (0..graph.node_count())
        .map(|node| {
            let mut neighbors: Vec<u32> = graph
                .successors(node)
                .iter()
                .map(|&n| current[n])
                .collect();
            neighbors.sort_unstable();
            (current[node], neighbors)
        })
        .collect()
}

/// Merge-join dot product of two sorted sparse vectors.
fn dot(a: &[(u32, f64)], b: &[(u32, f64)]) -> f64 {
    let (mut i, mut j, mut sum) = (0, 0, 0.0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                sum += a[i].1 * b[j].1;
                i += 1;
                j += 1;
            }
        }
    }
    sum
}

/// All-pairs normalized kernel, rows in parallel.
fn normalized_gram(features: &[Vec<(u32, f64)>]) -> SquareMatrix {
    let n = features.len();
    let norms: Vec<f64> = features.par_iter().map(|f| dot(f, f).sqrt()).collect();

    let rows: Vec<Vec<(usize, f64)>> = features
        .par_iter()
        .enumerate()
        .map(|(i, f1)| {
            features
                .iter()
                .enumerate()
                .skip(i + 1)
                .map(|(j, f2)| {
                    let denom = norms[i] * norms[j];
                    let k = if denom > 0.0 { dot(f1, f2) / denom } else { 0.0 };
                    (j, k.clamp(0.0, 1.0))
                })
                .collect()
        })
        .collect();

    let mut m = SquareMatrix::zeros(n);
    for (i, row) in rows.into_iter().enumerate() {
        for (j, k) in row {
            m.set_symmetric(i, j, k);
        }
    }
    m.fill_diagonal(1.0);
    m
}
