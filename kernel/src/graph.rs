//! Graph records and GraphML parsing.
//!
//! A record is a directed, node-labeled, edge-weighted graph. Labels default
//! to the GraphML node id unless the document declares a `label` key for
//! nodes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{KernelMatrixError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub source: usize,
    pub target: usize,
    pub weight: f64,
}

/// One parsed corpus graph. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphRecord {
    id: PathBuf,
    labels: Vec<String>,
    edges: Vec<Edge>,
    successors: Vec<Vec<usize>>,
}

impl GraphRecord {
    /// Build from `(source, target)` node names; each name is also its label.
    pub fn from_edges(id: impl Into<PathBuf>, edges: &[(&str, &str)]) -> Self {
        let mut builder = RecordBuilder::default();
        for (u, v) in edges {
            let s = builder.node(u);
            let t = builder.node(v);
            builder.edge(s, t, 1.0, true);
        }
        builder.finish(id.into())
    }

    pub fn id(&self) -> &Path {
        &self.id
    }

    pub fn node_count(&self) -> usize {
        self.labels.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Out-neighbors of `node`.
    pub fn successors(&self, node: usize) -> &[usize] {
        &self.successors[node]
    }

    /// No nodes or no edges.
    pub fn is_degenerate(&self) -> bool {
        self.labels.is_empty() || self.edges.is_empty()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

#[derive(Default)]
struct RecordBuilder {
    index: HashMap<String, usize>,
    labels: Vec<String>,
    edges: Vec<Edge>,
    edge_index: HashMap<(usize, usize), usize>,
}

impl RecordBuilder {
    fn node(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.labels.len();
        self.index.insert(name.to_string(), idx);
        self.labels.push(name.to_string());
        idx
    }

    fn relabel(&mut self, node: usize, label: String) {
        self.labels[node] = label;
    }

    /// Parallel edges collapse onto one; the last weight wins.
    fn edge(&mut self, source: usize, target: usize, weight: f64, directed: bool) -> usize {
        let id = self.insert_edge(source, target, weight);
        if !directed && source != target {
            self.insert_edge(target, source, weight);
        }
        id
    }

    fn insert_edge(&mut self, source: usize, target: usize, weight: f64) -> usize {
        if let Some(&idx) = self.edge_index.get(&(source, target)) {
            self.edges[idx].weight = weight;
            return idx;
        }
        let idx = self.edges.len();
        self.edge_index.insert((source, target), idx);
        self.edges.push(Edge {
            source,
            target,
            weight,
        });
        idx
    }

    fn set_weight(&mut self, edge: usize, weight: f64, directed: bool) {
        self.edges[edge].weight = weight;
        if !directed {
            let Edge { source, target, .. } = self.edges[edge];
            if let Some(&rev) = self.edge_index.get(&(target, source)) {
                self.edges[rev].weight = weight;
            }
        }
    }

    fn finish(self, id: PathBuf) -> GraphRecord {
        let mut successors = vec![Vec::new(); self.labels.len()];
        for edge in &self.edges {
            successors[edge.source].push(edge.target);
        }
        GraphRecord {
            id,
            labels: self.labels,
            edges: self.edges,
            successors,
        }
    }
}

// ============================================================================
// GRAPHML
// ============================================================================

/// Element whose `<data>` children are being read.
enum Owner {
    Node(usize),
    Edge(usize, bool),
}

struct GraphmlParser {
    builder: RecordBuilder,
    label_keys: Vec<String>,
    weight_keys: Vec<String>,
    directed_default: bool,
    owner: Option<Owner>,
    data_key: Option<String>,
    text: String,
}

impl GraphmlParser {
    fn new() -> Self {
        Self {
            builder: RecordBuilder::default(),
            label_keys: Vec::new(),
            weight_keys: Vec::new(),
            directed_default: true,
            owner: None,
            data_key: None,
            text: String::new(),
        }
    }

    fn handle_open(&mut self, e: &BytesStart<'_>, has_body: bool) -> std::result::Result<(), String> {
        let attrs = attributes(e)?;
        let get = |name: &str| attrs.get(name).map(String::as_str);
        match e.name().as_ref() {
            b"key" => {
                let id = get("id").ok_or("<key> without id")?.to_string();
                let domain = get("for").unwrap_or("all");
                match (get("attr.name"), domain) {
                    (Some("label"), "node" | "all") => self.label_keys.push(id),
                    (Some("weight"), "edge" | "all") => self.weight_keys.push(id),
                    _ => {}
                }
            }
            b"graph" => {
                self.directed_default = get("edgedefault") != Some("undirected");
            }
            b"node" => {
                let id = get("id").ok_or("<node> without id")?;
                let node = self.builder.node(id);
                if has_body {
                    self.owner = Some(Owner::Node(node));
                }
            }
            b"edge" => {
                let source = get("source").ok_or("<edge> without source")?;
                let target = get("target").ok_or("<edge> without target")?;
                let directed = match get("directed") {
                    Some("true") => true,
                    Some("false") => false,
                    _ => self.directed_default,
                };
                let s = self.builder.node(source);
                let t = self.builder.node(target);
                let edge = self.builder.edge(s, t, 1.0, directed);
                if has_body {
                    self.owner = Some(Owner::Edge(edge, directed));
                }
            }
            b"data" if has_body => {
                self.data_key = get("key").map(str::to_string);
                self.text.clear();
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_text(&mut self, text: &str) {
        if self.data_key.is_some() {
            self.text.push_str(text);
        }
    }

    fn handle_end(&mut self, name: &[u8]) -> std::result::Result<(), String> {
        match name {
            b"data" => {
                let Some(key) = self.data_key.take() else {
                    return Ok(());
                };
                let value = self.text.trim();
                match self.owner {
                    Some(Owner::Node(node)) if self.label_keys.contains(&key) => {
                        self.builder.relabel(node, value.to_string());
                    }
                    Some(Owner::Edge(edge, directed)) if self.weight_keys.contains(&key) => {
                        let weight = value
                            .parse::<f64>()
                            .map_err(|e| format!("bad edge weight {value:?}: {e}"))?;
                        self.builder.set_weight(edge, weight, directed);
                    }
                    _ => {}
                }
            }
            b"node" | b"edge" => self.owner = None,
            _ => {}
        }
        Ok(())
    }
}

fn attributes(e: &BytesStart<'_>) -> std::result::Result<HashMap<String, String>, String> {
    let mut out = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value().map_err(|e| e.to_string())?;
        out.insert(key, value.to_string());
    }
    Ok(out)
}

/// Parse a GraphML document held in memory.
pub fn parse_graphml(id: impl Into<PathBuf>, xml: &str) -> Result<GraphRecord> {
    let id = id.into();
    let fail = |reason: String| KernelMatrixError::GraphParse {
        path: id.clone(),
        reason,
    };

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);
    let mut parser = GraphmlParser::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => parser.handle_open(e, true).map_err(&fail)?,
            Ok(Event::Empty(ref e)) => parser.handle_open(e, false).map_err(&fail)?,
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|e| fail(e.to_string()))?;
                parser.handle_text(&text);
            }
            Ok(Event::CData(ref e)) => {
                parser.handle_text(&String::from_utf8_lossy(e));
            }
            Ok(Event::End(ref e)) => parser.handle_end(e.name().as_ref()).map_err(&fail)?,
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(fail(format!(
                    "at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
    }

    Ok(parser.builder.finish(id))
}

/// Read and parse a GraphML file.
pub fn read_graphml(path: &Path) -> Result<GraphRecord> {
    let xml = fs::read_to_string(path).map_err(|e| KernelMatrixError::io(path, e))?;
    parse_graphml(path, &xml)
}
