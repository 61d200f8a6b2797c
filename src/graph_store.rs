//! Per-project persistent code-relationship graph
//!
//! The graph is cyclic (mutual calls), so nodes and edges live in two
//! keyed collections referenced by id; traversal is by lookup, which also
//! makes neighbor queries trivial. The whole graph persists as one JSON
//! file written via rename-over-temp after each applied diff.

use crate::error::{EngineError, GraphStoreError};
use crate::relations::{GraphEdge, GraphNode, NodeKind, Relation};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Direction of neighbor traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    Both,
}

/// A neighbor returned by `neighbors`, with the connecting edge label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborHit {
    pub node: GraphNode,
    pub relation: Relation,
    /// true when the edge points from the queried node to this neighbor
    pub outgoing: bool,
}

/// Batched change applied atomically: nodes land before edges so no
/// reader ever observes an edge without both endpoints
#[derive(Debug, Clone, Default)]
pub struct GraphDiff {
    pub add_nodes: Vec<GraphNode>,
    pub add_edges: Vec<GraphEdge>,
    pub remove_nodes: Vec<String>,
    pub remove_edges: Vec<GraphEdge>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GraphData {
    nodes: HashMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
}

/// Persistent directed labeled multigraph for one project
#[derive(Debug)]
pub struct GraphStore {
    path: PathBuf,
    inner: RwLock<GraphData>,
}

impl GraphStore {
    /// Open (or create) the graph file, with a structural check at open
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let data = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                GraphStoreError::OpenFailed(format!("{}: {}", path.display(), e))
            })?;
            let data: GraphData = serde_json::from_str(&content).map_err(|e| {
                GraphStoreError::Corrupted(format!("{}: {}", path.display(), e))
            })?;
            // structural check: every edge endpoint must resolve
            for edge in &data.edges {
                if !data.nodes.contains_key(&edge.source_id)
                    || !data.nodes.contains_key(&edge.target_id)
                {
                    return Err(GraphStoreError::Corrupted(format!(
                        "dangling edge {} -> {}",
                        edge.source_id, edge.target_id
                    ))
                    .into());
                }
            }
            tracing::info!(
                "Opened graph store with {} nodes, {} edges",
                data.nodes.len(),
                data.edges.len()
            );
            data
        } else {
            GraphData::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(data),
        })
    }

    /// Apply a batched diff atomically and persist
    ///
    /// Edge additions whose endpoints are still missing after the node
    /// additions are queued to the end of the pass and dropped with a
    /// warning if they never resolve.
    pub fn apply_diff(&self, diff: GraphDiff) -> Result<(), EngineError> {
        {
            let mut data = self.inner.write().expect("graph store lock poisoned");

            for edge in &diff.remove_edges {
                data.edges.retain(|e| e != edge);
            }
            if !diff.remove_nodes.is_empty() {
                let removed: HashSet<&String> = diff.remove_nodes.iter().collect();
                for node_id in &diff.remove_nodes {
                    data.nodes.remove(node_id);
                }
                data.edges
                    .retain(|e| !removed.contains(&e.source_id) && !removed.contains(&e.target_id));
            }

            for node in diff.add_nodes {
                data.nodes.insert(node.node_id.clone(), node);
            }

            let mut queued = Vec::new();
            for edge in diff.add_edges {
                if data.nodes.contains_key(&edge.source_id)
                    && data.nodes.contains_key(&edge.target_id)
                {
                    if !data.edges.contains(&edge) {
                        data.edges.push(edge);
                    }
                } else {
                    queued.push(edge);
                }
            }
            // flush after all node inserts; anything still unresolved is dropped
            for edge in queued {
                if data.nodes.contains_key(&edge.source_id)
                    && data.nodes.contains_key(&edge.target_id)
                {
                    if !data.edges.contains(&edge) {
                        data.edges.push(edge);
                    }
                } else {
                    tracing::warn!(
                        "Dropping edge with missing endpoint: {} -[{}]-> {}",
                        edge.source_id,
                        edge.relation.as_str(),
                        edge.target_id
                    );
                }
            }
        }
        self.persist()
    }

    /// Remove every node attributed to a file, cascading to incident edges
    /// and pruning external import targets nothing references anymore
    pub fn remove_by_file(&self, relative_path: &str) -> Result<usize, EngineError> {
        let removed = {
            let mut data = self.inner.write().expect("graph store lock poisoned");

            let doomed: HashSet<String> = data
                .nodes
                .values()
                .filter(|n| n.file_path == relative_path)
                .map(|n| n.node_id.clone())
                .collect();
            if doomed.is_empty() {
                return Ok(0);
            }

            for node_id in &doomed {
                data.nodes.remove(node_id);
            }
            data.edges
                .retain(|e| !doomed.contains(&e.source_id) && !doomed.contains(&e.target_id));

            // external modules with no remaining importers are dead weight
            let referenced: HashSet<String> = data
                .edges
                .iter()
                .flat_map(|e| [e.source_id.clone(), e.target_id.clone()])
                .collect();
            data.nodes
                .retain(|id, node| !node.file_path.is_empty() || referenced.contains(id));

            doomed.len()
        };
        self.persist()?;
        Ok(removed)
    }

    pub fn get_node(&self, node_id: &str) -> Option<GraphNode> {
        self.inner
            .read()
            .expect("graph store lock poisoned")
            .nodes
            .get(node_id)
            .cloned()
    }

    /// Neighbors one hop away, optionally restricted by relation labels
    pub fn neighbors(
        &self,
        node_id: &str,
        direction: Direction,
        relations: Option<&[Relation]>,
    ) -> Vec<NeighborHit> {
        let data = self.inner.read().expect("graph store lock poisoned");
        let mut hits = Vec::new();

        for edge in &data.edges {
            if let Some(allowed) = relations
                && !allowed.contains(&edge.relation)
            {
                continue;
            }
            let outgoing_match =
                edge.source_id == node_id && matches!(direction, Direction::Out | Direction::Both);
            let incoming_match =
                edge.target_id == node_id && matches!(direction, Direction::In | Direction::Both);

            if outgoing_match && let Some(node) = data.nodes.get(&edge.target_id) {
                hits.push(NeighborHit {
                    node: node.clone(),
                    relation: edge.relation,
                    outgoing: true,
                });
            }
            if incoming_match && let Some(node) = data.nodes.get(&edge.source_id) {
                hits.push(NeighborHit {
                    node: node.clone(),
                    relation: edge.relation,
                    outgoing: false,
                });
            }
        }
        hits
    }

    /// Case-insensitive substring search over node names and ids
    pub fn search_nodes(&self, substring: &str, kind: Option<NodeKind>) -> Vec<GraphNode> {
        let needle = substring.to_lowercase();
        let data = self.inner.read().expect("graph store lock poisoned");
        let mut matches: Vec<GraphNode> = data
            .nodes
            .values()
            .filter(|n| kind.is_none_or(|k| n.kind == k))
            .filter(|n| {
                n.name.to_lowercase().contains(&needle)
                    || n.node_id.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        matches
    }

    /// Substring search over edges by endpoint id or relation label
    pub fn search_edges(&self, substring: &str) -> Vec<GraphEdge> {
        let needle = substring.to_lowercase();
        let data = self.inner.read().expect("graph store lock poisoned");
        data.edges
            .iter()
            .filter(|e| {
                e.source_id.to_lowercase().contains(&needle)
                    || e.target_id.to_lowercase().contains(&needle)
                    || e.relation.as_str().contains(&needle)
            })
            .cloned()
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().expect("graph store lock poisoned").nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().expect("graph store lock poisoned").edges.len()
    }

    /// Node ids currently attributed to a file; used for relationship diffs
    pub fn node_ids_for_file(&self, relative_path: &str) -> Vec<String> {
        let data = self.inner.read().expect("graph store lock poisoned");
        data.nodes
            .values()
            .filter(|n| n.file_path == relative_path)
            .map(|n| n.node_id.clone())
            .collect()
    }

    fn persist(&self) -> Result<(), EngineError> {
        let persist = || -> Result<()> {
            let data = self.inner.read().expect("graph store lock poisoned");
            let content =
                serde_json::to_string(&*data).context("Failed to serialize graph store")?;
            drop(data);
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).context("Failed to create graph directory")?;
            }
            let tmp = self.path.with_extension("json.tmp");
            fs::write(&tmp, content).context("Failed to write temp graph file")?;
            fs::rename(&tmp, &self.path).context("Failed to rename graph file into place")?;
            Ok(())
        };
        persist().map_err(|e| GraphStoreError::PersistFailed(format!("{:#}", e)).into())
    }
}
