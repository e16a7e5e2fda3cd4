//! Policy artifact (portable textual form)
//!
//! The artifact is a self-describing JSON document: a sequence of
//! per-function automata, each carrying the modulus, the id-mode tag,
//! the ordered call records (debugging aid), the node arrays, and the
//! edge list with *both* match identifiers. An engine consuming it needs
//! nothing else to reconstruct any one graph.
//!
//! ε edges are encoded with the distinguished label `"ϵ"` and `-1` in
//! both match fields; [`PolicyArtifact::validate`] enforces the
//! correspondence in both directions. Parsing then re-serialising an
//! artifact preserves semantic equality (field-for-field, not
//! byte-for-byte).

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::automaton::{Edge, Graph, GraphError, EPSILON_LABEL, NO_MATCH};
use crate::extract::{FunctionExtract, ModuleExtract};
use crate::ident::IdMode;
use crate::MarkerId;

/// One call record of `callsInOrder`, with an optional
/// `"file:line"` source hint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub name: String,
    pub unique_id: MarkerId,
    pub dummy_id: MarkerId,
    pub reset_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<String>,
}

/// One edge of the artifact. `label` is the source site's callee name or
/// [`EPSILON_LABEL`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEdge {
    pub src: usize,
    pub dst: usize,
    pub label: String,
    pub match_dummy: MarkerId,
    pub match_unique: MarkerId,
}

/// One function's serialised automaton.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionPolicy {
    pub function_name: String,
    #[serde(rename = "mod")]
    pub modulus: u32,
    pub id_mode: IdMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls_in_order: Vec<CallRecord>,
    pub node_labels: Vec<String>,
    #[serde(rename = "nodeDummyIDs")]
    pub node_dummy_ids: Vec<MarkerId>,
    #[serde(rename = "nodeUniqueIDs")]
    pub node_unique_ids: Vec<MarkerId>,
    pub edges: Vec<ArtifactEdge>,
}

/// The whole artifact: every function of one module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyArtifact {
    pub functions: Vec<FunctionPolicy>,
}

/// Errors surfaced when parsing or validating an artifact.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("malformed artifact JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("function {function}: node arrays disagree (labels {labels}, dummy {dummies}, unique {uniques})")]
    NodeArrays {
        function: String,
        labels: usize,
        dummies: usize,
        uniques: usize,
    },
    #[error("function {function}: edge {index} endpoint out of range ({src} -> {dst}, {nodes} nodes)")]
    EdgeOutOfRange {
        function: String,
        index: usize,
        src: usize,
        dst: usize,
        nodes: usize,
    },
    #[error("function {function}: edge {index} breaks the ϵ law (label {label:?}, matchDummy {dummy}, matchUnique {unique})")]
    EpsilonMismatch {
        function: String,
        index: usize,
        label: String,
        dummy: MarkerId,
        unique: MarkerId,
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl FunctionPolicy {
    /// Serialise one extraction result.
    pub fn from_extract(fx: &FunctionExtract, modulus: u32, id_mode: IdMode) -> Self {
        let g = &fx.graph;
        FunctionPolicy {
            function_name: g.function_name.clone(),
            modulus,
            id_mode,
            calls_in_order: fx
                .calls_in_order
                .iter()
                .map(|c| CallRecord {
                    name: c.name.clone(),
                    unique_id: c.unique_id,
                    dummy_id: c.dummy_id,
                    reset_count: c.reset_count,
                    loc: c.loc.as_ref().map(|l| l.to_string()),
                })
                .collect(),
            node_labels: g.nodes.iter().map(|n| n.pretty.clone()).collect(),
            node_dummy_ids: g.nodes.iter().map(|n| n.dummy_id).collect(),
            node_unique_ids: g.nodes.iter().map(|n| n.unique_id).collect(),
            edges: g
                .edges
                .iter()
                .map(|e| ArtifactEdge {
                    src: e.src,
                    dst: e.dst,
                    label: e.label.clone(),
                    match_dummy: e.match_dummy,
                    match_unique: e.match_unique,
                })
                .collect(),
        }
    }

    /// Node count of this function's automaton.
    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.node_labels.len()
    }

    /// Check node-array agreement, edge ranges, and the ϵ law.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        let nodes = self.node_labels.len();
        if self.node_dummy_ids.len() != nodes || self.node_unique_ids.len() != nodes {
            return Err(ArtifactError::NodeArrays {
                function: self.function_name.clone(),
                labels: nodes,
                dummies: self.node_dummy_ids.len(),
                uniques: self.node_unique_ids.len(),
            });
        }
        for (index, e) in self.edges.iter().enumerate() {
            if e.src >= nodes || e.dst >= nodes {
                return Err(ArtifactError::EdgeOutOfRange {
                    function: self.function_name.clone(),
                    index,
                    src: e.src,
                    dst: e.dst,
                    nodes,
                });
            }
            let is_eps = e.label == EPSILON_LABEL;
            let no_match = e.match_dummy == NO_MATCH && e.match_unique == NO_MATCH;
            let any_negative = e.match_dummy < 0 || e.match_unique < 0;
            if is_eps != no_match || (!is_eps && any_negative) {
                return Err(ArtifactError::EpsilonMismatch {
                    function: self.function_name.clone(),
                    index,
                    label: e.label.clone(),
                    dummy: e.match_dummy,
                    unique: e.match_unique,
                });
            }
        }
        Ok(())
    }

    /// Reconstruct the build-side graph this policy serialises.
    pub fn to_graph(&self) -> Result<Graph, ArtifactError> {
        self.validate()?;
        let mut g = Graph::new(&self.function_name);
        for (i, label) in self.node_labels.iter().enumerate() {
            let idx = g.add_node(label);
            g.nodes[idx].dummy_id = self.node_dummy_ids[i];
            g.nodes[idx].unique_id = self.node_unique_ids[i];
        }
        for e in &self.edges {
            if e.label == EPSILON_LABEL {
                g.edges.push(Edge::epsilon(e.src, e.dst));
            } else {
                g.edges.push(Edge::call(e.src, e.dst, &e.label, e.match_dummy, e.match_unique));
            }
        }
        g.validate()?;
        Ok(g)
    }
}

impl PolicyArtifact {
    /// Serialise a whole module extraction.
    pub fn from_extract(mx: &ModuleExtract, modulus: u32, id_mode: IdMode) -> Self {
        PolicyArtifact {
            functions: mx
                .functions
                .iter()
                .map(|fx| FunctionPolicy::from_extract(fx, modulus, id_mode))
                .collect(),
        }
    }

    /// Parse and validate the textual artifact.
    pub fn parse(text: &str) -> Result<PolicyArtifact, ArtifactError> {
        let a: PolicyArtifact = serde_json::from_str(text)?;
        a.validate()?;
        Ok(a)
    }

    /// Render the portable textual form.
    pub fn to_json_pretty(&self) -> Result<String, ArtifactError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate every function.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        for f in &self.functions {
            f.validate()?;
        }
        Ok(())
    }
}
