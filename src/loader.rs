//! Policy loading: artifact → packed install blob
//!
//! The privileged side does not parse JSON; it ingests a packed,
//! little-endian blob:
//!
//! ```text
//! header  { pid: u32, num_nodes: u32, num_edges: u32, id_mode: u32 }
//! edges   num_edges × { src: u32, dst: u32, match_id: i32, is_epsilon: u8 }
//! ```
//!
//! The loader selects one function of a parsed artifact, projects every
//! edge under the requested id-mode (ε edges carry `-1`, which the
//! engine ignores), and encodes. Start-set computation is left entirely
//! to the engine so there is a single source of truth for the initial
//! frontier.
//!
//! A zero-site function is materialised as one inert node with no
//! edges: the engine's fallback start is node 0, and the first observed
//! marker empties the frontier. That is the documented semantic of
//! loading an empty policy — any marker kills.
//!
//! Decoding is strict: the byte length must match the header exactly,
//! and unknown mode tags or ε flags are refused.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use crate::artifact::{ArtifactError, PolicyArtifact};
use crate::automaton::StepEdge;
use crate::ident::IdMode;
use crate::Pid;

/// Install blob header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Packed edge record length in bytes.
pub const EDGE_RECORD_LEN: usize = 13;

/// Errors surfaced while turning an artifact into an install blob.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("artifact has {count} functions, index {index} is out of range")]
    FunctionIndex { index: usize, count: usize },
}

/// Errors surfaced while decoding a packed install blob.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("install blob truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("install blob carries {extra} trailing bytes")]
    TrailingBytes { extra: usize },
    #[error("unknown id-mode tag {0}")]
    BadIdMode(u32),
    #[error("edge {index} carries ε flag {value} (want 0 or 1)")]
    BadEpsilonFlag { index: usize, value: u8 },
}

/// One function's policy, bound to a target process, ready for the
/// engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallBlob {
    pub pid: Pid,
    pub id_mode: IdMode,
    pub num_nodes: u32,
    pub edges: Vec<StepEdge>,
}

/// Select function `index` of `artifact` and bind it to `pid` under
/// `mode`.
pub fn build_install(
    artifact: &PolicyArtifact,
    index: usize,
    pid: Pid,
    mode: IdMode,
) -> Result<InstallBlob, LoadError> {
    let count = artifact.functions.len();
    let fp = artifact
        .functions
        .get(index)
        .ok_or(LoadError::FunctionIndex { index, count })?;
    let graph = fp.to_graph()?;
    let edges = graph.step_edges(mode);
    // Inert-node padding keeps the engine's num_nodes > 0 validation and
    // the kill-on-any-marker semantic of empty policies compatible.
    let num_nodes = graph.nodes.len().max(1) as u32;
    Ok(InstallBlob { pid, id_mode: mode, num_nodes, edges })
}

#[inline]
fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

#[inline]
fn i32_at(b: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

impl InstallBlob {
    /// Encode the packed little-endian wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + EDGE_RECORD_LEN * self.edges.len());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.num_nodes.to_le_bytes());
        out.extend_from_slice(&(self.edges.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.id_mode.wire().to_le_bytes());
        for e in &self.edges {
            out.extend_from_slice(&e.src.to_le_bytes());
            out.extend_from_slice(&e.dst.to_le_bytes());
            out.extend_from_slice(&e.match_id.to_le_bytes());
            out.push(u8::from(e.epsilon));
        }
        out
    }

    /// Decode and strictly validate the wire form.
    pub fn decode(bytes: &[u8]) -> Result<InstallBlob, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated { need: HEADER_LEN, have: bytes.len() });
        }
        let pid = u32_at(bytes, 0);
        let num_nodes = u32_at(bytes, 4);
        let num_edges = u32_at(bytes, 8) as usize;
        let mode_tag = u32_at(bytes, 12);

        let need = HEADER_LEN + num_edges * EDGE_RECORD_LEN;
        if bytes.len() < need {
            return Err(WireError::Truncated { need, have: bytes.len() });
        }
        if bytes.len() > need {
            return Err(WireError::TrailingBytes { extra: bytes.len() - need });
        }
        let id_mode = IdMode::from_wire(mode_tag).ok_or(WireError::BadIdMode(mode_tag))?;

        let mut edges = Vec::with_capacity(num_edges);
        for index in 0..num_edges {
            let off = HEADER_LEN + index * EDGE_RECORD_LEN;
            let eps = bytes[off + 12];
            if eps > 1 {
                return Err(WireError::BadEpsilonFlag { index, value: eps });
            }
            edges.push(StepEdge {
                src: u32_at(bytes, off),
                dst: u32_at(bytes, off + 4),
                match_id: i32_at(bytes, off + 8),
                epsilon: eps == 1,
            });
        }
        Ok(InstallBlob { pid, id_mode, num_nodes, edges })
    }
}

/// Short BLAKE3 digest of the artifact text, for operator diagnostics:
/// extractor and loader print it so both ends can confirm they are
/// looking at the same policy bytes.
pub fn artifact_digest(text: &str) -> String {
    let hash = blake3::hash(text.as_bytes());
    hex::encode(&hash.as_bytes()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::PolicyArtifact;
    use crate::automaton::NO_MATCH;

    const LINEAR: &str = r#"{
        "functions": [{
            "functionName": "f",
            "mod": 200,
            "idMode": "dummy",
            "nodeLabels": ["open", "read", "close"],
            "nodeDummyIDs": [0, 1, 2],
            "nodeUniqueIDs": [1, 2, 3],
            "edges": [
                {"src": 0, "dst": 1, "label": "open", "matchDummy": 0, "matchUnique": 1},
                {"src": 1, "dst": 2, "label": "read", "matchDummy": 1, "matchUnique": 2}
            ]
        }]
    }"#;

    #[test]
    fn blob_round_trips_through_the_wire_form() {
        let artifact = PolicyArtifact::parse(LINEAR).unwrap();
        let blob = build_install(&artifact, 0, 4242, IdMode::Dummy).unwrap();
        let bytes = blob.encode();
        assert_eq!(bytes.len(), HEADER_LEN + 2 * EDGE_RECORD_LEN);
        let back = InstallBlob::decode(&bytes).unwrap();
        assert_eq!(blob, back);
        assert_eq!(back.pid, 4242);
        assert_eq!(back.num_nodes, 3);
    }

    #[test]
    fn mode_selects_the_match_ids() {
        let artifact = PolicyArtifact::parse(LINEAR).unwrap();
        let dummy = build_install(&artifact, 0, 1, IdMode::Dummy).unwrap();
        let unique = build_install(&artifact, 0, 1, IdMode::Unique).unwrap();
        assert_eq!(dummy.edges[0].match_id, 0);
        assert_eq!(unique.edges[0].match_id, 1);
        assert_eq!(dummy.edges[1].match_id, 1);
        assert_eq!(unique.edges[1].match_id, 2);
    }

    #[test]
    fn whitespace_does_not_change_the_blob() {
        let artifact = PolicyArtifact::parse(LINEAR).unwrap();
        let squeezed: String = LINEAR.split_whitespace().collect::<Vec<_>>().join(" ");
        let artifact2 = PolicyArtifact::parse(&squeezed).unwrap();
        let a = build_install(&artifact, 0, 7, IdMode::Unique).unwrap().encode();
        let b = build_install(&artifact2, 0, 7, IdMode::Unique).unwrap().encode();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_site_function_becomes_one_inert_node() {
        let text = r#"{"functions": [{"functionName": "noop", "mod": 200, "idMode": "dummy",
            "nodeLabels": [], "nodeDummyIDs": [], "nodeUniqueIDs": [], "edges": []}]}"#;
        let artifact = PolicyArtifact::parse(text).unwrap();
        let blob = build_install(&artifact, 0, 9, IdMode::Dummy).unwrap();
        assert_eq!(blob.num_nodes, 1);
        assert!(blob.edges.is_empty());
    }

    #[test]
    fn epsilon_edges_carry_no_match_on_the_wire() {
        let text = r#"{"functions": [{"functionName": "f", "mod": 200, "idMode": "dummy",
            "nodeLabels": ["open", "read"], "nodeDummyIDs": [0, 1], "nodeUniqueIDs": [1, 2],
            "edges": [{"src": 0, "dst": 1, "label": "ϵ", "matchDummy": -1, "matchUnique": -1}]}]}"#;
        let artifact = PolicyArtifact::parse(text).unwrap();
        let blob = build_install(&artifact, 0, 1, IdMode::Unique).unwrap();
        assert!(blob.edges[0].epsilon);
        assert_eq!(blob.edges[0].match_id, NO_MATCH);
    }

    #[test]
    fn bad_function_index_is_reported_with_the_count() {
        let artifact = PolicyArtifact::parse(LINEAR).unwrap();
        assert!(matches!(
            build_install(&artifact, 3, 1, IdMode::Dummy),
            Err(LoadError::FunctionIndex { index: 3, count: 1 })
        ));
    }

    #[test]
    fn decode_refuses_malformed_blobs() {
        let artifact = PolicyArtifact::parse(LINEAR).unwrap();
        let blob = build_install(&artifact, 0, 1, IdMode::Dummy).unwrap();
        let bytes = blob.encode();

        assert!(matches!(
            InstallBlob::decode(&bytes[..10]),
            Err(WireError::Truncated { .. })
        ));

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(matches!(
            InstallBlob::decode(&trailing),
            Err(WireError::TrailingBytes { extra: 1 })
        ));

        let mut bad_mode = bytes.clone();
        bad_mode[12] = 9;
        assert!(matches!(InstallBlob::decode(&bad_mode), Err(WireError::BadIdMode(9))));

        let mut bad_eps = bytes;
        bad_eps[HEADER_LEN + 12] = 7;
        assert!(matches!(
            InstallBlob::decode(&bad_eps),
            Err(WireError::BadEpsilonFlag { index: 0, value: 7 })
        ));
    }

    #[test]
    fn digest_is_stable_and_short() {
        let d1 = artifact_digest(LINEAR);
        let d2 = artifact_digest(LINEAR);
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 16);
        assert_ne!(artifact_digest("{}"), d1);
    }
}
