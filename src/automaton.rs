//! Call automaton model (nodes, labeled edges, frontier bitset)
//!
//! This module holds the pure data structures shared by the build side
//! (extraction, artifact) and the run side (engine): per-function NFA
//! graphs over library-call sites, and the dense bitset frontier the
//! engine advances on every observed marker.
//!
//! ## Invariants
//!
//! - **Dense indices.** Nodes are identified by their index into
//!   `Graph::nodes`; edges are index pairs. There are no owning
//!   references between nodes, so cyclic automata are representable
//!   without ceremony.
//! - **Append-only edges.** Edges are only ever pushed; `Graph::validate`
//!   checks the whole edge list against the node count.
//! - **Source-id matching.** A non-ε edge out of node `n` matches on
//!   *`n`'s own* identifier. Markers are emitted immediately *before*
//!   the call executes, so the transition out of a site fires when that
//!   site's id is observed while the site is active. An automaton that
//!   matched on the destination id would accept the wrong language.
//! - **ε-closure is a fixed point.** `epsilon_close` only ever adds bits
//!   and is bounded by the node count, so it terminates; it is idempotent
//!   and monotone (`F ⊆ closure(F)`, `closure(closure(F)) == closure(F)`).
//! - **The empty frontier is terminal.** No step can repopulate an
//!   all-zero frontier; the engine treats it as a violation.

#![forbid(unsafe_code)]

use crate::ident::IdMode;
use crate::MarkerId;

/// Sentinel for "no match id" — carried by ε edges in both artifact
/// match fields, and by nodes before identifier assignment.
pub const NO_MATCH: MarkerId = -1;

/// Distinguished edge label marking an ε transition in the artifact.
pub const EPSILON_LABEL: &str = "ϵ";

// ============================================================================
// Nodes and edges
// ============================================================================

/// A library-call site.
///
/// `pretty` is the callee name and is informational only; matching is
/// done on the assigned identifiers. Both identifiers are non-negative
/// once assigned; [`NO_MATCH`] is permitted only transiently during
/// extraction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Callee name (informational).
    pub pretty: String,
    /// Identifier assigned modulo the extraction modulus `M`.
    pub dummy_id: MarkerId,
    /// Monotone per-function identifier, contiguous from 1.
    pub unique_id: MarkerId,
}

impl Node {
    /// True once both identifiers have been assigned.
    #[inline]
    pub fn is_assigned(&self) -> bool {
        self.dummy_id >= 0 && self.unique_id >= 0
    }
}

/// A directed labeled transition between two node indices of one graph.
///
/// Build-side edges carry *both* match identifiers so a single artifact
/// can be enforced under either id-mode; [`Edge::match_id`] projects the
/// one selected at load time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edge {
    /// Source node index.
    pub src: usize,
    /// Destination node index.
    pub dst: usize,
    /// Informational label: the source site's callee name, or
    /// [`EPSILON_LABEL`].
    pub label: String,
    /// Dummy-mode match id (`-1` for ε edges).
    pub match_dummy: MarkerId,
    /// Unique-mode match id (`-1` for ε edges).
    pub match_unique: MarkerId,
    /// ε edges fire whenever their source is active, consuming no input.
    pub epsilon: bool,
}

impl Edge {
    /// Non-ε edge out of `src`, matching on `src`'s own identifiers.
    pub fn call(src: usize, dst: usize, label: &str, match_dummy: MarkerId, match_unique: MarkerId) -> Self {
        Edge {
            src,
            dst,
            label: label.to_owned(),
            match_dummy,
            match_unique,
            epsilon: false,
        }
    }

    /// ε edge from `src` to `dst`.
    pub fn epsilon(src: usize, dst: usize) -> Self {
        Edge {
            src,
            dst,
            label: EPSILON_LABEL.to_owned(),
            match_dummy: NO_MATCH,
            match_unique: NO_MATCH,
            epsilon: true,
        }
    }

    /// The match id under the selected mode (`-1` for ε edges).
    #[inline]
    pub fn match_id(&self, mode: IdMode) -> MarkerId {
        match mode {
            IdMode::Dummy => self.match_dummy,
            IdMode::Unique => self.match_unique,
        }
    }
}

/// The engine-side view of an edge: the wire quadruple.
///
/// Produced by the loader (which projects a build-side [`Edge`] under
/// one id-mode) and consumed by `step`/`epsilon_close`. For ε edges
/// `match_id` is unspecified and ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepEdge {
    /// Source node index.
    pub src: u32,
    /// Destination node index.
    pub dst: u32,
    /// Selected match id (ignored when `epsilon`).
    pub match_id: MarkerId,
    /// ε flag.
    pub epsilon: bool,
}

// ============================================================================
// Graph
// ============================================================================

/// Errors surfaced by graph validation.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// An edge endpoint does not name a node of this graph.
    #[error("edge {index} endpoint out of range: {src} -> {dst} with {nodes} nodes")]
    EdgeOutOfRange {
        /// Index of the offending edge.
        index: usize,
        /// Edge source.
        src: usize,
        /// Edge destination.
        dst: usize,
        /// Node count of the graph.
        nodes: usize,
    },
    /// A node escaped extraction without assigned identifiers.
    #[error("node {index} ({pretty}) has unassigned identifiers")]
    UnassignedNode {
        /// Index of the offending node.
        index: usize,
        /// Its callee name.
        pretty: String,
    },
    /// A non-ε edge carries a negative match id.
    #[error("edge {index} is not ε but carries match ids ({dummy}, {unique})")]
    BadMatchId {
        /// Index of the offending edge.
        index: usize,
        /// Its dummy match id.
        dummy: MarkerId,
        /// Its unique match id.
        unique: MarkerId,
    },
}

/// One function's over-approximating library-call NFA.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Graph {
    /// Name of the function this automaton was extracted from.
    pub function_name: String,
    /// Call-site nodes, in program order.
    pub nodes: Vec<Node>,
    /// Append-only edge list.
    pub edges: Vec<Edge>,
}

impl Graph {
    /// Empty graph for `function_name`.
    pub fn new(function_name: &str) -> Self {
        Graph {
            function_name: function_name.to_owned(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Append a node with unassigned identifiers; returns its index.
    pub fn add_node(&mut self, pretty: &str) -> usize {
        self.nodes.push(Node {
            pretty: pretty.to_owned(),
            dummy_id: NO_MATCH,
            unique_id: NO_MATCH,
        });
        self.nodes.len() - 1
    }

    /// Check every edge endpoint, every node assignment, and the
    /// ε ↔ match-id correspondence.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (index, n) in self.nodes.iter().enumerate() {
            if !n.is_assigned() {
                return Err(GraphError::UnassignedNode {
                    index,
                    pretty: n.pretty.clone(),
                });
            }
        }
        for (index, e) in self.edges.iter().enumerate() {
            if e.src >= self.nodes.len() || e.dst >= self.nodes.len() {
                return Err(GraphError::EdgeOutOfRange {
                    index,
                    src: e.src,
                    dst: e.dst,
                    nodes: self.nodes.len(),
                });
            }
            if !e.epsilon && (e.match_dummy < 0 || e.match_unique < 0) {
                return Err(GraphError::BadMatchId {
                    index,
                    dummy: e.match_dummy,
                    unique: e.match_unique,
                });
            }
        }
        Ok(())
    }

    /// Derived start set: nodes with zero *non-ε* in-degree.
    ///
    /// A node reachable only through ε is entered via closure of some
    /// other start node, so ε in-edges do not disqualify. If the
    /// heuristic elects nothing (single-site functions, call cycles
    /// covering every node), the first node is the fallback.
    pub fn start_nodes(&self) -> Vec<usize> {
        let mut has_call_in = vec![false; self.nodes.len()];
        for e in &self.edges {
            if !e.epsilon && e.dst < has_call_in.len() {
                has_call_in[e.dst] = true;
            }
        }
        let starts: Vec<usize> = (0..self.nodes.len()).filter(|&i| !has_call_in[i]).collect();
        if starts.is_empty() && !self.nodes.is_empty() {
            return vec![0];
        }
        starts
    }

    /// Project the edge list under one id-mode into engine-side edges.
    pub fn step_edges(&self, mode: IdMode) -> Vec<StepEdge> {
        self.edges
            .iter()
            .map(|e| StepEdge {
                src: e.src as u32,
                dst: e.dst as u32,
                match_id: e.match_id(mode),
                epsilon: e.epsilon,
            })
            .collect()
    }
}

// ============================================================================
// Frontier
// ============================================================================

/// Per-process run-time state: a bitset over one graph's nodes.
///
/// Width is fixed at construction and always equals the owning policy's
/// node count. All mutating operations are allocation-free.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frontier {
    bits: Vec<u64>,
    width: usize,
}

impl Frontier {
    /// All-zero frontier over `width` nodes.
    pub fn new(width: usize) -> Self {
        Frontier {
            bits: vec![0u64; width.div_ceil(64)],
            width,
        }
    }

    /// Number of nodes this frontier ranges over.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Set bit `i`. Out-of-range indices are a logic error upstream.
    #[inline]
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.width, "frontier index {i} out of width {}", self.width);
        self.bits[i / 64] |= 1u64 << (i % 64);
    }

    /// Test bit `i`.
    #[inline]
    pub fn test(&self, i: usize) -> bool {
        debug_assert!(i < self.width, "frontier index {i} out of width {}", self.width);
        self.bits[i / 64] & (1u64 << (i % 64)) != 0
    }

    /// Zero every bit.
    #[inline]
    pub fn clear(&mut self) {
        for w in &mut self.bits {
            *w = 0;
        }
    }

    /// True iff no bit is set. An empty frontier is terminal.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Number of active states.
    #[inline]
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Indices of the active states, ascending.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.width).filter(move |&i| self.test(i))
    }

    /// True iff every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &Frontier) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .all(|(a, b)| a & !b == 0)
    }
}

// ============================================================================
// Step operations
// ============================================================================

/// Extend `frontier` to its ε-closure over `edges`, in place.
///
/// Repeatedly unions `e.dst` for every ε edge whose source is active
/// until a fixed point. The frontier only grows and is bounded by its
/// width, so the loop terminates.
pub fn epsilon_close(edges: &[StepEdge], frontier: &mut Frontier) {
    loop {
        let mut changed = false;
        for e in edges {
            if e.epsilon && frontier.test(e.src as usize) && !frontier.test(e.dst as usize) {
                frontier.set(e.dst as usize);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

/// Advance `cur` by one observed marker into `next` (pre-sized scratch).
///
/// `next` receives every `e.dst` for each non-ε edge with `e.src ∈ cur`
/// and `e.match_id == observed`, then is ε-closed. If no edge matches,
/// `next` ends up empty — the terminal violation state. Reads `cur` and
/// `edges` only; never allocates.
pub fn step_into(edges: &[StepEdge], cur: &Frontier, observed: MarkerId, next: &mut Frontier) {
    debug_assert_eq!(cur.width(), next.width());
    next.clear();
    for e in edges {
        if !e.epsilon && e.match_id == observed && cur.test(e.src as usize) {
            next.set(e.dst as usize);
        }
    }
    epsilon_close(edges, next);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn eps(src: u32, dst: u32) -> StepEdge {
        StepEdge { src, dst, match_id: NO_MATCH, epsilon: true }
    }

    fn call(src: u32, dst: u32, id: MarkerId) -> StepEdge {
        StepEdge { src, dst, match_id: id, epsilon: false }
    }

    fn frontier_of(width: usize, set: &[usize]) -> Frontier {
        let mut f = Frontier::new(width);
        for &i in set {
            f.set(i);
        }
        f
    }

    #[test]
    fn closure_follows_epsilon_chains() {
        // 0 -ε-> 1 -ε-> 2, 3 isolated
        let edges = [eps(0, 1), eps(1, 2)];
        let mut f = frontier_of(4, &[0]);
        epsilon_close(&edges, &mut f);
        assert_eq!(f.iter_set().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn closure_is_idempotent_and_monotone() {
        let edges = [eps(0, 1), eps(1, 3), eps(2, 0), call(3, 2, 7)];
        let before = frontier_of(4, &[2]);
        let mut once = before.clone();
        epsilon_close(&edges, &mut once);
        // Monotone: F ⊆ closure(F)
        assert!(before.is_subset_of(&once));
        // Idempotent: closure(closure(F)) == closure(F)
        let mut twice = once.clone();
        epsilon_close(&edges, &mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn closure_laws_hold_on_random_graphs() {
        let mut rng = StdRng::seed_from_u64(0xCA11F3);
        for _ in 0..64 {
            let width = rng.gen_range(1..24usize);
            let mut edges = Vec::new();
            for _ in 0..rng.gen_range(0..40usize) {
                let src = rng.gen_range(0..width) as u32;
                let dst = rng.gen_range(0..width) as u32;
                if rng.gen_bool(0.5) {
                    edges.push(eps(src, dst));
                } else {
                    edges.push(call(src, dst, rng.gen_range(0..8)));
                }
            }
            let mut f = Frontier::new(width);
            for i in 0..width {
                if rng.gen_bool(0.3) {
                    f.set(i);
                }
            }
            let mut once = f.clone();
            epsilon_close(&edges, &mut once);
            assert!(f.is_subset_of(&once));
            let mut twice = once.clone();
            epsilon_close(&edges, &mut twice);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn step_matches_on_source_id_then_closes() {
        // 0 -(id 5)-> 1, 1 -ε-> 2
        let edges = [call(0, 1, 5), eps(1, 2)];
        let cur = frontier_of(3, &[0]);
        let mut next = Frontier::new(3);
        step_into(&edges, &cur, 5, &mut next);
        assert_eq!(next.iter_set().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn step_with_no_matching_edge_empties_the_frontier() {
        let edges = [call(0, 1, 5)];
        let cur = frontier_of(2, &[0]);
        let mut next = Frontier::new(2);
        step_into(&edges, &cur, 6, &mut next);
        assert!(next.is_empty());
        // Terminal: stepping an empty frontier stays empty.
        let empty = next.clone();
        step_into(&edges, &empty, 5, &mut next);
        assert!(next.is_empty());
    }

    #[test]
    fn start_nodes_ignore_epsilon_in_edges() {
        let mut g = Graph::new("f");
        let a = g.add_node("open");
        let b = g.add_node("read");
        let c = g.add_node("write");
        for (i, n) in g.nodes.iter_mut().enumerate() {
            n.dummy_id = i as MarkerId;
            n.unique_id = i as MarkerId + 1;
        }
        g.edges.push(Edge::epsilon(a, b));
        g.edges.push(Edge::call(b, c, "read", 1, 2));
        g.validate().unwrap();
        // b has only an ε in-edge, so it still qualifies; c does not.
        assert_eq!(g.start_nodes(), vec![a, b]);
    }

    #[test]
    fn start_nodes_fall_back_to_first_node() {
        let mut g = Graph::new("loop");
        let a = g.add_node("recv");
        let b = g.add_node("send");
        g.nodes[0].dummy_id = 0;
        g.nodes[0].unique_id = 1;
        g.nodes[1].dummy_id = 1;
        g.nodes[1].unique_id = 2;
        // a -> b -> a: every node has a non-ε in-edge.
        g.edges.push(Edge::call(a, b, "recv", 0, 1));
        g.edges.push(Edge::call(b, a, "send", 1, 2));
        assert_eq!(g.start_nodes(), vec![0]);
    }

    #[test]
    fn validate_rejects_dangling_edges_and_unassigned_nodes() {
        let mut g = Graph::new("f");
        let a = g.add_node("open");
        assert!(matches!(g.validate(), Err(GraphError::UnassignedNode { index: 0, .. })));
        g.nodes[0].dummy_id = 0;
        g.nodes[0].unique_id = 1;
        g.edges.push(Edge::call(a, 9, "open", 0, 1));
        assert!(matches!(g.validate(), Err(GraphError::EdgeOutOfRange { index: 0, .. })));
    }
}
