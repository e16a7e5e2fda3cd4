//! Enforcement engine (per-process frontier table)
//!
//! The privileged half of the sandbox. An [`Engine`] owns the map from
//! pid to installed policy and advances one NFA frontier per observed
//! marker. The engine is an explicit object with explicit teardown, not
//! a process-wide singleton; the host obtains it through a handle.
//!
//! ## Locking discipline
//!
//! A reader-writer lock guards the read-mostly pid map; each policy
//! carries its own mutex protecting its frontier. `install`/`uninstall`
//! take the map lock exclusively; `observe` takes it shared, then the
//! per-policy lock for the duration of step + ε-closure + empty check.
//! Observe calls for different pids therefore run in parallel; within
//! one pid they serialise, matching the interception adapter's
//! synchronous-delivery contract.
//!
//! ## Fast-path allocation
//!
//! `observe` never allocates: the scratch bitset lives inside the
//! process policy and is swapped with the live frontier after each
//! step, so an allocation failure can never leave a frontier
//! indeterminate.
//!
//! ## Violations
//!
//! An empty frontier is terminal. The engine logs a violation record
//! and, under [`Enforcement::Kill`], delivers SIGKILL to the offending
//! process. The policy stays installed — every further observation for
//! that pid keeps failing until process exit or explicit uninstall
//! removes the entry. Observations for pids with no installed policy
//! are silently ignored (the process is unsandboxed).

#![forbid(unsafe_code)]

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::automaton::{epsilon_close, step_into, Frontier, StepEdge};
use crate::ident::IdMode;
use crate::loader::InstallBlob;
use crate::signal;
use crate::{MarkerId, Pid};

/// Sanity cap on edges per installed policy.
pub const MAX_EDGES: usize = 1 << 20;

/// Sanity cap on nodes per installed policy.
pub const MAX_NODES: u32 = 1 << 20;

/// What the engine does when a frontier empties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enforcement {
    /// Deliver SIGKILL to the violating process.
    Kill,
    /// Log the violation only (permissive mode).
    Monitor,
}

/// Why an install was refused. A refused install leaves any previously
/// installed policy for the pid intact.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// Policies over zero nodes are meaningless to enforce.
    #[error("policy has zero nodes")]
    ZeroNodes,
    /// Node count exceeds the sanity cap.
    #[error("policy has {count} nodes (cap {cap})")]
    TooManyNodes {
        /// Declared node count.
        count: u32,
        /// The cap it exceeded.
        cap: u32,
    },
    /// Edge count exceeds the sanity cap.
    #[error("policy has {count} edges (cap {cap})")]
    TooManyEdges {
        /// Offered edge count.
        count: usize,
        /// The cap it exceeded.
        cap: usize,
    },
    /// An edge endpoint does not name a node.
    #[error("edge {index} endpoint out of range: {src} -> {dst} with {nodes} nodes")]
    EdgeOutOfRange {
        /// Index of the offending edge.
        index: usize,
        /// Edge source.
        src: u32,
        /// Edge destination.
        dst: u32,
        /// Declared node count.
        nodes: u32,
    },
}

/// Result of one observation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// No policy installed for this pid; the event was ignored.
    NoPolicy,
    /// The frontier advanced and is non-empty.
    Advanced {
        /// Active states after the step.
        active: usize,
    },
    /// The frontier emptied; the process was killed (or the violation
    /// logged, in monitor mode).
    Violation,
}

/// A recorded policy violation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// Offending process.
    pub pid: Pid,
    /// The marker that emptied the frontier.
    pub observed: MarkerId,
    /// Ordinal of the fatal observation within this policy's lifetime
    /// (1-based).
    pub ordinal: u64,
}

/// Per-process binding of one automaton to one pid.
struct ProcessPolicy {
    pid: Pid,
    id_mode: IdMode,
    num_nodes: u32,
    edges: Vec<StepEdge>,
    frontier: Frontier,
    scratch: Frontier,
    observed: u64,
}

/// Validate install inputs against the engine's caps.
pub fn validate_policy(num_nodes: u32, edges: &[StepEdge]) -> Result<(), InstallError> {
    if num_nodes == 0 {
        return Err(InstallError::ZeroNodes);
    }
    if num_nodes > MAX_NODES {
        return Err(InstallError::TooManyNodes { count: num_nodes, cap: MAX_NODES });
    }
    if edges.len() > MAX_EDGES {
        return Err(InstallError::TooManyEdges { count: edges.len(), cap: MAX_EDGES });
    }
    for (index, e) in edges.iter().enumerate() {
        if e.src >= num_nodes || e.dst >= num_nodes {
            return Err(InstallError::EdgeOutOfRange {
                index,
                src: e.src,
                dst: e.dst,
                nodes: num_nodes,
            });
        }
    }
    Ok(())
}

/// The initial frontier for a policy: every node with zero non-ε
/// in-degree (node 0 if that elects nothing), ε-closed. Computed here —
/// not by the loader — so there is exactly one source of truth.
pub fn initial_frontier(num_nodes: u32, edges: &[StepEdge]) -> Frontier {
    let mut f = Frontier::new(num_nodes as usize);
    let mut has_call_in = vec![false; num_nodes as usize];
    for e in edges {
        if !e.epsilon {
            has_call_in[e.dst as usize] = true;
        }
    }
    let mut any = false;
    for (i, &covered) in has_call_in.iter().enumerate() {
        if !covered {
            f.set(i);
            any = true;
        }
    }
    if !any && num_nodes > 0 {
        f.set(0);
    }
    epsilon_close(edges, &mut f);
    f
}

/// The pid → policy table plus enforcement configuration.
pub struct Engine {
    policies: RwLock<HashMap<Pid, Mutex<ProcessPolicy>>>,
    enforcement: Enforcement,
    violations: Mutex<ViolationLog>,
}

#[derive(Default)]
struct ViolationLog {
    total: u64,
    last_by_pid: HashMap<Pid, Violation>,
}

impl Engine {
    /// Fresh engine with the given enforcement mode.
    pub fn new(enforcement: Enforcement) -> Self {
        Engine {
            policies: RwLock::new(HashMap::new()),
            enforcement,
            violations: Mutex::new(ViolationLog::default()),
        }
    }

    /// Install a policy for `pid`, atomically replacing any prior one.
    ///
    /// Validation happens before the table is touched: a refused install
    /// leaves the previous policy (if any) running.
    pub fn install(
        &self,
        pid: Pid,
        id_mode: IdMode,
        num_nodes: u32,
        edges: Vec<StepEdge>,
    ) -> Result<(), InstallError> {
        validate_policy(num_nodes, &edges)?;
        let frontier = initial_frontier(num_nodes, &edges);
        let scratch = Frontier::new(num_nodes as usize);
        let policy = ProcessPolicy {
            pid,
            id_mode,
            num_nodes,
            edges,
            frontier,
            scratch,
            observed: 0,
        };
        let replaced = self
            .policies
            .write()
            .insert(pid, Mutex::new(policy))
            .is_some();
        info!(pid, ?id_mode, num_nodes, replaced, "policy installed");
        Ok(())
    }

    /// Convenience: install a decoded wire blob.
    pub fn install_blob(&self, blob: InstallBlob) -> Result<(), InstallError> {
        self.install(blob.pid, blob.id_mode, blob.num_nodes, blob.edges)
    }

    /// Advance `pid`'s frontier by one observed marker.
    pub fn observe(&self, pid: Pid, observed: MarkerId) -> ObserveOutcome {
        let map = self.policies.read();
        let Some(slot) = map.get(&pid) else {
            // Unsandboxed process; spurious observations are ignored.
            debug!(pid, observed, "observation for pid without policy");
            return ObserveOutcome::NoPolicy;
        };
        let mut p = slot.lock();
        debug_assert_eq!(p.pid, pid);
        p.observed += 1;
        let ProcessPolicy { edges, frontier, scratch, .. } = &mut *p;
        step_into(edges, frontier, observed, scratch);
        std::mem::swap(frontier, scratch);
        if p.frontier.is_empty() {
            let violation = Violation { pid, observed, ordinal: p.observed };
            warn!(pid, observed, ordinal = p.observed, "policy violation, frontier empty");
            {
                let mut log = self.violations.lock();
                log.total += 1;
                log.last_by_pid.insert(pid, violation);
            }
            if self.enforcement == Enforcement::Kill {
                if let Err(e) = signal::kill_process(pid) {
                    error!(pid, %e, "failed to deliver SIGKILL");
                }
            }
            ObserveOutcome::Violation
        } else {
            ObserveOutcome::Advanced { active: p.frontier.count() }
        }
    }

    /// Drop `pid`'s policy. Returns false if none was installed.
    pub fn uninstall(&self, pid: Pid) -> bool {
        let removed = self.policies.write().remove(&pid).is_some();
        if removed {
            info!(pid, "policy uninstalled");
        }
        removed
    }

    /// Explicit teardown: drop every installed policy.
    pub fn clear(&self) {
        self.policies.write().clear();
    }

    /// Number of installed policies.
    pub fn policy_count(&self) -> usize {
        self.policies.read().len()
    }

    /// Active automaton states for `pid`, for diagnostics.
    pub fn active_states(&self, pid: Pid) -> Option<Vec<usize>> {
        let map = self.policies.read();
        let p = map.get(&pid)?.lock();
        debug_assert_eq!(p.frontier.width(), p.num_nodes as usize);
        Some(p.frontier.iter_set().collect())
    }

    /// The id-mode `pid`'s policy enforces, if one is installed.
    pub fn policy_mode(&self, pid: Pid) -> Option<IdMode> {
        let map = self.policies.read();
        let p = map.get(&pid)?.lock();
        Some(p.id_mode)
    }

    /// Total violations observed since construction.
    pub fn violation_count(&self) -> u64 {
        self.violations.lock().total
    }

    /// The most recent violation recorded for `pid`, if any.
    pub fn last_violation(&self, pid: Pid) -> Option<Violation> {
        self.violations.lock().last_by_pid.get(&pid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::PolicyArtifact;
    use crate::automaton::NO_MATCH;
    use crate::loader::build_install;

    fn eps(src: u32, dst: u32) -> StepEdge {
        StepEdge { src, dst, match_id: NO_MATCH, epsilon: true }
    }

    fn call(src: u32, dst: u32, id: MarkerId) -> StepEdge {
        StepEdge { src, dst, match_id: id, epsilon: false }
    }

    fn engine() -> Engine {
        Engine::new(Enforcement::Monitor)
    }

    #[test]
    fn linear_sequence_accepts_then_violates() {
        // open/read/close: nodes 0,1,2; 0->1 on 0, 1->2 on 1.
        let e = engine();
        e.install(100, IdMode::Dummy, 3, vec![call(0, 1, 0), call(1, 2, 1)]).unwrap();
        assert_eq!(e.active_states(100), Some(vec![0]));
        assert!(matches!(e.observe(100, 0), ObserveOutcome::Advanced { active: 1 }));
        assert!(matches!(e.observe(100, 1), ObserveOutcome::Advanced { active: 1 }));
        // Node 2 has no out-edge; observing again empties the frontier.
        assert_eq!(e.observe(100, 2), ObserveOutcome::Violation);
        assert_eq!(e.violation_count(), 1);
        let v = e.last_violation(100).unwrap();
        assert_eq!((v.pid, v.observed, v.ordinal), (100, 2, 3));
    }

    #[test]
    fn epsilon_only_graphs_activate_everything_then_die() {
        // Nodes 0=open, 1=read, 2=write with ε edges 0->1 and 0->2: the
        // shape a branch extracts to. Every node has zero non-ε
        // in-degree, so the whole graph is live from the start; but no
        // non-ε edge exists to consume any marker, so the first
        // observation is fatal. This is the over-approximation's
        // documented false-positive corner, not a bug.
        let e = engine();
        e.install(7, IdMode::Dummy, 3, vec![eps(0, 1), eps(0, 2)]).unwrap();
        assert_eq!(e.active_states(7), Some(vec![0, 1, 2]));
        assert_eq!(e.observe(7, 0), ObserveOutcome::Violation);
    }

    #[test]
    fn leaving_a_node_consumes_its_own_id() {
        // open(id 0) branching to read/write: the transition out of a
        // site fires on that site's own identifier, observed while the
        // site is active.
        let e = engine();
        e.install(
            8,
            IdMode::Dummy,
            3,
            vec![call(0, 1, 0), call(0, 2, 0)],
        )
        .unwrap();
        assert_eq!(e.active_states(8), Some(vec![0]));
        // Observing 0 (open's own id) leaves open's node for both arms.
        assert!(matches!(e.observe(8, 0), ObserveOutcome::Advanced { active: 2 }));
        // read/write have no out-edges; their ids no longer match anything.
        assert_eq!(e.observe(8, 1), ObserveOutcome::Violation);
    }

    #[test]
    fn unknown_marker_is_a_violation() {
        let e = engine();
        e.install(3, IdMode::Dummy, 1, vec![]).unwrap();
        assert_eq!(e.observe(3, 99), ObserveOutcome::Violation);
    }

    #[test]
    fn no_policy_means_no_op() {
        let e = engine();
        assert_eq!(e.observe(555, 0), ObserveOutcome::NoPolicy);
        assert_eq!(e.violation_count(), 0);
    }

    #[test]
    fn reinstall_replaces_the_old_policy() {
        // Policy A accepts 1,2; policy B accepts 9. After replacing A
        // with B, A's accepted sequence violates.
        let e = engine();
        e.install(42, IdMode::Dummy, 2, vec![call(0, 1, 1)]).unwrap();
        e.install(42, IdMode::Dummy, 2, vec![call(0, 1, 9)]).unwrap();
        assert_eq!(e.policy_count(), 1);
        assert_eq!(e.observe(42, 1), ObserveOutcome::Violation);
    }

    #[test]
    fn dummy_collision_accepts_either_site_unique_does_not() {
        // Two sites share dummy_id 5 (counters 5 and 205, M=200) but
        // have unique ids 6 and 206. Under dummy mode a marker of 5
        // reaches both successors; under unique mode only its own.
        let dummy = engine();
        dummy
            .install(1, IdMode::Dummy, 3, vec![call(0, 1, 5), call(0, 2, 5)])
            .unwrap();
        assert!(matches!(dummy.observe(1, 5), ObserveOutcome::Advanced { active: 2 }));

        let unique = engine();
        unique
            .install(1, IdMode::Unique, 3, vec![call(0, 1, 6), call(0, 2, 206)])
            .unwrap();
        assert_eq!(unique.policy_mode(1), Some(IdMode::Unique));
        assert!(matches!(unique.observe(1, 6), ObserveOutcome::Advanced { active: 1 }));
    }

    #[test]
    fn violating_policy_stays_installed_and_keeps_failing() {
        let e = engine();
        e.install(11, IdMode::Dummy, 2, vec![call(0, 1, 0)]).unwrap();
        assert_eq!(e.observe(11, 9), ObserveOutcome::Violation);
        // Still installed; still failing.
        assert_eq!(e.policy_count(), 1);
        assert_eq!(e.observe(11, 0), ObserveOutcome::Violation);
        assert_eq!(e.violation_count(), 2);
        // Exit notification removes it.
        assert!(e.uninstall(11));
        assert_eq!(e.observe(11, 0), ObserveOutcome::NoPolicy);
    }

    #[test]
    fn install_validation_refuses_bad_policies() {
        let e = engine();
        assert!(matches!(
            e.install(1, IdMode::Dummy, 0, vec![]),
            Err(InstallError::ZeroNodes)
        ));
        assert!(matches!(
            e.install(1, IdMode::Dummy, 2, vec![call(0, 5, 0)]),
            Err(InstallError::EdgeOutOfRange { index: 0, dst: 5, .. })
        ));
        assert!(matches!(
            e.install(1, IdMode::Dummy, MAX_NODES + 1, vec![]),
            Err(InstallError::TooManyNodes { .. })
        ));
    }

    #[test]
    fn failed_install_leaves_the_previous_policy_running() {
        let e = engine();
        e.install(5, IdMode::Dummy, 2, vec![call(0, 1, 3)]).unwrap();
        assert!(e.install(5, IdMode::Dummy, 2, vec![call(0, 9, 0)]).is_err());
        // The original policy still advances on its accepted marker.
        assert!(matches!(e.observe(5, 3), ObserveOutcome::Advanced { .. }));
    }

    #[test]
    fn frontier_stays_epsilon_closed_after_every_step() {
        // 0 -(id 1)-> 1 -ε-> 2 -ε-> 3
        let e = engine();
        e.install(77, IdMode::Dummy, 4, vec![call(0, 1, 1), eps(1, 2), eps(2, 3)])
            .unwrap();
        assert!(matches!(e.observe(77, 1), ObserveOutcome::Advanced { active: 3 }));
        assert_eq!(e.active_states(77), Some(vec![1, 2, 3]));
    }

    #[test]
    fn observations_for_different_pids_run_in_parallel() {
        use std::sync::Arc;
        use std::thread;

        // Self-loop policies accept any number of identical markers, so
        // two threads can hammer their own pids without violations. The
        // map lock is only taken shared on this path; a deadlock or a
        // cross-pid mixup would fail the final counts.
        let e = Arc::new(engine());
        for pid in [1u32, 2] {
            e.install(pid, IdMode::Dummy, 1, vec![call(0, 0, 0)]).unwrap();
        }
        let mut handles = Vec::new();
        for pid in [1u32, 2] {
            let e = Arc::clone(&e);
            handles.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    assert!(matches!(e.observe(pid, 0), ObserveOutcome::Advanced { .. }));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(e.violation_count(), 0);
        e.clear();
        assert_eq!(e.policy_count(), 0);
    }

    #[test]
    fn end_to_end_artifact_to_engine() {
        // Full pipeline: artifact text -> loader -> wire bytes -> engine.
        let text = r#"{
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
        let artifact = PolicyArtifact::parse(text).unwrap();
        let blob = build_install(&artifact, 0, 2000, IdMode::Dummy).unwrap();
        let bytes = blob.encode();
        let decoded = crate::loader::InstallBlob::decode(&bytes).unwrap();

        let e = engine();
        e.install_blob(decoded).unwrap();
        assert!(matches!(e.observe(2000, 0), ObserveOutcome::Advanced { .. }));
        assert!(matches!(e.observe(2000, 1), ObserveOutcome::Advanced { .. }));
        assert_eq!(e.observe(2000, 2), ObserveOutcome::Violation);
    }
}
