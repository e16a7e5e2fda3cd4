//! Per-function NFA extraction
//!
//! Walks one function's basic blocks in order and produces the
//! over-approximating library-call automaton:
//!
//! 1. One node per library-call site, identifiers assigned in program
//!    order by [`IdAssigner`].
//! 2. Non-ε edges between consecutive sites of one block, matching on
//!    the *source* site's identifier (markers are emitted before the
//!    call runs, so a site's own id is what moves the automaton past it).
//! 3. ε edges from a block's last site to the first site of every
//!    successor block with calls. Call-free blocks are skipped
//!    transitively — the successor walk carries a visited set, so loops
//!    of empty blocks terminate without losing reachability.
//! 4. A start set per the configured [`StartPolicy`].
//!
//! A call is a *library call* iff its callee is an external declaration
//! whose name neither starts with the intrinsic prefix nor is the marker
//! symbol itself (so re-extracting an instrumented module sees the same
//! sites). The filter is conservative and tunable via
//! [`ExtractOptions::intrinsic_prefix`].
//!
//! Per-function failures are surfaced in the module report and do not
//! abort the other functions; only an unreadable module or bad options
//! abort extraction outright.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::HashSet;

use tracing::warn;

use crate::automaton::{Edge, Graph, GraphError};
use crate::ident::{IdAssigner, IdMode, DEFAULT_MODULUS};
use crate::ir::{CallInst, Function, Inst, Module, ModuleError, SourceLoc};
use crate::MarkerId;

/// Prefix of implementation-reserved intrinsics, excluded from the
/// candidate filter.
pub const DEFAULT_INTRINSIC_PREFIX: &str = "llvm.";

/// The externally declared marker function the instrumenter inserts.
pub const MARKER_SYMBOL: &str = "emit";

/// How the extractor elects a graph's start set.
///
/// The in-degree heuristic can elect several unrelated start nodes in
/// functions whose first block joins from elsewhere in the module; it is
/// exposed as a policy rather than hard-wired. The engine always derives
/// its initial frontier with the in-degree heuristic, so the alternative
/// only affects build-side output (visualisation, debugging).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StartPolicy {
    /// Nodes with zero non-ε in-degree; first node as fallback.
    #[default]
    NonEpsilonIndegreeZero,
    /// The first site of the first block that has any site.
    EntryFirstSite,
}

/// Extraction configuration.
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    /// Dummy-id modulus `M`.
    pub modulus: u32,
    /// Identifier mode the instrumented program will emit under.
    pub id_mode: IdMode,
    /// Intrinsic name prefix excluded by the candidate filter.
    pub intrinsic_prefix: String,
    /// Start-set election policy.
    pub start_policy: StartPolicy,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            modulus: DEFAULT_MODULUS,
            id_mode: IdMode::Dummy,
            intrinsic_prefix: DEFAULT_INTRINSIC_PREFIX.to_owned(),
            start_policy: StartPolicy::default(),
        }
    }
}

impl ExtractOptions {
    fn validate(&self) -> Result<(), ExtractError> {
        if self.modulus == 0 {
            return Err(ExtractError::BadModulus);
        }
        Ok(())
    }
}

/// Errors surfaced by extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("modulus must be positive")]
    BadModulus,
    #[error(transparent)]
    Module(#[from] ModuleError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// One assigned call site, in program order (debugging record for the
/// artifact).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSiteRecord {
    pub name: String,
    pub unique_id: MarkerId,
    pub dummy_id: MarkerId,
    pub reset_count: u32,
    pub loc: Option<SourceLoc>,
}

/// Extraction output for one function.
#[derive(Clone, Debug)]
pub struct FunctionExtract {
    pub graph: Graph,
    pub calls_in_order: Vec<CallSiteRecord>,
    /// Start set under the configured policy.
    pub start_set: Vec<usize>,
}

/// Extraction output for a whole module. Failed functions are reported,
/// not fatal.
#[derive(Debug, Default)]
pub struct ModuleExtract {
    pub functions: Vec<FunctionExtract>,
    pub failures: Vec<FunctionFailure>,
}

/// A per-function extraction failure.
#[derive(Debug)]
pub struct FunctionFailure {
    pub function: String,
    pub error: ExtractError,
}

/// The candidate filter: external declaration, not an intrinsic, not the
/// marker symbol.
pub fn is_library_call(decls: &HashSet<&str>, callee: &str, intrinsic_prefix: &str) -> bool {
    decls.contains(callee) && !callee.starts_with(intrinsic_prefix) && callee != MARKER_SYMBOL
}

/// Visit every library-call site of `func` in program order. Shared by
/// the extractor and the instrumenter so their identifier assignment
/// agrees without threading node tables between the passes.
pub(crate) fn for_each_library_call<'m>(
    func: &'m Function,
    decls: &HashSet<&str>,
    intrinsic_prefix: &str,
    mut visit: impl FnMut(usize, usize, &'m CallInst),
) {
    for (bi, block) in func.blocks.iter().enumerate() {
        for (ii, inst) in block.insts.iter().enumerate() {
            if let Inst::Call(call) = inst {
                if is_library_call(decls, &call.callee, intrinsic_prefix) {
                    visit(bi, ii, call);
                }
            }
        }
    }
}

/// Extract one function's automaton.
pub fn extract_function(
    func: &Function,
    decls: &HashSet<&str>,
    opts: &ExtractOptions,
) -> Result<FunctionExtract, ExtractError> {
    opts.validate()?;
    for (bi, b) in func.blocks.iter().enumerate() {
        for &s in &b.succs {
            if s >= func.blocks.len() {
                return Err(ModuleError::BadSuccessor {
                    function: func.name.clone(),
                    block: bi,
                    succ: s,
                    blocks: func.blocks.len(),
                }
                .into());
            }
        }
    }

    let mut graph = Graph::new(&func.name);
    let mut assigner = IdAssigner::new(opts.modulus);
    let mut calls_in_order = Vec::new();
    let mut block_sites: Vec<Vec<usize>> = vec![Vec::new(); func.blocks.len()];

    for_each_library_call(func, decls, &opts.intrinsic_prefix, |bi, _ii, call| {
        let idx = graph.add_node(&call.callee);
        let ids = assigner.next_site();
        graph.nodes[idx].dummy_id = ids.dummy_id;
        graph.nodes[idx].unique_id = ids.unique_id;
        block_sites[bi].push(idx);
        calls_in_order.push(CallSiteRecord {
            name: call.callee.clone(),
            unique_id: ids.unique_id,
            dummy_id: ids.dummy_id,
            reset_count: ids.reset_count,
            loc: call.loc.clone(),
        });
    });

    // Consecutive sites within a block: the edge out of a site matches
    // that site's own identifier.
    for sites in &block_sites {
        for w in sites.windows(2) {
            let (a, b) = (w[0], w[1]);
            let (label, md, mu) = {
                let n = &graph.nodes[a];
                (n.pretty.clone(), n.dummy_id, n.unique_id)
            };
            graph.edges.push(Edge::call(a, b, &label, md, mu));
        }
    }

    // Last site of each block to the first site of every transitively
    // reachable successor with sites. Call-free blocks are traversed,
    // never materialised.
    let mut linked: HashSet<(usize, usize)> = HashSet::new();
    for (bi, block) in func.blocks.iter().enumerate() {
        let from = match block_sites[bi].last() {
            Some(&n) => n,
            None => continue,
        };
        let mut stack: Vec<usize> = block.succs.clone();
        let mut visited: HashSet<usize> = HashSet::new();
        while let Some(s) = stack.pop() {
            if !visited.insert(s) {
                continue;
            }
            match block_sites[s].first() {
                Some(&to) => {
                    if linked.insert((from, to)) {
                        graph.edges.push(Edge::epsilon(from, to));
                    }
                }
                None => stack.extend(func.blocks[s].succs.iter().copied()),
            }
        }
    }

    graph.validate()?;

    let start_set = match opts.start_policy {
        StartPolicy::NonEpsilonIndegreeZero => graph.start_nodes(),
        StartPolicy::EntryFirstSite => block_sites
            .iter()
            .find_map(|s| s.first().copied())
            .map(|n| vec![n])
            .unwrap_or_default(),
    };

    Ok(FunctionExtract { graph, calls_in_order, start_set })
}

/// Extract every function of `module`. Bad options abort; individual
/// function failures (e.g. a malformed block graph) are collected and
/// logged, and the remaining functions still extract.
pub fn extract_module(module: &Module, opts: &ExtractOptions) -> Result<ModuleExtract, ExtractError> {
    opts.validate()?;

    let decls = module.declaration_set();
    let mut out = ModuleExtract::default();
    for func in &module.functions {
        match extract_function(func, &decls, opts) {
            Ok(fx) => out.functions.push(fx),
            Err(error) => {
                warn!(function = %func.name, %error, "extraction failed, skipping function");
                out.failures.push(FunctionFailure { function: func.name.clone(), error });
            }
        }
    }
    Ok(out)
}
