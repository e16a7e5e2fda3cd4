//! Crate root: public surface, core aliases, and system-wide invariants
//!
//! `callfence` is a per-process library-call sandbox in two halves:
//!
//! - **Build side.** [`extract`] derives an over-approximating NFA of
//!   library-call sites from a module's IR; [`instrument`] inserts a
//!   marker emission in front of every site; [`artifact`] serialises the
//!   automata into a portable, self-describing policy document.
//! - **Run side.** [`loader`] turns one function of an artifact into a
//!   packed install blob; [`engine`] indexes installed policies by pid
//!   and advances the corresponding frontier on every marker event
//!   surfaced by [`intercept`]. A process whose marker sequence no
//!   automaton path accepts is terminated.
//!
//! ## Invariants (system-wide)
//!
//! - **Over-approximation.** The automaton accepts every marker
//!   sequence the program can emit, and possibly more; enforcement errs
//!   toward acceptance wherever the static analysis is imprecise.
//! - **Source-id matching.** Markers are emitted immediately *before*
//!   the guarded call, so the transition out of a site matches that
//!   site's *own* identifier. See [`automaton`] for why the opposite
//!   convention accepts the wrong language.
//! - **Closed frontiers.** After installation and after every step, a
//!   frontier is ε-closed; the all-zero frontier is terminal.
//! - **One source of truth for start sets.** Only the engine derives
//!   initial frontiers from installed edges; the loader never ships one.
//!
//! The IR reader that produces [`ir::Module`] values, the privileged
//! mechanism that observes marker emissions, and the in-process emit
//! stub are external collaborators; this crate defines their seams.

#![deny(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Policy artifact: portable textual (JSON) form of extracted automata.
pub mod artifact;
/// Automaton model: nodes, edges, graphs, frontier bitset, step/closure.
pub mod automaton;
/// Enforcement engine: pid → policy table, install/observe/uninstall.
pub mod engine;
/// Per-function NFA extraction from module IR.
pub mod extract;
/// Call-site identifier assignment (dummy/unique modes).
pub mod ident;
/// Marker-emission instrumentation of module IR.
pub mod instrument;
/// Interception event surface (packed records, source trait, pump).
pub mod intercept;
/// IR interchange model (the seam to the external IR reader).
pub mod ir;
/// Artifact → packed install blob.
pub mod loader;
/// Lethal-signal delivery (the crate's only unsafe code).
pub mod signal;
/// Graphviz DOT rendering of extracted automata.
pub mod viz;

/// Process identifier as seen by the enforcement engine's privileged
/// context.
pub type Pid = u32;

/// The 32-bit marker value a program passes to the emit stub.
pub type MarkerId = i32;

// Re-export the types that cross module seams, so downstream code can
// import from the crate root.
pub use artifact::{ArtifactError, FunctionPolicy, PolicyArtifact};
pub use automaton::{Edge, Frontier, Graph, Node, StepEdge, EPSILON_LABEL, NO_MATCH};
pub use engine::{Enforcement, Engine, InstallError, ObserveOutcome, Violation};
pub use extract::{
    extract_function, extract_module, ExtractError, ExtractOptions, FunctionExtract,
    ModuleExtract, StartPolicy, DEFAULT_INTRINSIC_PREFIX, MARKER_SYMBOL,
};
pub use ident::{IdAssigner, IdMode, SiteIds, DEFAULT_MODULUS};
pub use instrument::{instrument_module, InstrumentReport};
pub use intercept::{pump, Event, EventSource, PumpStats, RecordReader};
pub use ir::Module;
pub use loader::{artifact_digest, build_install, InstallBlob, LoadError, WireError};
