//! Graphviz DOT rendering of extracted automata
//!
//! One `digraph` per function, suitable for `dot -Tsvg`. Start nodes get
//! a double border, ε edges are dashed, non-ε edges are labeled with the
//! callee name and the dummy/unique match pair. Output is deterministic
//! (nodes and edges render in graph order), so diffs of regenerated
//! visualisations stay readable.

#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::automaton::Graph;

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// File-name-safe rendition of a function name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Render one graph as a DOT string.
pub fn render_dot(graph: &Graph) -> String {
    let starts = graph.start_nodes();
    let mut buf = String::new();
    writeln!(buf, "digraph \"{}\" {{", escape(&graph.function_name)).unwrap();
    writeln!(buf, "    rankdir=LR;").unwrap();
    writeln!(buf, "    node [shape=box, fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();
    for (i, n) in graph.nodes.iter().enumerate() {
        let peripheries = if starts.contains(&i) { 2 } else { 1 };
        writeln!(
            buf,
            "    n{i} [label=\"{} #{}/{}\", peripheries={peripheries}];",
            escape(&n.pretty),
            n.unique_id,
            n.dummy_id,
        )
        .unwrap();
    }
    for e in &graph.edges {
        if e.epsilon {
            writeln!(buf, "    n{} -> n{} [style=dashed, label=\"ϵ\"];", e.src, e.dst).unwrap();
        } else {
            writeln!(
                buf,
                "    n{} -> n{} [label=\"{} ({}/{})\"];",
                e.src,
                e.dst,
                escape(&e.label),
                e.match_unique,
                e.match_dummy,
            )
            .unwrap();
        }
    }
    writeln!(buf, "}}").unwrap();
    buf
}

/// Write one `.dot` file per graph into `dir`, returning the paths.
pub fn write_dot_dir(graphs: &[Graph], dir: &Path) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut paths = Vec::with_capacity(graphs.len());
    for g in graphs {
        let path = dir.join(format!("{}.dot", sanitize(&g.function_name)));
        fs::write(&path, render_dot(g))?;
        paths.push(path);
    }
    Ok(paths)
}
