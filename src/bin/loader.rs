//! Privileged-side CLI: artifact → install blob → control path
//!
//! Selects one function of a policy artifact, binds it to a target pid
//! under the requested id-mode, and writes the packed install blob to
//! the enforcement control path (the ingestion point of whatever
//! privileged interception mechanism is deployed). `--dry-run` decodes
//! the blob back, pre-validates it against the engine's install checks,
//! and prints the initial frontier without writing anything.
//!
//! Exit code 0 on success; non-zero on parse, I/O, or validation
//! failure.

#![forbid(unsafe_code)]

use std::{env, fs, path::PathBuf};

use anyhow::Context;

use callfence::engine::{initial_frontier, validate_policy};
use callfence::{artifact_digest, build_install, IdMode, InstallBlob, PolicyArtifact};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn usage() -> ! {
    eprintln!(
        "Usage: loader -p <pid> -j <artifact.json> [-f <function-index>] [--unique] \
         [--ctl <control-path>] [--dry-run]"
    );
    std::process::exit(2);
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "loader=info,callfence=info".into()))
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = env::args().collect();
    if has_flag(&args, "-h") || has_flag(&args, "--help") {
        usage();
    }

    let pid = match parse_flag(&args, "-p") {
        Some(s) => s
            .parse::<u32>()
            .with_context(|| format!("-p expects a pid, got `{s}`"))?,
        None => usage(),
    };
    let artifact_path = match parse_flag(&args, "-j") {
        Some(p) => PathBuf::from(p),
        None => usage(),
    };
    let index = match parse_flag(&args, "-f") {
        Some(s) => s
            .parse::<usize>()
            .with_context(|| format!("-f expects a function index, got `{s}`"))?,
        None => 0,
    };
    let mode = if has_flag(&args, "--unique") { IdMode::Unique } else { IdMode::Dummy };
    let dry_run = has_flag(&args, "--dry-run");
    let ctl = parse_flag(&args, "--ctl");

    if !dry_run && ctl.is_none() {
        return Err(anyhow::anyhow!(
            "no control path: pass --ctl <path> to install, or --dry-run to only validate"
        ));
    }

    let text = fs::read_to_string(&artifact_path)
        .with_context(|| format!("reading artifact {}", artifact_path.display()))?;
    let artifact = PolicyArtifact::parse(&text)
        .with_context(|| format!("parsing artifact {}", artifact_path.display()))?;
    let blob = build_install(&artifact, index, pid, mode)?;

    // Same checks the engine applies on install, so a refusal surfaces
    // here instead of in the privileged context's log.
    validate_policy(blob.num_nodes, &blob.edges)
        .context("policy fails engine install validation")?;

    let function = &artifact.functions[index].function_name;
    println!("artifact : {} ({})", artifact_path.display(), artifact_digest(&text));
    println!(
        "policy   : function [{index}] {function}, {} node(s), {} edge(s), mode {}",
        blob.num_nodes,
        blob.edges.len(),
        mode.as_str(),
    );

    let bytes = blob.encode();
    if dry_run {
        // Decode what we would ship, to exercise the exact wire path.
        let decoded = InstallBlob::decode(&bytes).context("re-decoding install blob")?;
        let start = initial_frontier(decoded.num_nodes, &decoded.edges);
        let states: Vec<usize> = start.iter_set().collect();
        println!("dry-run  : blob {} byte(s) for pid {pid}, initial frontier {states:?}", bytes.len());
        return Ok(());
    }

    let ctl = ctl.ok_or_else(|| anyhow::anyhow!("no control path"))?;
    fs::write(&ctl, &bytes).with_context(|| format!("writing install blob to {ctl}"))?;
    println!("installed: {} byte(s) for pid {pid} via {ctl}", bytes.len());
    Ok(())
}
