//! Build-side CLI: IR module in, policy artifact (+ instrumented IR) out
//!
//! Reads a module in the JSON interchange form produced by the IR
//! reader, extracts one automaton per function, writes the policy
//! artifact, and optionally:
//!
//! - writes the instrumented module back out (`--emit-ir`), with a
//!   marker emission in front of every library-call site;
//! - renders one Graphviz DOT file per function (`--viz-dir`).
//!
//! Per-function extraction failures are reported and skipped; only an
//! unreadable module or bad options abort the run.

#![forbid(unsafe_code)]

use std::{env, fs, path::Path, path::PathBuf};

use anyhow::Context;

use callfence::{
    artifact_digest, extract_module, instrument_module, ExtractOptions, IdMode, Module,
    PolicyArtifact, StartPolicy, DEFAULT_MODULUS,
};

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
        "Usage: extractor --ir <module.json> --artifact <out.json> \
         [--emit-ir <instrumented.json>] [--viz-dir <dir>] \
         [--mod <M>] [--unique] [--entry-start] [--intrinsic-prefix <pfx>]"
    );
    std::process::exit(2);
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "extractor=info,callfence=info".into()))
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = env::args().collect();
    if has_flag(&args, "-h") || has_flag(&args, "--help") {
        usage();
    }

    let ir_path = match parse_flag(&args, "--ir") {
        Some(p) => PathBuf::from(p),
        None => usage(),
    };
    let artifact_path = match parse_flag(&args, "--artifact") {
        Some(p) => PathBuf::from(p),
        None => usage(),
    };

    let modulus = match parse_flag(&args, "--mod") {
        Some(s) => s
            .parse::<u32>()
            .with_context(|| format!("--mod expects a positive integer, got `{s}`"))?,
        None => DEFAULT_MODULUS,
    };
    let id_mode = if has_flag(&args, "--unique") { IdMode::Unique } else { IdMode::Dummy };
    let mut opts = ExtractOptions { modulus, id_mode, ..Default::default() };
    if let Some(prefix) = parse_flag(&args, "--intrinsic-prefix") {
        opts.intrinsic_prefix = prefix;
    }
    if has_flag(&args, "--entry-start") {
        opts.start_policy = StartPolicy::EntryFirstSite;
    }

    let ir_text = fs::read_to_string(&ir_path)
        .with_context(|| format!("reading module {}", ir_path.display()))?;
    let mut module = Module::from_json(&ir_text)
        .with_context(|| format!("parsing module {}", ir_path.display()))?;

    let extraction = extract_module(&module, &opts)?;
    for failure in &extraction.failures {
        eprintln!("warning: {}: {}", failure.function, failure.error);
    }
    let total_sites: usize = extraction.functions.iter().map(|f| f.graph.nodes.len()).sum();
    println!(
        "extracted {} function(s), {} call site(s), {} skipped (mode {}, M={})",
        extraction.functions.len(),
        total_sites,
        extraction.failures.len(),
        id_mode.as_str(),
        modulus,
    );

    let artifact = PolicyArtifact::from_extract(&extraction, modulus, id_mode);
    let text = artifact.to_json_pretty()?;
    fs::write(&artifact_path, &text)
        .with_context(|| format!("writing artifact {}", artifact_path.display()))?;
    println!("artifact : {} ({})", artifact_path.display(), artifact_digest(&text));

    if let Some(dir) = parse_flag(&args, "--viz-dir") {
        let graphs: Vec<_> = extraction.functions.iter().map(|f| f.graph.clone()).collect();
        let paths = callfence::viz::write_dot_dir(&graphs, Path::new(&dir))
            .with_context(|| format!("writing visualisations under {dir}"))?;
        println!("dot files: {} under {dir}", paths.len());
    }

    if let Some(out) = parse_flag(&args, "--emit-ir") {
        let report = instrument_module(&mut module, &opts)?;
        fs::write(&out, module.to_json()?)
            .with_context(|| format!("writing instrumented module {out}"))?;
        println!(
            "instrumented: {} emission(s) in {} function(s) -> {out}",
            report.sites, report.functions_touched,
        );
    }

    Ok(())
}
