//! Marker-emission instrumentation
//!
//! Inserts a call to the externally declared marker function
//! `emit(int32)` immediately *before* every library-call site, carrying
//! the site's identifier under the configured id-mode. The walk and the
//! candidate filter are shared with the extractor, so the argument of
//! the `n`-th emission is exactly the id the artifact recorded for the
//! `n`-th node.
//!
//! The marker declaration is added to the module once if absent. The
//! site's source location is copied onto the inserted call; no other
//! instruction is touched. A site whose immediately preceding
//! instruction is already a marker emission is skipped (the identifier
//! counters still advance), so instrumenting twice changes nothing.

#![forbid(unsafe_code)]

use crate::extract::{for_each_library_call, ExtractError, ExtractOptions, MARKER_SYMBOL};
use crate::ident::IdAssigner;
use crate::ir::{CallInst, Inst, Module, Value};
use crate::MarkerId;

/// What instrumentation did to a module.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstrumentReport {
    /// Emissions inserted.
    pub sites: usize,
    /// Sites skipped because a marker emission already preceded them.
    pub already_marked: usize,
    /// Functions that received at least one emission.
    pub functions_touched: usize,
    /// True if the marker declaration was added by this run.
    pub declared_marker: bool,
}

struct Insertion {
    func: usize,
    block: usize,
    inst: usize,
    marker: MarkerId,
}

fn is_marker_call(inst: &Inst) -> bool {
    matches!(inst, Inst::Call(c) if c.callee == MARKER_SYMBOL)
}

/// Instrument every function of `module` in place.
pub fn instrument_module(
    module: &mut Module,
    opts: &ExtractOptions,
) -> Result<InstrumentReport, ExtractError> {
    if opts.modulus == 0 {
        return Err(ExtractError::BadModulus);
    }
    module.validate()?;

    let mut report = InstrumentReport::default();
    let mut plan: Vec<Insertion> = Vec::new();
    {
        let decls = module.declaration_set();
        for (fi, func) in module.functions.iter().enumerate() {
            let mut assigner = IdAssigner::new(opts.modulus);
            let before = plan.len();
            for_each_library_call(func, &decls, &opts.intrinsic_prefix, |bi, ii, _call| {
                let ids = assigner.next_site();
                if ii > 0 && is_marker_call(&func.blocks[bi].insts[ii - 1]) {
                    report.already_marked += 1;
                    return;
                }
                plan.push(Insertion {
                    func: fi,
                    block: bi,
                    inst: ii,
                    marker: ids.select(opts.id_mode),
                });
            });
            if plan.len() > before {
                report.functions_touched += 1;
            }
        }
    }

    // Apply back-to-front so earlier indices stay valid.
    for ins in plan.iter().rev() {
        let block = &mut module.functions[ins.func].blocks[ins.block];
        let loc = match &block.insts[ins.inst] {
            Inst::Call(c) => c.loc.clone(),
            Inst::Other(_) => None,
        };
        block.insts.insert(
            ins.inst,
            Inst::Call(CallInst {
                callee: MARKER_SYMBOL.to_owned(),
                args: vec![Value::I32(ins.marker)],
                loc,
            }),
        );
    }
    report.sites = plan.len();

    if report.sites > 0 && !module.is_external(MARKER_SYMBOL) {
        module.declare(MARKER_SYMBOL);
        report.declared_marker = true;
    }
    Ok(report)
}
