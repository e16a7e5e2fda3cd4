//! Module-level IR interchange model
//!
//! The IR reader that lowers a real compiler module into this form is an
//! external collaborator; this crate only needs the shape the extractor
//! and instrumenter walk: functions of basic blocks with successor
//! indices, where calls name their callee and external declarations are
//! listed at module level. The model is serde round-trippable so readers
//! hand modules over as JSON.
//!
//! Instructions that are not calls are carried opaquely (`Inst::Other`)
//! and are never touched by instrumentation.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A source-location hint attached to a call site, preserved onto the
/// marker emission inserted in front of it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A call operand. Marker emissions pass a single `I32`; everything else
/// is opaque symbol text the writer reproduces verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    I32(i32),
    Sym(String),
}

/// A call instruction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInst {
    pub callee: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<SourceLoc>,
}

/// One instruction: a call, or anything else carried opaquely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Inst {
    Call(CallInst),
    Other(String),
}

/// A basic block: ordered instructions plus successor block indices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub label: String,
    #[serde(default)]
    pub insts: Vec<Inst>,
    #[serde(default)]
    pub succs: Vec<usize>,
}

/// A defined function with a body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    pub name: String,
    pub blocks: Vec<Block>,
}

/// A whole module: external declarations plus defined functions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub name: String,
    /// Names of bodiless external declarations; calls into this set are
    /// the library-call candidates.
    #[serde(default)]
    pub declarations: Vec<String>,
    #[serde(default)]
    pub functions: Vec<Function>,
}

/// Errors surfaced when reading or checking a module.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("malformed module JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("function {function}: block {block} successor {succ} out of range ({blocks} blocks)")]
    BadSuccessor {
        function: String,
        block: usize,
        succ: usize,
        blocks: usize,
    },
}

impl Module {
    /// Parse a module from its JSON interchange form and check block
    /// successor indices.
    pub fn from_json(text: &str) -> Result<Module, ModuleError> {
        let m: Module = serde_json::from_str(text)?;
        m.validate()?;
        Ok(m)
    }

    /// Serialize back to the interchange form.
    pub fn to_json(&self) -> Result<String, ModuleError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check that every block successor names a block of its function.
    pub fn validate(&self) -> Result<(), ModuleError> {
        for f in &self.functions {
            for (bi, b) in f.blocks.iter().enumerate() {
                for &s in &b.succs {
                    if s >= f.blocks.len() {
                        return Err(ModuleError::BadSuccessor {
                            function: f.name.clone(),
                            block: bi,
                            succ: s,
                            blocks: f.blocks.len(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// The set of externally declared names, for the library-call filter.
    pub fn declaration_set(&self) -> HashSet<&str> {
        self.declarations.iter().map(String::as_str).collect()
    }

    /// True iff `name` is an external declaration of this module.
    pub fn is_external(&self, name: &str) -> bool {
        self.declarations.iter().any(|d| d == name)
    }

    /// Add a declaration if absent. Idempotent.
    pub fn declare(&mut self, name: &str) {
        if !self.is_external(name) {
            self.declarations.push(name.to_owned());
        }
    }
}
