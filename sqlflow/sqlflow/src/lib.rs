//! # sqlflow
//!
//! Compiler for SQLFlow pipelines. Parses `.sf` files, resolves variables,
//! flattens conditionals and produces a dependency-ordered operation plan
//! for the runner to execute.
//!
//! You probably want to start with the [compile] wrapper function:
//!
//! ```ascii
//!        .sf text
//!
//!   (parse)  │
//!            ▼
//!       statement AST
//!            │
//!   (plan)   │   flatten conditionals, substitute variables,
//!            │   validate identifiers, order the DAG
//!            ▼
//!          Plan
//! ```
//!
//! Execution lives in the `sqlflow-runner` crate.

#![forbid(unsafe_code)]
// Our error type carries several strings; we're a compiler, not a hot loop.
#![allow(clippy::result_large_err)]

use std::collections::BTreeMap;

pub use sqlflow_parser::ast;
pub use sqlflow_parser::error::{Error, Errors, MessageKind, Reason, WithErrorInfo};
pub use sqlflow_parser::span::Span;
pub use sqlflow_parser::variables::parse_variable_ref;

pub use error_message::{ErrorMessage, ErrorMessages, SourceLocation};

pub mod codegen;
mod error_message;
pub mod eval;
pub mod ir;
pub mod parser;
pub mod planner;
pub mod profile;
pub mod safety;
pub mod sources;
#[cfg(test)]
mod test;
pub mod variables;

use ir::plan::Plan;
use profile::Profile;
use sources::SourceFiles;
use variables::VariableResolver;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Compile pipeline text into an executable [Plan].
///
/// `cli_vars` are the highest-priority variable scope; profile variables and
/// the process environment are consulted after them (see
/// [variables::VariableResolver]).
pub fn compile(
    source: &str,
    profile: &Profile,
    cli_vars: &BTreeMap<String, String>,
) -> Result<Plan, ErrorMessages> {
    let vars = VariableResolver::new(cli_vars.clone(), profile.variables.clone());
    compile_with_resolver(source, profile, vars)
}

/// [compile], with a caller-built resolver (tests inject a fixed
/// environment this way).
pub fn compile_with_resolver(
    source: &str,
    profile: &Profile,
    mut vars: VariableResolver,
) -> Result<Plan, ErrorMessages> {
    let sources = SourceFiles::single("pipeline.sf", source);

    parser::parse(source)
        .map_err(ErrorMessages::from)
        .and_then(|stmts| {
            planner::plan(stmts, profile, &mut vars).map_err(ErrorMessages::from)
        })
        .map_err(|e| e.composed(&sources))
}

/// Run the planner's analysis passes without producing a plan: everything
/// `compile` rejects, `validate` rejects too, minus the final DAG ordering.
pub fn validate(
    source: &str,
    profile: &Profile,
    cli_vars: &BTreeMap<String, String>,
) -> Result<(), ErrorMessages> {
    let sources = SourceFiles::single("pipeline.sf", source);
    let mut vars = VariableResolver::new(cli_vars.clone(), profile.variables.clone());

    parser::parse(source)
        .map_err(ErrorMessages::from)
        .and_then(|stmts| {
            planner::check(stmts, profile, &mut vars).map_err(ErrorMessages::from)
        })
        .map_err(|e| e.composed(&sources))
}
