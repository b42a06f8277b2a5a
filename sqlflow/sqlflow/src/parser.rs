use sqlflow_parser::ast::Stmt;
use sqlflow_parser::error::Errors;

use crate::sources::PIPELINE_SOURCE_ID;

/// Parse pipeline text into the statement AST.
pub fn parse(source: &str) -> Result<Vec<Stmt>, Errors> {
    let stmts = sqlflow_parser::parse_source(source, PIPELINE_SOURCE_ID).map_err(Errors)?;
    log::debug!("parsed {} top-level statements", stmts.len());
    Ok(stmts)
}
