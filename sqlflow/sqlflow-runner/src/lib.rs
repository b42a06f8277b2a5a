//! # sqlflow-runner
//!
//! Executes compiled SQLFlow plans: an embedded DuckDB engine adapter, a
//! connector framework (CSV, Parquet, PostgreSQL, S3, REST, in-memory) with
//! retry / circuit-breaker / rate-limit resilience, and the cooperative
//! executor that steps a plan's DAG in topological order.
//!
//! ```ignore
//! let plan = sqlflow::compile(source, &profile, &cli_vars)?;
//! let result = sqlflow_runner::run(&plan, &profile, RunOptions::default())?;
//! ```

#![forbid(unsafe_code)]
#![allow(clippy::result_large_err)]

pub mod connectors;
pub mod data;
pub mod engine;
pub mod executor;
pub mod modes;
pub mod resilience;

use sqlflow::ir::plan::Plan;
use sqlflow::profile::Profile;
use sqlflow::ErrorMessages;

use connectors::ConnectorFactory;
pub use connectors::MemoryStore;
pub use executor::{OpStatus, OperationResult, RunOptions, RunResult};
pub use resilience::CancelToken;

use crate::data::Schema;

/// Execute a compiled plan against the profile's engine.
///
/// Per-operation failures are reported inside [RunResult], not as an `Err`;
/// the error return covers failures to start at all (engine locked, bad
/// profile).
pub fn run(plan: &Plan, profile: &Profile, options: RunOptions) -> Result<RunResult, ErrorMessages> {
    let mut executor = executor::Executor::new(profile, options).map_err(ErrorMessages::from)?;
    Ok(executor.run(plan))
}

/// Instantiate a profile connector and report its schema.
pub fn describe_connector(profile: &Profile, name: &str) -> Result<Schema, ErrorMessages> {
    let def = profile.connectors.get(name).ok_or_else(|| {
        ErrorMessages::from(sqlflow::Error::new(sqlflow::Reason::UnknownReference {
            name: name.to_string(),
        }))
    })?;

    let factory = ConnectorFactory::new(MemoryStore::new(), CancelToken::new());
    let mut source = factory
        .source(&def.type_tag, &def.params)
        .map_err(ErrorMessages::from)?;
    source.describe().map_err(ErrorMessages::from)
}
