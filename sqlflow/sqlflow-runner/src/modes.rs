//! Load-mode SQL generation and schema-compatibility pre-flight.
//!
//! All SQL produced here is assembled exclusively from identifiers that have
//! passed validation, quoted; never from values.

use sqlflow::safety::{quote_identifier, validate_identifier};
use sqlflow::{Error, Reason, WithErrorInfo};

use crate::data::Schema;

/// Every source column must exist in the target with an equal or wider type.
/// Runs before any write (a failing load leaves the target untouched).
pub fn check_compatibility(source: &Schema, target: &Schema) -> Result<(), Error> {
    for column in &source.columns {
        let Some(target_column) = target.column(&column.name) else {
            return Err(Error::new(Reason::SchemaIncompatible {
                column: column.name.clone(),
                source_type: column.data_type.to_string(),
                target_type: "(missing)".to_string(),
            })
            .push_hint("add the column to the target table or drop it from the source"));
        };
        if !column.data_type.widens_to(target_column.data_type) {
            return Err(Error::new(Reason::SchemaIncompatible {
                column: column.name.clone(),
                source_type: column.data_type.to_string(),
                target_type: target_column.data_type.to_string(),
            })
            .push_hint("the source type must equal or widen to the target type"));
        }
    }
    Ok(())
}

pub fn check_merge_keys(
    keys: &[String],
    source: &Schema,
    target: &Schema,
    target_name: &str,
) -> Result<(), Error> {
    if keys.is_empty() {
        return Err(
            Error::new_simple("MERGE and UPSERT require at least one merge key")
                .push_hint("add `MERGE_KEYS (…)` to the LOAD statement"),
        );
    }
    for key in keys {
        validate_identifier(key)?;
        if source.column(key).is_none() {
            return Err(Error::new(Reason::MissingMergeKey {
                key: key.clone(),
                table: "the source".to_string(),
            }));
        }
        if target.column(key).is_none() {
            return Err(Error::new(Reason::MissingMergeKey {
                key: key.clone(),
                table: target_name.to_string(),
            }));
        }
    }
    Ok(())
}

pub fn replace_sql(target: &str, staging: &str) -> String {
    format!(
        "CREATE OR REPLACE TABLE {} AS SELECT * FROM {};",
        quote_identifier(target),
        quote_identifier(staging)
    )
}

/// Insert only the source's columns, so a narrower source appends into a
/// wider target.
pub fn append_sql(target: &str, staging: &str, source: &Schema) -> String {
    let columns = source
        .columns
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) SELECT {} FROM {};",
        quote_identifier(target),
        columns,
        columns,
        quote_identifier(staging)
    )
}

/// Update matching rows, then insert the rest. Two statements, run inside
/// the load's transaction.
pub fn merge_sql(target: &str, staging: &str, source: &Schema, keys: &[String]) -> Vec<String> {
    let t = quote_identifier(target);
    let s = quote_identifier(staging);

    let key_match = keys
        .iter()
        .map(|k| {
            format!(
                "{t}.{key} = {s}.{key}",
                key = quote_identifier(k)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    let mut statements = Vec::new();

    let updates = source
        .columns
        .iter()
        .filter(|c| !keys.contains(&c.name))
        .map(|c| {
            format!(
                "{col} = {s}.{col}",
                col = quote_identifier(&c.name)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    if !updates.is_empty() {
        statements.push(format!(
            "UPDATE {t} SET {updates} FROM {s} WHERE {key_match};"
        ));
    }

    let columns = source
        .columns
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    statements.push(format!(
        "INSERT INTO {t} ({columns}) SELECT {columns} FROM {s} \
         WHERE NOT EXISTS (SELECT 1 FROM {t} WHERE {key_match});"
    ));

    statements
}
