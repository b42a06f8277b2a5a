//! SQL-identifier validation and quoting.
//!
//! Every code path that builds SQL from user- or connector-supplied names
//! routes through here; values are never interpolated, only parameterised.

use sqlflow_parser::error::{Error, Reason, WithErrorInfo};

/// Longest accepted identifier, matching common engine limits.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Reserved words that are never accepted as bare identifiers.
const BLOCKLIST: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TABLE", "FROM", "WHERE",
    "JOIN", "UNION", "GRANT", "REVOKE", "TRUNCATE", "EXEC", "EXECUTE",
];

pub fn is_valid_identifier(name: &str) -> bool {
    validate_identifier(name).is_ok()
}

/// Check that `name` is a safe SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`,
/// bounded length, not reserved, free of quoting and statement
/// meta-characters.
pub fn validate_identifier(name: &str) -> Result<(), Error> {
    let fail = |details: &str| {
        Err(Error::new(Reason::InvalidIdentifier {
            value: name.to_string(),
            details: details.to_string(),
        })
        .push_hint("identifiers may only contain letters, digits and underscores"))
    };

    if name.is_empty() {
        return fail("empty");
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return fail("longer than 128 characters");
    }
    if name.contains("--") {
        return fail("contains `--`");
    }
    for c in name.chars() {
        if c == '\'' || c == '"' || c == ';' {
            return fail("contains a SQL meta-character");
        }
        if c.is_whitespace() {
            return fail("contains whitespace");
        }
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap_or_default();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return fail("must start with a letter or underscore");
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return fail("contains a character outside [A-Za-z0-9_]");
    }
    if BLOCKLIST.contains(&name.to_ascii_uppercase().as_str()) {
        return fail("is a reserved keyword");
    }
    Ok(())
}

/// Always quotes, which also sidesteps engine keyword clashes. Doubles any
/// embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_schema_table(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(table)),
        None => quote_identifier(table),
    }
}

/// Build a `"col" <op> ?` fragment, returning the value for the caller's
/// parameter vector. The value itself never enters the SQL text.
pub fn build_where_eq<V>(column: &str, op: &str, value: V) -> Result<(String, V), Error> {
    validate_identifier(column)?;
    let op = match op {
        "=" | "==" => "=",
        "!=" | "<>" => "<>",
        "<" | "<=" | ">" | ">=" => op,
        other => {
            return Err(Error::new_simple(format!(
                "unsupported comparison operator `{other}`"
            )))
        }
    };
    Ok((format!("{} {} ?", quote_identifier(column), op), value))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("_staging_2024"));
        assert!(is_valid_identifier("CamelCase"));
    }

    #[test]
    fn rejects_injection_attempts() {
        assert!(!is_valid_identifier("users; DROP TABLE t"));
        assert!(!is_valid_identifier("a'b"));
        assert!(!is_valid_identifier("a\"b"));
        assert!(!is_valid_identifier("a--b"));
        assert!(!is_valid_identifier("two words"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1starts_with_digit"));
        assert!(!is_valid_identifier("select"));
        assert!(!is_valid_identifier(&"x".repeat(129)));
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_identifier("plain"), "\"plain\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(
            quote_schema_table(Some("analytics"), "events"),
            "\"analytics\".\"events\""
        );
        assert_eq!(quote_schema_table(None, "events"), "\"events\"");
    }

    #[test]
    fn where_eq_parameterises_the_value() {
        let (fragment, param) = build_where_eq("id", ">", 42).unwrap();
        assert_eq!(fragment, "\"id\" > ?");
        assert_eq!(param, 42);

        build_where_eq("id; DROP", "=", 0).unwrap_err();
        build_where_eq("id", "LIKE", 0).unwrap_err();
    }
}
