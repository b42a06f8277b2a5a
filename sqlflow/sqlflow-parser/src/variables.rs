//! Parsing of `${name}` / `${name|default}` references.
//!
//! This is the single implementation of the reference syntax: the statement
//! parser calls it for `${…}` tokens, and the compiler's substitution engine
//! calls it for references found inside string templates.

use chumsky::{error::Cheap, prelude::*};

use crate::ast::VariableExpr;
use crate::error::{Error, Reason};
use crate::lexer::quoted_string;

/// Parse the text between `${` and `}` into a [VariableExpr].
///
/// Defaults containing whitespace must be quoted (`${r|"us east"}`); nested
/// references (`${a_${b}}`) are unsupported by design.
pub fn parse_variable_ref(raw: &str) -> Result<VariableExpr, Error> {
    if raw.contains("${") {
        return Err(Error::new_simple(format!(
            "nested variable references are not supported: `${{{raw}}}`"
        )));
    }

    match parser().parse(raw.trim()) {
        Ok((name, default)) => Ok(VariableExpr {
            raw: raw.to_string(),
            name,
            default,
        }),
        Err(_) => {
            if let Some((_, default)) = raw.split_once('|') {
                let default = default.trim();
                let quoted = default.len() >= 2
                    && (default.starts_with('"') && default.ends_with('"')
                        || default.starts_with('\'') && default.ends_with('\''));
                if !quoted && default.chars().any(char::is_whitespace) {
                    return Err(Error::new(Reason::QuotedWhitespaceRequired {
                        raw: raw.to_string(),
                    }));
                }
            }
            Err(Error::new_simple(format!(
                "malformed variable reference `${{{raw}}}`"
            )))
        }
    }
}

fn parser() -> impl Parser<char, (String, Option<String>), Error = Cheap<char>> {
    let name = filter(|c: &char| c.is_alphabetic() || *c == '_')
        .chain(filter(|c: &char| c.is_alphanumeric() || *c == '_').repeated())
        .collect::<String>();

    let bare = filter(|c: &char| !c.is_whitespace() && *c != '"' && *c != '\'')
        .repeated()
        .at_least(1)
        .collect::<String>();

    let default = just('|').ignore_then(choice((quoted_string(), bare)));

    name.then(default.or_not()).then_ignore(end())
}

#[cfg(test)]
mod test {
    use insta::assert_debug_snapshot;

    use super::*;

    #[test]
    fn plain_reference() {
        assert_debug_snapshot!(parse_variable_ref("env").unwrap(), @r###"
        VariableExpr {
            raw: "env",
            name: "env",
            default: None,
        }
        "###);
    }

    #[test]
    fn reference_with_default() {
        assert_debug_snapshot!(parse_variable_ref("region|us-east").unwrap(), @r###"
        VariableExpr {
            raw: "region|us-east",
            name: "region",
            default: Some(
                "us-east",
            ),
        }
        "###);
    }

    #[test]
    fn quoted_default_may_contain_whitespace() {
        assert_debug_snapshot!(parse_variable_ref(r#"r|"us east""#).unwrap(), @r###"
        VariableExpr {
            raw: "r|\"us east\"",
            name: "r",
            default: Some(
                "us east",
            ),
        }
        "###);
    }

    #[test]
    fn unquoted_whitespace_is_rejected() {
        let err = parse_variable_ref("r|us east").unwrap_err();
        assert!(matches!(err.reason, Reason::QuotedWhitespaceRequired { .. }));
    }

    #[test]
    fn nested_references_are_rejected() {
        let err = parse_variable_ref("a_${b}").unwrap_err();
        assert!(matches!(err.reason, Reason::Simple(_)));
    }
}
