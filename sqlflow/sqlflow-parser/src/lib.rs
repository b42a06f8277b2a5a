//! Parser for the SQLFlow pipeline language.
//!
//! Turns `.sf` source text into the statement AST in [ast]. Raw SQL between
//! directives is kept opaque: it is tokenised only far enough to find the
//! terminating `;`, then sliced back out of the source verbatim.

pub mod ast;
pub mod error;
mod expr;
mod json;
mod lexer;
pub mod span;
mod stmt;
#[cfg(test)]
mod test;
pub mod variables;

use chumsky::error::SimpleReason;
use chumsky::{prelude::*, Stream};
use itertools::Itertools;

use crate::ast::Stmt;
use crate::error::{Error, Reason};
use crate::lexer::{TokenKind, TokenSpan};
use crate::span::Span;

/// Build a SQLFlow AST from pipeline source text.
pub fn parse_source(source: &str, source_id: u16) -> Result<Vec<Stmt>, Vec<Error>> {
    let mut errors = Vec::new();

    let (tokens, lex_errors) = ::chumsky::Parser::parse_recovery(&lexer::lexer(), source);

    errors.extend(
        lex_errors
            .into_iter()
            .map(|e| convert_lexer_error(source, e, source_id)),
    );

    let ast = if let Some(tokens) = tokens {
        let stream = prepare_stream(tokens, source, source_id);

        let (ast, parse_errors) =
            ::chumsky::Parser::parse_recovery(&stmt::source(source.to_string()), stream);

        errors.extend(parse_errors.into_iter().map(convert_parser_error));

        ast
    } else {
        None
    };

    log::debug!("parse errors: {errors:?}");

    if errors.is_empty() {
        Ok(ast.unwrap_or_default())
    } else {
        Err(errors)
    }
}

pub(crate) mod common {
    use chumsky::prelude::*;

    use crate::ast::*;
    use crate::lexer::TokenKind;
    use crate::span::Span;

    pub type PError = Simple<TokenKind, Span>;

    pub fn ident_part() -> impl Parser<TokenKind, String, Error = PError> + Clone {
        select! { TokenKind::Ident(ident) => ident }.map_err(|e: PError| {
            Simple::expected_input_found(
                e.span(),
                [Some(TokenKind::Ident("".to_string()))],
                e.found().cloned(),
            )
        })
    }

    pub fn keyword(kw: &'static str) -> impl Parser<TokenKind, (), Error = PError> + Clone {
        just(TokenKind::Keyword(kw.to_string())).ignored()
    }

    pub fn ctrl(char: char) -> impl Parser<TokenKind, (), Error = PError> + Clone {
        just(TokenKind::Control(char)).ignored()
    }

    pub fn string_literal() -> impl Parser<TokenKind, String, Error = PError> + Clone {
        select! { TokenKind::Literal(Literal::String(s)) => s }
    }

    pub fn into_stmt(kind: StmtKind, span: Span) -> Stmt {
        Stmt {
            kind,
            span: Some(span),
        }
    }

    pub fn into_expr(kind: ExprKind, span: Span) -> Expr {
        Expr {
            kind,
            span: Some(span),
        }
    }

    /// Spans are char-based, so the slice can't just index into the str.
    pub fn slice(source: &str, span: Span) -> String {
        source
            .chars()
            .skip(span.start)
            .take(span.end - span.start)
            .collect()
    }
}

fn prepare_stream(
    tokens: Vec<TokenSpan>,
    source: &str,
    source_id: u16,
) -> Stream<TokenKind, Span, impl Iterator<Item = (TokenKind, Span)> + Sized> {
    let tokens = tokens
        .into_iter()
        // Comments don't reach the parser; raw SQL slices still carry them.
        .filter(|TokenSpan(kind, _)| !matches!(kind, TokenKind::Comment(_)))
        .map(move |TokenSpan(kind, s)| {
            (
                kind,
                Span {
                    start: s.start,
                    end: s.end,
                    source_id,
                },
            )
        });
    let len = source.chars().count();
    let eoi = Span {
        start: len,
        end: len + 1,
        source_id,
    };
    Stream::from_iter(eoi, tokens)
}

fn convert_lexer_error(source: &str, e: chumsky::error::Cheap<char>, source_id: u16) -> Error {
    let found = source
        .chars()
        .skip(e.span().start)
        .take(e.span().end - e.span().start)
        .collect();
    let span = Some(Span {
        start: e.span().start,
        end: e.span().end,
        source_id,
    });

    let mut e = Error::new(Reason::Unexpected { found });
    e.span = span;
    e
}

fn convert_parser_error(e: common::PError) -> Error {
    let mut span = e.span();

    if e.found().is_none() {
        // found end of file
        // fix for span outside of source
        if span.start > 0 && span.end > 0 {
            span.start -= 1;
            span.end -= 1;
        }
    }

    let mut err = construct_parser_error(&e);
    err.span = Some(span);
    err
}

fn construct_parser_error(e: &common::PError) -> Error {
    if let SimpleReason::Custom(message) = e.reason() {
        return Error::new_simple(message);
    }

    fn token_to_string(t: Option<TokenKind>) -> String {
        t.as_ref()
            .map(TokenKind::to_string)
            .unwrap_or_else(|| "end of input".to_string())
    }

    let expected: Vec<String> = e
        .expected()
        .cloned()
        .map(token_to_string)
        .unique()
        .collect();

    let while_parsing = e
        .label()
        .map(|l| format!(" while parsing {l}"))
        .unwrap_or_default();

    if expected.is_empty() || expected.len() > 10 {
        let label = token_to_string(e.found().cloned());
        return Error::new_simple(format!("unexpected {label}{while_parsing}"));
    }

    let mut expected = expected;
    expected.sort();

    let expected = match expected.len() {
        1 => expected.remove(0),
        2 => expected.join(" or "),
        _ => {
            let last = expected.pop().unwrap();
            format!("one of {} or {last}", expected.join(", "))
        }
    };

    match e.found() {
        Some(found) => Error::new(Reason::Expected {
            who: e.label().map(|x| x.to_string()),
            expected,
            found: found.to_string(),
        }),
        // We want a friendlier message than "found end of input"...
        None => Error::new(Reason::Simple(format!(
            "Expected {expected}, but didn't find anything before the end."
        ))),
    }
}
