use chumsky::prelude::*;

use crate::ast::*;
use crate::common::*;
use crate::expr::cond_expr;
use crate::json;
use crate::lexer::TokenKind;
use crate::span::Span;

/// The top-level program parser. Takes the source text so raw SQL statements
/// can be sliced back out of it by span.
pub(crate) fn source(source: String) -> impl Parser<TokenKind, Vec<Stmt>, Error = PError> {
    stmts(source).then_ignore(end())
}

fn stmts(source: String) -> impl Parser<TokenKind, Vec<Stmt>, Error = PError> {
    recursive(move |stmts| {
        choice((
            source_def(),
            load_stmt(),
            export_stmt(source.clone()),
            set_stmt(source.clone()),
            if_block(stmts),
            sql_stmt(source.clone()),
        ))
        .map_with_span(into_stmt)
        .repeated()
    })
}

fn source_def() -> impl Parser<TokenKind, StmtKind, Error = PError> {
    let inline = keyword("TYPE")
        .ignore_then(ident_part())
        .then(keyword("PARAMS").ignore_then(json::value()))
        .map(|(type_tag, params)| (Some(type_tag), Some(params), None, None));

    let reference = keyword("FROM")
        .ignore_then(string_literal())
        .then(keyword("OPTIONS").ignore_then(json::value()).or_not())
        .map(|(from_ref, options)| (None, None, Some(from_ref), options));

    keyword("SOURCE")
        .ignore_then(ident_part())
        .then(inline.or(reference))
        .then_ignore(ctrl(';'))
        .map(|(name, (type_tag, params, from_ref, options))| {
            StmtKind::SourceDef(SourceDef {
                name,
                type_tag,
                params,
                from_ref,
                options,
            })
        })
        .labelled("source definition")
}

fn load_stmt() -> impl Parser<TokenKind, StmtKind, Error = PError> {
    let mode = ident_part().try_map(|word, span: Span| {
        word.to_ascii_uppercase()
            .parse::<LoadMode>()
            .map_err(|_| Simple::custom(span, format!("unknown load mode `{word}`")))
    });

    let merge_keys = ident_part()
        .separated_by(ctrl(','))
        .at_least(1)
        .delimited_by(ctrl('('), ctrl(')'));

    keyword("LOAD")
        .ignore_then(ident_part())
        .then_ignore(keyword("FROM"))
        .then(ident_part())
        .then(keyword("MODE").ignore_then(mode).or_not())
        .then(keyword("MERGE_KEYS").ignore_then(merge_keys).or_not())
        .then_ignore(ctrl(';'))
        .map(|(((target_table, source_ref), mode), merge_keys)| {
            StmtKind::Load(LoadStmt {
                target_table,
                source_ref,
                mode: mode.unwrap_or_default(),
                merge_keys: merge_keys.unwrap_or_default(),
            })
        })
        .labelled("load statement")
}

fn export_stmt(source: String) -> impl Parser<TokenKind, StmtKind, Error = PError> {
    let select = filter(|t: &TokenKind| {
        !matches!(t, TokenKind::Keyword(k) if k == "TO") && !matches!(t, TokenKind::Control(';'))
    })
    .repeated()
    .at_least(1)
    .map_with_span(|_, span: Span| span);

    keyword("EXPORT")
        .ignore_then(select)
        .then_ignore(keyword("TO"))
        .then(string_literal())
        .then_ignore(keyword("TYPE"))
        .then(ident_part())
        .then(keyword("OPTIONS").ignore_then(json::value()).or_not())
        .then_ignore(ctrl(';'))
        .map(move |(((select_span, destination_uri), type_tag), options)| {
            StmtKind::Export(ExportStmt {
                select_sql: slice(&source, select_span).trim().to_string(),
                destination_uri,
                type_tag,
                options,
            })
        })
        .labelled("export statement")
}

fn set_stmt(source: String) -> impl Parser<TokenKind, StmtKind, Error = PError> {
    let expression = filter(|t: &TokenKind| !matches!(t, TokenKind::Control(';')))
        .repeated()
        .at_least(1)
        .map_with_span(|_, span: Span| span);

    keyword("SET")
        .ignore_then(ident_part())
        .then_ignore(ctrl('='))
        .then(expression)
        .then_ignore(ctrl(';'))
        .map(move |(name, span)| {
            StmtKind::Set(SetStmt {
                name,
                expression: slice(&source, span).trim().to_string(),
            })
        })
        .labelled("set statement")
}

fn if_block(
    stmts: impl Parser<TokenKind, Vec<Stmt>, Error = PError> + Clone,
) -> impl Parser<TokenKind, StmtKind, Error = PError> {
    let branch = cond_expr().then_ignore(keyword("THEN")).then(stmts.clone());

    keyword("IF")
        .ignore_then(branch.clone())
        .then(
            keyword("ELSE")
                .ignore_then(keyword("IF"))
                .ignore_then(branch)
                .repeated(),
        )
        .then(keyword("ELSE").ignore_then(stmts).or_not())
        .then_ignore(keyword("END"))
        .then_ignore(keyword("IF"))
        .then_ignore(ctrl(';').or_not())
        .map(|((first, rest), else_body)| {
            let mut branches = vec![first];
            branches.extend(rest);
            StmtKind::If(IfBlock {
                branches,
                else_body,
            })
        })
        .labelled("conditional block")
}

/// Any statement that does not start with a directive keyword is raw SQL,
/// consumed up to the terminating `;` and kept as an opaque source slice.
fn sql_stmt(source: String) -> impl Parser<TokenKind, StmtKind, Error = PError> {
    let start = filter(|t: &TokenKind| match t {
        TokenKind::Control(';') => false,
        TokenKind::Keyword(k) => !matches!(
            k.as_str(),
            "SOURCE" | "LOAD" | "EXPORT" | "SET" | "IF" | "ELSE" | "END"
        ),
        _ => true,
    });

    let rest = filter(|t: &TokenKind| !matches!(t, TokenKind::Control(';'))).repeated();

    start
        .then(rest)
        .map_with_span(|_, span: Span| span)
        .then_ignore(ctrl(';'))
        .map(move |span| {
            StmtKind::Sql(SqlStmt {
                raw: slice(&source, span).trim().to_string(),
            })
        })
        .labelled("sql statement")
}
