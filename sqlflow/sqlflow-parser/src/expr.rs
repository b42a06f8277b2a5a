use chumsky::prelude::*;

use crate::ast::*;
use crate::common::*;
use crate::lexer::TokenKind;
use crate::span::Span;
use crate::variables;

/// Parser for condition expressions, as used by `IF`/`ELSE IF`.
///
/// Precedence, tightest first: comparisons, `NOT`, `AND`, `OR`.
pub(crate) fn cond_expr() -> impl Parser<TokenKind, Expr, Error = PError> + Clone {
    recursive(|expr| {
        let literal = select! { TokenKind::Literal(lit) => ExprKind::Literal(lit) };

        let variable = select! { TokenKind::Variable(raw) => raw }.try_map(|raw, span: Span| {
            variables::parse_variable_ref(&raw)
                .map(ExprKind::Variable)
                .map_err(|e| Simple::custom(span, e.reason.to_string()))
        });

        let ident = ident_part().map(ExprKind::Ident);

        let term = choice((literal, variable, ident))
            .map_with_span(into_expr)
            .or(expr.delimited_by(ctrl('('), ctrl(')')))
            .boxed();

        let comparison = term
            .clone()
            .then(comparison_op().then(term).or_not())
            .map(|(left, rhs)| match rhs {
                None => left,
                Some((op, right)) => binary(left, op, right),
            })
            .boxed();

        let unary = keyword("NOT")
            .map_with_span(|_, span: Span| span)
            .repeated()
            .then(comparison)
            .foldr(|not_span, operand| {
                let span = Span::merge_opt(Some(not_span), operand.span);
                Expr {
                    kind: ExprKind::Unary(UnaryExpr {
                        op: UnOp::Not,
                        expr: Box::new(operand),
                    }),
                    span,
                }
            })
            .boxed();

        let conjunction = binary_op_parser(unary, keyword("AND").to(BinOp::And));

        binary_op_parser(conjunction, keyword("OR").to(BinOp::Or))
    })
    .labelled("condition")
}

fn binary_op_parser<'a, Term, Op>(
    term: Term,
    op: Op,
) -> impl Parser<TokenKind, Expr, Error = PError> + Clone + 'a
where
    Term: Parser<TokenKind, Expr, Error = PError> + Clone + 'a,
    Op: Parser<TokenKind, BinOp, Error = PError> + Clone + 'a,
{
    term.clone()
        .then(op.then(term).repeated())
        .foldl(|left, (op, right)| binary(left, op, right))
        .boxed()
}

fn binary(left: Expr, op: BinOp, right: Expr) -> Expr {
    let span = Span::merge_opt(left.span, right.span);
    Expr {
        kind: ExprKind::Binary(BinaryExpr {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }),
        span,
    }
}

fn comparison_op() -> impl Parser<TokenKind, BinOp, Error = PError> + Clone {
    select! {
        TokenKind::Eq => BinOp::Eq,
        TokenKind::Ne => BinOp::Ne,
        TokenKind::Gte => BinOp::Gte,
        TokenKind::Lte => BinOp::Lte,
        TokenKind::Control('<') => BinOp::Lt,
        TokenKind::Control('>') => BinOp::Gt,
    }
}
