use chumsky::prelude::*;

use crate::ast::Literal;
use crate::common::*;
use crate::lexer::TokenKind;

/// Parser for the JSON objects following `PARAMS` and `OPTIONS`.
///
/// Strict JSON with string keys; trailing commas are tolerated. `${…}`
/// references inside string values survive as text and are substituted by
/// the planner.
pub(crate) fn value() -> impl Parser<TokenKind, serde_json::Value, Error = PError> + Clone {
    recursive(|value| {
        let scalar = select! {
            TokenKind::Literal(Literal::String(s)) => serde_json::Value::String(s),
            TokenKind::Literal(Literal::Integer(i)) => serde_json::Value::from(i),
            TokenKind::Literal(Literal::Float(f)) => serde_json::json!(f),
            TokenKind::Literal(Literal::Boolean(b)) => serde_json::Value::Bool(b),
            TokenKind::Literal(Literal::Null) => serde_json::Value::Null,
        };

        // The lexer emits `-` separately from the number it negates.
        let negative = ctrl('-').ignore_then(select! {
            TokenKind::Literal(Literal::Integer(i)) => serde_json::Value::from(-i),
            TokenKind::Literal(Literal::Float(f)) => serde_json::json!(-f),
        });

        let member = select! { TokenKind::Literal(Literal::String(s)) => s }
            .then_ignore(ctrl(':'))
            .then(value.clone());

        let object = member
            .separated_by(ctrl(','))
            .allow_trailing()
            .delimited_by(ctrl('{'), ctrl('}'))
            .map(|members| {
                serde_json::Value::Object(members.into_iter().collect())
            });

        let array = value
            .separated_by(ctrl(','))
            .allow_trailing()
            .delimited_by(ctrl('['), ctrl(']'))
            .map(serde_json::Value::Array);

        choice((scalar, negative, object, array))
    })
    .labelled("json value")
}
