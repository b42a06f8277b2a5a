use chumsky::{error::Cheap, prelude::*};

use crate::ast::Literal;

/// Directive keywords. Recognition is case-insensitive; the canonical,
/// uppercased lexeme is stored in the token.
pub const KEYWORDS: &[&str] = &[
    "SOURCE",
    "LOAD",
    "EXPORT",
    "SET",
    "IF",
    "THEN",
    "ELSE",
    "END",
    "MODE",
    "MERGE_KEYS",
    "FROM",
    "TO",
    "TYPE",
    "PARAMS",
    "OPTIONS",
    "AND",
    "OR",
    "NOT",
    "CREATE",
    "TABLE",
    "AS",
];

#[derive(Clone, PartialEq, Debug)]
pub enum TokenKind {
    Ident(String),
    /// A directive keyword, uppercased.
    Keyword(String),
    Literal(Literal),
    /// A `${…}` reference; holds the text between the braces.
    Variable(String),

    /// Any other single punctuation char. This is what lets arbitrary SQL
    /// flow through the lexer untouched.
    Control(char),

    Eq,  // ==
    Ne,  // !=
    Gte, // >=
    Lte, // <=

    // Aesthetics only; filtered out before parsing
    Comment(String),
}

/// Lex chars to tokens until the end of the input
pub fn lexer() -> impl Parser<char, Vec<TokenSpan>, Error = Cheap<char>> {
    lex_token()
        .repeated()
        .then_ignore(ignored())
        .then_ignore(end())
}

/// Lex chars to a single token
fn lex_token() -> impl Parser<char, TokenSpan, Error = Cheap<char>> {
    let comment = just("--")
        .ignore_then(filter(|c: &char| *c != '\n').repeated().collect::<String>())
        .map(TokenKind::Comment);

    let control_multi = choice((
        just("==").to(TokenKind::Eq),
        just("!=").to(TokenKind::Ne),
        just(">=").to(TokenKind::Gte),
        just("<=").to(TokenKind::Lte),
    ));

    let variable = just("${")
        .ignore_then(
            filter(|c: &char| *c != '}' && *c != '\n')
                .repeated()
                .at_least(1)
                .collect::<String>(),
        )
        .then_ignore(just('}'))
        .map(TokenKind::Variable);

    let string = quoted_string().map(|s| TokenKind::Literal(Literal::String(s)));

    let word = word_part().map(|word| match word.to_ascii_uppercase() {
        w if KEYWORDS.contains(&w.as_str()) => TokenKind::Keyword(w),
        w if w == "TRUE" => TokenKind::Literal(Literal::Boolean(true)),
        w if w == "FALSE" => TokenKind::Literal(Literal::Boolean(false)),
        w if w == "NULL" => TokenKind::Literal(Literal::Null),
        _ => TokenKind::Ident(word),
    });

    let control = filter(|c: &char| c.is_ascii_punctuation()).map(TokenKind::Control);

    let token = choice((
        comment,
        control_multi,
        variable,
        string,
        number().map(TokenKind::Literal),
        word,
        control,
    ))
    .recover_with(skip_then_retry_until([]).skip_start());

    ignored().ignore_then(token.map_with_span(TokenSpan))
}

fn ignored() -> impl Parser<char, (), Error = Cheap<char>> {
    filter(|c: &char| c.is_whitespace()).repeated().ignored()
}

fn word_part() -> impl Parser<char, String, Error = Cheap<char>> + Clone {
    filter(|c: &char| c.is_alphabetic() || *c == '_')
        .chain(filter(|c: &char| c.is_alphanumeric() || *c == '_').repeated())
        .collect()
}

fn number() -> impl Parser<char, Literal, Error = Cheap<char>> {
    let integer = filter(|c: &char| c.is_ascii_digit() && *c != '0')
        .chain::<_, Vec<char>, _>(filter(|c: &char| c.is_ascii_digit()).repeated())
        .or(just('0').map(|c| vec![c]));

    let frac = just('.')
        .chain::<char, _, _>(filter(|c: &char| c.is_ascii_digit()))
        .chain::<char, _, _>(filter(|c: &char| c.is_ascii_digit()).repeated());

    integer
        .chain::<char, _, _>(frac.or_not().flatten())
        .try_map(|chars, span| {
            let str = chars.into_iter().collect::<String>();

            if let Ok(i) = str.parse::<i64>() {
                Ok(Literal::Integer(i))
            } else if let Ok(f) = str.parse::<f64>() {
                Ok(Literal::Float(f))
            } else {
                Err(Cheap::expected_input_found(span, None, None))
            }
        })
        .labelled("number")
}

pub(crate) fn quoted_string() -> impl Parser<char, String, Error = Cheap<char>> {
    choice((
        quoted_string_of_quote(&'"'),
        quoted_string_of_quote(&'\''),
    ))
    .collect::<String>()
    .labelled("string")
}

fn quoted_string_of_quote(quote: &char) -> impl Parser<char, Vec<char>, Error = Cheap<char>> + '_ {
    let inner = choice((
        escaped_character(),
        // Don't allow consuming the closing quote or a bare backslash
        none_of([*quote, '\\']),
    ));

    inner
        .repeated()
        .delimited_by(just(*quote), just(*quote))
}

fn escaped_character() -> impl Parser<char, char, Error = Cheap<char>> {
    just('\\').ignore_then(choice((
        just('\\'),
        just('/'),
        just('"'),
        just('\''),
        just('b').to('\x08'),
        just('f').to('\x0C'),
        just('n').to('\n'),
        just('r').to('\r'),
        just('t').to('\t'),
        // unknown escapes pass through, so raw SQL containing backslashes
        // still tokenises
        any(),
    )))
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Ident(s) => {
                if s.is_empty() {
                    // FYI this shows up in errors
                    write!(f, "an identifier")
                } else {
                    write!(f, "{s}")
                }
            }
            TokenKind::Keyword(s) => write!(f, "keyword {s}"),
            TokenKind::Literal(lit) => write!(f, "{lit}"),
            TokenKind::Variable(s) => write!(f, "${{{s}}}"),
            TokenKind::Control(c) => write!(f, "{c}"),

            TokenKind::Eq => f.write_str("=="),
            TokenKind::Ne => f.write_str("!="),
            TokenKind::Gte => f.write_str(">="),
            TokenKind::Lte => f.write_str("<="),

            TokenKind::Comment(s) => writeln!(f, "--{s}"),
        }
    }
}

// This is here because Literal::Float(f64) does not implement Hash, so we cannot simply derive it.
// There are reasons for that, but chumsky::Error needs Hash for the TokenKind, so it can deduplicate
// tokens in error.
// So this hack could lead to duplicated tokens in error messages. Oh no.
#[allow(clippy::derived_hash_with_manual_eq)]
impl std::hash::Hash for TokenKind {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
    }
}

impl std::cmp::Eq for TokenKind {}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TokenSpan(pub TokenKind, pub std::ops::Range<usize>);

impl std::fmt::Debug for TokenSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}..{}: {:?}", self.1.start, self.1.end, self.0)
    }
}

pub struct TokenVec(pub Vec<TokenSpan>);

impl std::fmt::Debug for TokenVec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "TokenVec (")?;
        for token in self.0.iter() {
            writeln!(f, "  {token:?},")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod test {
    use insta::assert_debug_snapshot;

    use super::*;

    #[test]
    fn directives() {
        assert_debug_snapshot!(TokenVec(lexer().parse("LOAD t FROM s MODE APPEND;").unwrap()), @r###"
        TokenVec (
          0..4: Keyword("LOAD"),
          5..6: Ident("t"),
          7..11: Keyword("FROM"),
          12..13: Ident("s"),
          14..18: Keyword("MODE"),
          19..25: Ident("APPEND"),
          25..26: Control(';'),
        )
        "###);
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert_debug_snapshot!(TokenVec(lexer().parse("load t from s;").unwrap()), @r###"
        TokenVec (
          0..4: Keyword("LOAD"),
          5..6: Ident("t"),
          7..11: Keyword("FROM"),
          12..13: Ident("s"),
          13..14: Control(';'),
        )
        "###);
    }

    #[test]
    fn sql_flows_through() {
        assert_debug_snapshot!(TokenVec(
            lexer().parse("SELECT count(*) c FROM t WHERE x >= 1.5;").unwrap()
        ), @r###"
        TokenVec (
          0..6: Ident("SELECT"),
          7..12: Ident("count"),
          12..13: Control('('),
          13..14: Control('*'),
          14..15: Control(')'),
          16..17: Ident("c"),
          18..22: Keyword("FROM"),
          23..24: Ident("t"),
          25..30: Ident("WHERE"),
          31..32: Ident("x"),
          33..35: Gte,
          36..39: Literal(Float(1.5)),
          39..40: Control(';'),
        )
        "###);
    }

    #[test]
    fn variables_and_comments() {
        assert_debug_snapshot!(TokenVec(
            lexer().parse("SET env = ${env|dev}; -- pick the environment").unwrap()
        ), @r###"
        TokenVec (
          0..3: Keyword("SET"),
          4..7: Ident("env"),
          8..9: Control('='),
          10..20: Variable("env|dev"),
          20..21: Control(';'),
          22..45: Comment(" pick the environment"),
        )
        "###);
    }

    #[test]
    fn quotes() {
        assert_eq!(
            quoted_string().parse(r#""in.csv""#).unwrap(),
            "in.csv".to_string()
        );
        assert_eq!(
            quoted_string().parse(r"'it\'s'").unwrap(),
            "it's".to_string()
        );
        // A `;` inside a string does not terminate a statement
        assert_debug_snapshot!(TokenVec(lexer().parse(r#"SELECT ';' a;"#).unwrap()), @r###"
        TokenVec (
          0..6: Ident("SELECT"),
          7..10: Literal(String(";")),
          11..12: Ident("a"),
          12..13: Control(';'),
        )
        "###);
    }
}
