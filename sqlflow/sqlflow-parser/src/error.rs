use std::fmt::Debug;

use serde::Serialize;

use crate::span::Span;

/// A SQLFlow error. Used internally, exposed as `sqlflow::ErrorMessage`.
#[derive(Debug, Clone)]
pub struct Error {
    /// Message kind. Currently only Error is implemented.
    pub kind: MessageKind,
    pub span: Option<Span>,
    pub reason: Reason,
    pub hints: Vec<String>,
    /// Machine readable identifier error code eg, "E0001"
    pub code: Option<&'static str>,
}

/// Multiple SQLFlow errors. Used internally, exposed as `sqlflow::ErrorMessages`.
#[derive(Debug, Clone)]
pub struct Errors(pub Vec<Error>);

/// Compile message kind. Currently only Error is implemented.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum MessageKind {
    Error,
    Warning,
    Lint,
}

#[derive(Debug, Clone)]
pub enum Reason {
    Simple(String),
    Expected {
        who: Option<String>,
        expected: String,
        found: String,
    },
    Unexpected {
        found: String,
    },

    // variable resolution
    UnresolvedVariable {
        name: String,
    },
    QuotedWhitespaceRequired {
        raw: String,
    },
    ConditionType {
        found: String,
    },

    // planning
    PlanCycle {
        path: Vec<String>,
    },
    UnknownReference {
        name: String,
    },
    InvalidIdentifier {
        value: String,
        details: String,
    },

    // schema
    SchemaIncompatible {
        column: String,
        source_type: String,
        target_type: String,
    },
    MissingMergeKey {
        key: String,
        table: String,
    },

    // connectors
    ConnectorConfig {
        connector: String,
        details: String,
    },
    ConnectionFailed {
        details: String,
    },
    AuthFailed {
        details: String,
    },
    Timeout {
        after_secs: u64,
    },
    CircuitOpen {
        endpoint: String,
    },
    /// Internal: a token-bucket wait. Never surfaced once the bucket refills.
    RateLimited {
        host: String,
    },

    // engine
    EngineLocked {
        path: String,
    },
    TransactionAborted {
        details: String,
    },
    EngineInternal {
        details: String,
    },

    Canceled,
}

impl Error {
    pub fn new(reason: Reason) -> Self {
        Error {
            kind: MessageKind::Error,
            span: None,
            reason,
            hints: Vec::new(),
            code: None,
        }
    }

    pub fn new_simple<S: ToString>(reason: S) -> Self {
        Error::new(Reason::Simple(reason.to_string()))
    }

    /// Used for things that you *think* should never happen, but are not sure.
    pub fn new_assert<S: ToString>(details: S) -> Self {
        Error::new(Reason::EngineInternal {
            details: details.to_string(),
        })
    }
}

impl Reason {
    /// Whether a failed connector call carrying this reason may be retried.
    ///
    /// Connection-level and timeout failures are transient; everything that
    /// indicates a mis-configured pipeline (auth, schema, identifiers) fails
    /// the operation immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Reason::ConnectionFailed { .. } | Reason::Timeout { .. } => true,
            Reason::Simple(msg) => {
                // Best-effort classification of errors bubbled up as text by
                // drivers that don't expose a structured cause.
                let m = msg.to_lowercase();
                m.contains("connection refused")
                    || m.contains("connection reset")
                    || m.contains("connection closed")
                    || m.contains("broken pipe")
                    || m.contains("timed out")
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::Simple(text) => f.write_str(text),
            Reason::Expected {
                who,
                expected,
                found,
            } => {
                if let Some(who) = who {
                    write!(f, "{who} ")?;
                }
                write!(f, "expected {expected}, but found {found}")
            }
            Reason::Unexpected { found } => write!(f, "unexpected {found}"),

            Reason::UnresolvedVariable { name } => {
                write!(f, "variable `{name}` is not defined in any scope")
            }
            Reason::QuotedWhitespaceRequired { raw } => {
                write!(
                    f,
                    "default value in `${{{raw}}}` contains whitespace and must be quoted"
                )
            }
            Reason::ConditionType { found } => {
                write!(f, "condition expects a boolean, but found {found}")
            }

            Reason::PlanCycle { path } => {
                write!(f, "plan contains a dependency cycle: {}", path.join(" -> "))
            }
            Reason::UnknownReference { name } => write!(f, "unknown reference `{name}`"),
            Reason::InvalidIdentifier { value, details } => {
                write!(f, "invalid identifier `{value}`: {details}")
            }

            Reason::SchemaIncompatible {
                column,
                source_type,
                target_type,
            } => write!(
                f,
                "column `{column}` of type {source_type} is not compatible with target type {target_type}"
            ),
            Reason::MissingMergeKey { key, table } => {
                write!(f, "merge key `{key}` does not exist in `{table}`")
            }

            Reason::ConnectorConfig { connector, details } => {
                write!(f, "connector `{connector}` is misconfigured: {details}")
            }
            Reason::ConnectionFailed { details } => write!(f, "connection failed: {details}"),
            Reason::AuthFailed { details } => write!(f, "authentication failed: {details}"),
            Reason::Timeout { after_secs } => {
                write!(f, "operation timed out after {after_secs}s")
            }
            Reason::CircuitOpen { endpoint } => {
                write!(f, "circuit breaker for `{endpoint}` is open")
            }
            Reason::RateLimited { host } => write!(f, "rate limited on `{host}`"),

            Reason::EngineLocked { path } => {
                write!(f, "engine file `{path}` is locked by another process")
            }
            Reason::TransactionAborted { details } => {
                write!(f, "transaction aborted: {details}")
            }
            Reason::EngineInternal { details } => write!(f, "engine error: {details}"),

            Reason::Canceled => write!(f, "operation canceled"),
        }
    }
}

impl From<Error> for Errors {
    fn from(error: Error) -> Self {
        Errors(vec![error])
    }
}

// Needed for anyhow
impl std::error::Error for Error {}

// Needed for anyhow
impl std::error::Error for Errors {}

// Needed for StdError
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self, f)
    }
}

// Needed for StdError
impl std::fmt::Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self, f)
    }
}

pub trait WithErrorInfo: Sized {
    fn push_hint<S: Into<String>>(self, hint: S) -> Self;

    fn with_hints<S: Into<String>, I: IntoIterator<Item = S>>(self, hints: I) -> Self;

    fn with_span(self, span: Option<Span>) -> Self;

    fn with_span_fallback(self, span: Option<Span>) -> Self;

    fn with_code(self, code: &'static str) -> Self;
}

impl WithErrorInfo for Error {
    fn push_hint<S: Into<String>>(mut self, hint: S) -> Self {
        self.hints.push(hint.into());
        self
    }

    fn with_hints<S: Into<String>, I: IntoIterator<Item = S>>(mut self, hints: I) -> Self {
        self.hints = hints.into_iter().map(|x| x.into()).collect();
        self
    }

    fn with_span(mut self, span: Option<Span>) -> Self {
        self.span = span;
        self
    }

    fn with_span_fallback(mut self, span: Option<Span>) -> Self {
        self.span = self.span.or(span);
        self
    }

    fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }
}

impl<T, E: WithErrorInfo> WithErrorInfo for Result<T, E> {
    fn push_hint<S: Into<String>>(self, hint: S) -> Self {
        self.map_err(|e| e.push_hint(hint))
    }

    fn with_hints<S: Into<String>, I: IntoIterator<Item = S>>(self, hints: I) -> Self {
        self.map_err(|e| e.with_hints(hints))
    }

    fn with_span(self, span: Option<Span>) -> Self {
        self.map_err(|e| e.with_span(span))
    }

    fn with_span_fallback(self, span: Option<Span>) -> Self {
        self.map_err(|e| e.with_span_fallback(span))
    }

    fn with_code(self, code: &'static str) -> Self {
        self.map_err(|e| e.with_code(code))
    }
}
