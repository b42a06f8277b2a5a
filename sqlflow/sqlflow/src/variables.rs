//! Variable resolution and substitution.
//!
//! One engine for the whole compiler: scopes overlay in priority order
//! (CLI > PROFILE > SET > ENV > DEFAULT) and every substitution happens in an
//! explicit rendering context. Reference syntax is parsed by
//! [sqlflow_parser::variables::parse_variable_ref] — the same parser the
//! statement parser uses.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use sqlflow_parser::ast::VariableExpr;
use sqlflow_parser::error::{Error, Reason, WithErrorInfo};
use sqlflow_parser::variables::parse_variable_ref;

use crate::safety;

/// Where a resolved value came from, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum VarScope {
    Cli,
    Profile,
    Set,
    Env,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    pub value: String,
    pub scope: VarScope,
}

/// How a substituted value is rendered into the surrounding text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarContext {
    /// Filenames, connector params, CLI values: verbatim.
    Raw,
    /// Inside a SQL expression: quoted unless the value is numeric.
    SqlLiteral,
    /// Inside a condition expression: always quoted.
    Condition,
    /// A dynamic identifier: validated, never quoted here.
    Identifier,
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String>>;

pub struct VariableResolver {
    cli: BTreeMap<String, String>,
    profile: BTreeMap<String, String>,
    set: BTreeMap<String, String>,
    env: EnvLookup,
}

impl std::fmt::Debug for VariableResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariableResolver")
            .field("cli", &self.cli)
            .field("profile", &self.profile)
            .field("set", &self.set)
            .finish_non_exhaustive()
    }
}

impl VariableResolver {
    pub fn new(cli: BTreeMap<String, String>, profile: BTreeMap<String, String>) -> Self {
        VariableResolver {
            cli,
            profile,
            set: BTreeMap::new(),
            env: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Replace the process-environment lookup, for hermetic tests.
    pub fn with_env_lookup(mut self, env: impl Fn(&str) -> Option<String> + 'static) -> Self {
        self.env = Box::new(env);
        self
    }

    /// Record a `SET` binding. Later `SET`s of the same name win.
    pub fn set(&mut self, name: &str, value: String) {
        self.set.insert(name.to_string(), value);
    }

    /// Resolve one reference against the scope stack.
    pub fn resolve(&self, var: &VariableExpr) -> Result<Binding, Error> {
        let found = None
            .or_else(|| self.cli.get(&var.name).cloned().map(|v| (v, VarScope::Cli)))
            .or_else(|| {
                self.profile
                    .get(&var.name)
                    .cloned()
                    .map(|v| (v, VarScope::Profile))
            })
            .or_else(|| self.set.get(&var.name).cloned().map(|v| (v, VarScope::Set)))
            .or_else(|| (self.env)(&var.name).map(|v| (v, VarScope::Env)))
            .or_else(|| var.default.clone().map(|v| (v, VarScope::Default)));

        match found {
            Some((value, scope)) => Ok(Binding { value, scope }),
            None => Err(Error::new(Reason::UnresolvedVariable {
                name: var.name.clone(),
            })
            .push_hint("pass a value with `--var`, add it to the profile, or give the reference a default")),
        }
    }

    /// Substitute every `${…}` reference in `template`, rendering per `ctx`.
    pub fn substitute(&self, template: &str, ctx: VarContext) -> Result<String, Error> {
        let mut out = String::with_capacity(template.len());
        let mut last_end = 0;

        for caps in var_regex().captures_iter(template) {
            let whole = caps.get(0).unwrap();
            let inner = &caps[1];

            let var = parse_variable_ref(inner)?;
            let binding = self.resolve(&var)?;

            out.push_str(&template[last_end..whole.start()]);
            out.push_str(&render(&binding.value, ctx)?);
            last_end = whole.end();
        }
        out.push_str(&template[last_end..]);
        Ok(out)
    }
}

/// The canonical reference regex; all template scanning goes through it.
fn var_regex() -> &'static Regex {
    static VAR_RE: OnceLock<Regex> = OnceLock::new();
    VAR_RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").unwrap())
}

fn render(value: &str, ctx: VarContext) -> Result<String, Error> {
    Ok(match ctx {
        VarContext::Raw => value.to_string(),
        VarContext::SqlLiteral => {
            if looks_numeric(value) {
                value.to_string()
            } else {
                quote_single(value)
            }
        }
        VarContext::Condition => quote_single(value),
        VarContext::Identifier => {
            safety::validate_identifier(value)?;
            value.to_string()
        }
    })
}

fn quote_single(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn looks_numeric(value: &str) -> bool {
    !value.is_empty() && value.parse::<f64>().is_ok()
}
