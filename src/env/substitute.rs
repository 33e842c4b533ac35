//! Variable substitution into YAML source text.
//!
//! Two substitution forms coexist. `${VAR}` and `${VAR:DEFAULT}` insert the
//! value as a correctly-typed YAML scalar: values matching the YAML 1.2 core
//! schema (null, bool, int, float) are passed through verbatim and anything
//! else is emitted as an escaped YAML string. `$(VAR)` and `$(VAR:DEFAULT)`
//! splice the value in with no escaping at all, which lets a user inject
//! arbitrary YAML syntax such as a list literal.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::env::Provider;

// Matches "${FOO}", "${FOO:BAR}", "$(FOO)", or "$(FOO:BAR)", along with any
// immediately preceding run of backslashes.
static VAR_EXPRESSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\\*)((\$\{([^:}]*)(:([^}]*))?\})|(\$\(([^:)]*)(:([^)]*))?\)))")
        .expect("substitution expression must compile")
});

// Regular expressions matching YAML primitive values, taken from the YAML
// spec: https://yaml.org/spec/1.2.2/#103-core-schema
static NULL_VALUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(null|Null|NULL|~|)$").unwrap());
static BOOL_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(true|True|TRUE|false|False|FALSE)$").unwrap());
static INT_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([-+]?[0-9]+|0o[0-7]+|0x[0-9a-fA-F]+)$").unwrap());
static FLOAT_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([-+]?(\.[0-9]+|[0-9]+(\.[0-9]*)?)([eE][-+]?[0-9]+)?|[-+]?(\.inf|\.Inf|\.INF)|\.nan|\.NaN|\.NAN)$",
    )
    .unwrap()
});

/// Substitutes variables from `provider` into the provided YAML source.
///
/// If a variable is unset its default is used; with no default the
/// expression evaluates to the empty string. A backslash immediately before
/// an expression escapes it: the backslash is consumed and the expression is
/// emitted literally. An even number of backslashes passes through unchanged
/// and does not suppress substitution.
pub fn substitute_vars(provider: &dyn Provider, input: &str) -> String {
    VAR_EXPRESSION
        .replace_all(input, |caps: &Captures| {
            let backslashes = caps.get(1).map_or("", |m| m.as_str());

            // An odd number of backslashes escapes the expression: drop the
            // backslash that was consumed and emit the rest literally.
            if backslashes.len() % 2 == 1 {
                return caps[0][1..].to_string();
            }

            let (name, default, typed) = if caps.get(3).is_some() {
                // ${VAR} or ${VAR:DEFAULT}.
                (
                    caps.get(4).map_or("", |m| m.as_str()),
                    caps.get(6).map_or("", |m| m.as_str()),
                    true,
                )
            } else {
                // $(VAR) or $(VAR:DEFAULT).
                (
                    caps.get(8).map_or("", |m| m.as_str()),
                    caps.get(10).map_or("", |m| m.as_str()),
                    false,
                )
            };

            // An empty variable name always resolves to the default, which
            // may itself be empty.
            let value = if name.is_empty() {
                default.to_string()
            } else {
                provider.lookup(name).unwrap_or_else(|| default.to_string())
            };

            let substituted = if typed {
                escape_yaml_scalar(name, &value)
            } else {
                value
            };

            format!("{backslashes}{substituted}")
        })
        .into_owned()
}

/// Emits `value` as a YAML scalar. Values that already read as a non-string
/// YAML primitive are passed through unchanged so they keep their type;
/// everything else is serialized as a YAML string so quotes, backslashes,
/// and non-ASCII characters survive the trip through the parser.
fn escape_yaml_scalar(name: &str, value: &str) -> String {
    if NULL_VALUE.is_match(value)
        || BOOL_VALUE.is_match(value)
        || INT_VALUE.is_match(value)
        || FLOAT_VALUE.is_match(value)
    {
        return value.to_string();
    }

    match serde_yml::to_string(&value) {
        // The serializer terminates the scalar with a newline; strip it.
        Ok(yaml) => yaml.trim_end_matches('\n').to_string(),
        Err(error) => {
            tracing::warn!(variable = %name, %error, "invalid value for environment variable");
            String::new()
        }
    }
}
