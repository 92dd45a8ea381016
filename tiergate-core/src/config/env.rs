//! Environment variable interpolation for configuration
//!
//! `${NAME}` placeholders are substituted before the document is parsed, so
//! credentials never need to live in the file itself.

use super::error::ConfigError;
use regex::Regex;
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is a valid regex")
});

/// Whether a value still carries an unresolved `${NAME}` placeholder
pub fn has_placeholder(value: &str) -> bool {
    ENV_VAR_PATTERN.is_match(value)
}

/// Interpolate environment variables in a configuration string
pub fn interpolate_env_vars(content: &str) -> Result<String, ConfigError> {
    interpolate_with(content, |name| env::var(name).ok())
}

/// Interpolate using an arbitrary lookup; the first unresolved name is reported
pub(crate) fn interpolate_with<F>(content: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(content.len());
    let mut last = 0;

    for cap in ENV_VAR_PATTERN.captures_iter(content) {
        let Some(whole) = cap.get(0) else { continue };
        let var_name = &cap[1];
        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVarNotFound {
            var: var_name.to_string(),
        })?;
        result.push_str(&content[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }

    result.push_str(&content[last..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_interpolate_env_vars() {
        let result = interpolate_with("api_key: ${TG_KEY}", lookup(&[("TG_KEY", "sk-abc")])).unwrap();
        assert_eq!(result, "api_key: sk-abc");
    }

    #[test]
    fn test_missing_env_var() {
        let result = interpolate_with("api_key: ${TG_MISSING}", lookup(&[]));
        match result {
            Err(ConfigError::EnvVarNotFound { var }) => assert_eq!(var, "TG_MISSING"),
            other => panic!("Expected EnvVarNotFound error, got {:?}", other),
        }
    }

    #[test]
    fn test_repeated_and_multiple_vars() {
        let result = interpolate_with(
            "${A}/${B}/${A}",
            lookup(&[("A", "one"), ("B", "two")]),
        )
        .unwrap();
        assert_eq!(result, "one/two/one");
    }

    #[test]
    fn test_lowercase_is_not_a_placeholder() {
        assert!(!has_placeholder("${lower}"));
        assert!(has_placeholder("x${UPPER_1}"));
        assert_eq!(interpolate_with("${lower}", lookup(&[])).unwrap(), "${lower}");
    }
}
