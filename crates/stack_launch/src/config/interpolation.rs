//! Variable interpolation for `${VAR}`, `${VAR:-default}`, `${VAR:?message}` and `$$`

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Matches, in priority order: `$$`, `${NAME<op><word>}`, `$NAME`, and a dangling `${`
static VARIABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?])([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)|\$\{",
    )
    .unwrap()
});

/// Variable sources, looked up in order: overrides, stack env, process env
#[derive(Debug, Clone, Default)]
pub struct Interpolator {
    /// Values given on the command line
    pub overrides: HashMap<String, String>,
    /// Global `env` section of the stack file
    pub env: HashMap<String, String>,
    /// Fall back to the process environment
    pub use_process_env: bool,
}

impl Interpolator {
    /// Create an interpolator that also reads the process environment
    pub fn new() -> Self {
        Self {
            use_process_env: true,
            ..Default::default()
        }
    }

    /// Create an interpolator that only sees explicitly provided variables
    pub fn isolated() -> Self {
        Self::default()
    }

    /// Add a command line override
    pub fn with_override(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(name.into(), value.into());
        self
    }

    /// Add multiple command line overrides
    pub fn with_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// Add the stack file's global environment
    pub fn with_envs(mut self, envs: HashMap<String, String>) -> Self {
        self.env.extend(envs);
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.overrides.get(name).or_else(|| self.env.get(name)) {
            return Some(value.clone());
        }
        if self.use_process_env {
            return std::env::var(name).ok();
        }
        None
    }

    /// Expand every variable reference in `input` (single pass, no re-expansion)
    pub fn interpolate(&self, input: &str) -> Result<String, InterpolationError> {
        let mut error: Option<InterpolationError> = None;

        let result = VARIABLE_PATTERN.replace_all(input, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }
            match self.resolve_capture(caps) {
                Ok(value) => value,
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        if let Some(e) = error {
            return Err(e);
        }

        Ok(result.into_owned())
    }

    fn resolve_capture(&self, caps: &Captures) -> Result<String, InterpolationError> {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        if whole == "$$" {
            return Ok("$".to_string());
        }

        // $NAME
        if let Some(name) = caps.get(4) {
            return self
                .lookup(name.as_str())
                .ok_or_else(|| InterpolationError::UndefinedVariable(name.as_str().to_string()));
        }

        let Some(name) = caps.get(1).map(|m| m.as_str()) else {
            return Err(InterpolationError::Unterminated(whole.to_string()));
        };
        let value = self.lookup(name);
        let word = caps.get(3).map(|m| m.as_str()).unwrap_or_default();

        match caps.get(2).map(|m| m.as_str()) {
            None => value.ok_or_else(|| InterpolationError::UndefinedVariable(name.to_string())),
            // ":-" also replaces empty values, "-" only unset ones
            Some(":-") => Ok(value.filter(|v| !v.is_empty()).unwrap_or_else(|| word.to_string())),
            Some("-") => Ok(value.unwrap_or_else(|| word.to_string())),
            Some(op) => {
                let value = if op == ":?" {
                    value.filter(|v| !v.is_empty())
                } else {
                    value
                };
                value.ok_or_else(|| InterpolationError::RequiredVariable {
                    name: name.to_string(),
                    message: if word.is_empty() {
                        "required variable is not set".to_string()
                    } else {
                        word.to_string()
                    },
                })
            }
        }
    }
}

/// Errors that can occur during interpolation
#[derive(Debug, thiserror::Error)]
pub enum InterpolationError {
    #[error("Undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("Variable {name}: {message}")]
    RequiredVariable { name: String, message: String },

    #[error("Unterminated variable reference in: {0}")]
    Unterminated(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_braced_and_bare_variables() {
        let interp = Interpolator::isolated()
            .with_override("GRAFANA_PORT", "3000")
            .with_override("HOST", "grafana");

        let result = interp
            .interpolate("http://${HOST}:$GRAFANA_PORT/api/health")
            .unwrap();
        assert_eq!(result, "http://grafana:3000/api/health");
    }

    #[test]
    fn test_lookup_order() {
        let mut env = HashMap::new();
        env.insert("LEVEL".to_string(), "info".to_string());
        env.insert("REGION".to_string(), "eu".to_string());

        let interp = Interpolator::isolated()
            .with_envs(env)
            .with_override("LEVEL", "debug");

        assert_eq!(interp.interpolate("$LEVEL-${REGION}").unwrap(), "debug-eu");
    }

    #[test]
    fn test_defaults() {
        let interp = Interpolator::isolated().with_override("EMPTY", "");

        assert_eq!(interp.interpolate("${MISSING:-4317}").unwrap(), "4317");
        assert_eq!(interp.interpolate("${EMPTY:-fallback}").unwrap(), "fallback");
        assert_eq!(interp.interpolate("${EMPTY-fallback}").unwrap(), "");
        assert_eq!(interp.interpolate("${MISSING-fallback}").unwrap(), "fallback");
    }

    #[test]
    fn test_required_variable_message() {
        let interp = Interpolator::isolated();

        let err = interp
            .interpolate("${ADMIN_PASSWORD:?set the grafana admin password}")
            .unwrap_err();
        match err {
            InterpolationError::RequiredVariable { name, message } => {
                assert_eq!(name, "ADMIN_PASSWORD");
                assert_eq!(message, "set the grafana admin password");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_undefined_variable_error() {
        let interp = Interpolator::isolated();
        assert!(matches!(
            interp.interpolate("${NOPE}"),
            Err(InterpolationError::UndefinedVariable(_))
        ));
        assert!(matches!(
            interp.interpolate("$NOPE"),
            Err(InterpolationError::UndefinedVariable(_))
        ));
    }

    #[test]
    fn test_unterminated_reference() {
        let interp = Interpolator::isolated().with_override("A", "1");
        assert!(matches!(
            interp.interpolate("prefix ${A"),
            Err(InterpolationError::Unterminated(_))
        ));
    }

    #[test]
    fn test_dollar_escape_is_not_reexpanded() {
        let interp = Interpolator::isolated().with_override("A", "1");
        assert_eq!(interp.interpolate("cost: $$5 and $${A}").unwrap(), "cost: $5 and ${A}");
    }

    #[test]
    fn test_no_interpolation_needed() {
        let interp = Interpolator::isolated();
        assert_eq!(interp.interpolate("plain string").unwrap(), "plain string");
    }
}
