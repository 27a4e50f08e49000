//! Environment variable interpolation for config files.
//!
//! Supports the following syntax:
//! - `${VAR}` - substitute with env var value, error if missing
//! - `${VAR:-default}` - use default if VAR is unset OR empty
//! - `${VAR-default}` - use default only if VAR is unset (empty is OK)
//! - `$$` - escape sequence for literal `$`
//!
//! Bare `$VAR` is left alone: mail bodies and LaTeX snippets in the config
//! routinely contain dollar signs.

use std::env;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$                           # escaped dollar
        |
        \$\{
            ([A-Za-z_][A-Za-z0-9_]*)   # name
            (?:
                (:?-)                  # :- or -
                ([^}]*)                # default
            )?
        \}
        ",
    )
    .expect("valid env var regex")
});

/// Interpolate environment variables in the given text.
///
/// Every problem is collected so the operator sees all missing variables at
/// once.
pub fn interpolate(input: &str) -> Result<String, Vec<String>> {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
        let whole = &caps[0];
        if whole == "$$" {
            return "$".to_string();
        }

        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let syntax = caps.get(2).map(|m| m.as_str());
        let default = caps.get(3).map(|m| m.as_str());

        match env::var(name) {
            Ok(value) if value.contains('\n') || value.contains('\r') => {
                errors.push(format!(
                    "environment variable '{}' contains newlines, which is not allowed",
                    name
                ));
                whole.to_string()
            }
            Ok(value) if value.is_empty() && syntax == Some(":-") => {
                default.unwrap_or_default().to_string()
            }
            Ok(value) => value,
            Err(_) => match default {
                Some(default) => default.to_string(),
                None => {
                    errors.push(format!("environment variable '{}' is not set", name));
                    whole.to_string()
                }
            },
        }
    });

    if errors.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env_vars<F, R>(vars: &[(&str, Option<&str>)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let originals: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();

        // SAFETY: each test uses its own variable names and restores them.
        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        let result = f();

        // SAFETY: restoring the original environment.
        for (key, original) in originals {
            match original {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        result
    }

    #[test]
    fn test_braced_substitution() {
        with_env_vars(&[("TEXPOST_TEST_HOST", Some("smtp.example.com"))], || {
            assert_eq!(
                interpolate(r#"server = "${TEXPOST_TEST_HOST}""#).unwrap(),
                r#"server = "smtp.example.com""#
            );
        });
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        with_env_vars(
            &[("TEXPOST_TEST_MISS1", None), ("TEXPOST_TEST_MISS2", None)],
            || {
                let errors =
                    interpolate("${TEXPOST_TEST_MISS1} ${TEXPOST_TEST_MISS2}").unwrap_err();
                assert_eq!(errors.len(), 2);
                assert!(errors[0].contains("TEXPOST_TEST_MISS1"));
            },
        );
    }

    #[test]
    fn test_defaults() {
        with_env_vars(
            &[
                ("TEXPOST_TEST_UNSET", None),
                ("TEXPOST_TEST_EMPTY", Some("")),
            ],
            || {
                assert_eq!(interpolate("${TEXPOST_TEST_UNSET:-587}").unwrap(), "587");
                assert_eq!(interpolate("${TEXPOST_TEST_EMPTY:-587}").unwrap(), "587");
                assert_eq!(interpolate("${TEXPOST_TEST_EMPTY-587}").unwrap(), "");
            },
        );
    }

    #[test]
    fn test_dollar_signs_left_alone() {
        assert_eq!(interpolate("costs $$5 or $HOME").unwrap(), "costs $5 or $HOME");
    }

    #[test]
    fn test_newline_injection_blocked() {
        with_env_vars(&[("TEXPOST_TEST_NL", Some("a\nb"))], || {
            let errors = interpolate("${TEXPOST_TEST_NL}").unwrap_err();
            assert!(errors[0].contains("newlines"));
        });
    }
}
