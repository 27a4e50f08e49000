//! Template loading and placeholder substitution.
//!
//! Templates are LaTeX documents with `{{ key }}` slots. Rendering is pure:
//! it only reads the template and the record's values.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::domain::record::SubstitutionValue;
use crate::error::{Result, TexpostError};

static PLACEHOLDER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.-]*)\s*\}\}").expect("valid placeholder regex")
});

/// A parsed template, shared read-only by every record in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    text: String,
    /// Placeholder keys in order of first appearance, without duplicates.
    placeholders: Vec<String>,
}

/// Template text with every placeholder substituted for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSource {
    pub text: String,
}

impl Template {
    /// Parse template text and verify it mentions every required placeholder.
    pub fn parse(
        name: impl Into<String>,
        text: impl Into<String>,
        required: &[String],
    ) -> Result<Self> {
        let name = name.into();
        let text = text.into();
        if text.trim().is_empty() {
            return Err(TexpostError::TemplateInvalid {
                name,
                reason: "template is empty".to_string(),
            });
        }

        let placeholders = placeholders_in(&text);
        let absent: Vec<&str> = required
            .iter()
            .filter(|key| !placeholders.contains(key))
            .map(String::as_str)
            .collect();
        if !absent.is_empty() {
            return Err(TexpostError::TemplateInvalid {
                name,
                reason: format!("required placeholder(s) not present: {}", absent.join(", ")),
            });
        }

        Ok(Self {
            name,
            text,
            placeholders,
        })
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Keys the template needs that `values` does not provide, in template order.
    pub fn missing_keys(&self, values: &BTreeMap<String, SubstitutionValue>) -> Vec<String> {
        self.placeholders
            .iter()
            .filter(|key| !values.contains_key(key.as_str()))
            .cloned()
            .collect()
    }
}

fn placeholders_in(text: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for caps in PLACEHOLDER_PATTERN.captures_iter(text) {
        let key = &caps[1];
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
    }
    keys
}

/// Keys referenced by `text` that `values` does not provide.
pub fn missing_keys_in(text: &str, values: &BTreeMap<String, SubstitutionValue>) -> Vec<String> {
    placeholders_in(text)
        .into_iter()
        .filter(|key| !values.contains_key(key))
        .collect()
}

/// Substitute every placeholder in the template for the document source.
///
/// Text values are escaped for LaTeX, numbers are written verbatim and markup
/// is inserted unmodified.
pub fn render(
    template: &Template,
    values: &BTreeMap<String, SubstitutionValue>,
) -> Result<RenderedSource> {
    let text = substitute(&template.text, values, |value| match value {
        SubstitutionValue::Text(s) => escape_latex(s),
        SubstitutionValue::Number(n) => n.to_string(),
        SubstitutionValue::Markup { markup } => markup.clone(),
    })?;
    Ok(RenderedSource { text })
}

/// Substitute placeholders without escaping, for mail subjects and bodies.
pub fn render_plain(text: &str, values: &BTreeMap<String, SubstitutionValue>) -> Result<String> {
    substitute(text, values, |value| match value {
        SubstitutionValue::Text(s) => s.clone(),
        SubstitutionValue::Number(n) => n.to_string(),
        SubstitutionValue::Markup { markup } => markup.clone(),
    })
}

fn substitute<F>(
    text: &str,
    values: &BTreeMap<String, SubstitutionValue>,
    format: F,
) -> Result<String>
where
    F: Fn(&SubstitutionValue) -> String,
{
    let missing = missing_keys_in(text, values);
    if !missing.is_empty() {
        return Err(TexpostError::MissingSubstitution(missing.join(", ")));
    }

    let rendered = PLACEHOLDER_PATTERN.replace_all(text, |caps: &Captures| {
        values
            .get(&caps[1])
            .map(&format)
            .unwrap_or_default()
    });
    Ok(rendered.into_owned())
}

/// Escape LaTeX special characters in plain text.
pub fn escape_latex(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + text.len() / 8);
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str(r"\textbackslash{}"),
            '~' => escaped.push_str(r"\textasciitilde{}"),
            '^' => escaped.push_str(r"\^{}"),
            '%' | '$' | '#' | '_' | '{' | '}' | '&' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}
