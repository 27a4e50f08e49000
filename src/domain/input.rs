//! Input documents found in the data directory.
//!
//! Two shapes are accepted: a record input carrying placeholder values
//! directly, and a captured mail request whose body is split into paragraphs
//! for the letter template.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::domain::record::{RecordData, RecordId, SubstitutionValue};
use crate::error::{Result, TexpostError};
use crate::template::escape_latex;

const DEFAULT_MAIL_SUBJECT: &str = "No Subject";
const DEFAULT_MAIL_BODY: &str = "No body content";

/// `"a@example.com"` or `["a@example.com", ...]`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordInput {
    id: Option<String>,
    to: OneOrMany,
    subject: Option<String>,
    body: Option<String>,
    body_html: Option<String>,
    template: Option<String>,
    #[serde(default)]
    values: BTreeMap<String, SubstitutionValue>,
}

/// `[display name, address]`.
type AddressPair = (String, String);

#[derive(Debug, Deserialize)]
struct MailRequest {
    subject: Option<String>,
    #[serde(default)]
    from: Vec<AddressPair>,
    #[serde(default)]
    cc: Option<Vec<AddressPair>>,
    #[serde(default)]
    bcc: Option<Vec<AddressPair>>,
    text: Option<String>,
    html: Option<String>,
}

/// Parse one input file into record data.
///
/// Errors are always `InvalidRecord`; the caller quarantines the file.
pub fn parse_record(path: &Path, raw: &str) -> Result<RecordData> {
    let invalid = |reason: String| TexpostError::InvalidRecord {
        path: path.to_path_buf(),
        reason,
    };

    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| invalid(format!("not valid JSON: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| invalid("top-level value must be an object".to_string()))?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let data = if object.contains_key("from") && !object.contains_key("values") {
        let request: MailRequest = serde_json::from_value(value)
            .map_err(|e| invalid(format!("malformed mail request: {}", e)))?;
        from_mail_request(request, &stem)
    } else {
        let input: RecordInput = serde_json::from_value(value)
            .map_err(|e| invalid(format!("malformed record: {}", e)))?;
        from_record_input(input, &stem).map_err(invalid)?
    };

    let data = RecordData {
        source_file: path.to_path_buf(),
        ..data
    };

    if data.recipients.is_empty() {
        return Err(invalid("no recipients".to_string()));
    }
    Ok(data)
}

fn from_record_input(input: RecordInput, stem: &str) -> std::result::Result<RecordData, String> {
    if let Some(template) = &input.template
        && !is_plain_file_name(template)
    {
        return Err(format!("template '{}' must be a plain file name", template));
    }

    let recipients = dedup(
        input
            .to
            .into_vec()
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty()),
    );

    Ok(RecordData {
        id: RecordId::sanitized(input.id.as_deref().unwrap_or(stem)),
        recipients,
        subject: input.subject,
        body: input.body,
        body_html: input.body_html,
        template: input.template,
        values: input.values,
        source_file: Default::default(),
    })
}

fn from_mail_request(request: MailRequest, stem: &str) -> RecordData {
    // An explicit subject is kept even when empty.
    let subject = request
        .subject
        .unwrap_or_else(|| DEFAULT_MAIL_SUBJECT.to_string());

    // Only an empty text part falls back to html; blank text stays and is
    // replaced by the default body after trimming.
    let body = request
        .text
        .filter(|t| !t.is_empty())
        .or(request.html.filter(|h| !h.is_empty()))
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| DEFAULT_MAIL_BODY.to_string());

    let recipients = dedup(
        request
            .from
            .into_iter()
            .chain(request.cc.unwrap_or_default())
            .chain(request.bcc.unwrap_or_default())
            .map(|(_, address)| address.trim().to_string())
            .filter(|a| !a.is_empty()),
    );

    let (first, second, rest) = split_paragraphs(&body);
    let markup = |markup: String| SubstitutionValue::Markup { markup };
    let values = BTreeMap::from([
        ("SUBJECT".to_string(), SubstitutionValue::Text(subject)),
        ("FIRST_PARAGRAPH".to_string(), markup(first)),
        ("SECOND_PARAGRAPH".to_string(), markup(second)),
        ("BODY".to_string(), markup(rest)),
    ]);

    RecordData {
        id: RecordId::sanitized(stem),
        recipients,
        // Resolved from SUBJECT at render time so user text is never parsed
        // for placeholders.
        subject: Some("PDF: {{SUBJECT}}".to_string()),
        body: None,
        body_html: None,
        template: None,
        values,
        source_file: Default::default(),
    }
}

/// Split text into the first paragraph, the second, and the rest, escaped
/// for LaTeX.
///
/// Blank and whitespace-only lines separate paragraphs. Line breaks inside
/// the first two paragraphs become `\\`; the rest is joined by blank lines.
pub fn split_paragraphs(text: &str) -> (String, String, String) {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    for line in normalized.split('\n') {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    let mut iter = paragraphs.into_iter();
    let first = iter.next().unwrap_or_default();
    let second = iter.next().unwrap_or_default();
    let rest: Vec<String> = iter.collect();

    (
        escape_latex(&first).replace('\n', r"\\"),
        escape_latex(&second).replace('\n', r"\\"),
        escape_latex(&rest.join("\n\n")),
    )
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = Vec::new();
    for item in items {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

fn is_plain_file_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path.components().count() == 1
        && matches!(path.components().next(), Some(std::path::Component::Normal(_)))
}
