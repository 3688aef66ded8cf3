//! Upload ingestion: validate a file and render it as prompt-safe text.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::db::models::FileReference;

/// Size and preview thresholds for uploads.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestLimits {
    /// Uploads above this are rejected outright.
    pub max_file_bytes: u64,
    /// Rendered text above this is accepted with a warning.
    pub soft_content_cap: usize,
    /// CSV data rows shown in the preview.
    pub sample_rows: usize,
    /// CSV files with more data rows than this are previewed only.
    pub large_row_threshold: usize,
    /// JSON arrays with more elements than this are sampled only.
    pub json_array_threshold: usize,
    /// Elements or keys shown in a JSON sample.
    pub json_sample_elements: usize,
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 5 * 1024 * 1024,
            soft_content_cap: 100_000,
            sample_rows: 5,
            large_row_threshold: 100,
            json_array_threshold: 100,
            json_sample_elements: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Text,
    Markdown,
    Json,
    Csv,
    Pdf,
}

impl FileKind {
    /// Classify by MIME type first, then by extension.
    pub fn detect(declared_type: &str, file_name: &str) -> Option<Self> {
        let mime = declared_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let by_mime = match mime.as_str() {
            "text/plain" => Some(FileKind::Text),
            "text/markdown" | "text/x-markdown" => Some(FileKind::Markdown),
            "application/json" => Some(FileKind::Json),
            "text/csv" => Some(FileKind::Csv),
            "application/pdf" => Some(FileKind::Pdf),
            _ => None,
        };
        by_mime.or_else(|| {
            let ext = file_name
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())?;
            match ext.as_str() {
                "txt" => Some(FileKind::Text),
                "md" | "markdown" => Some(FileKind::Markdown),
                "json" => Some(FileKind::Json),
                "csv" => Some(FileKind::Csv),
                "pdf" => Some(FileKind::Pdf),
                _ => None,
            }
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum IngestError {
    #[error("File size {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("Unsupported file type: {0}. Please upload a text, markdown, JSON, CSV, or PDF file.")]
    UnsupportedType(String),
    #[error("Could not parse {file}: {reason}")]
    ParseError { file: String, reason: String },
}

/// Result of a successful ingestion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedFile {
    pub name: String,
    pub kind: FileKind,
    pub content: String,
    pub size_bytes: u64,
    /// Set when the rendered text is long enough that a model may cut it off.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl IngestedFile {
    pub fn into_reference(self) -> FileReference {
        FileReference {
            name: self.name,
            content: self.content,
            uploaded_at: Utc::now(),
            size_bytes: self.size_bytes,
        }
    }
}

pub fn ingest(
    bytes: &[u8],
    declared_type: &str,
    file_name: &str,
    limits: &IngestLimits,
) -> Result<IngestedFile, IngestError> {
    let size = bytes.len() as u64;
    if size > limits.max_file_bytes {
        return Err(IngestError::TooLarge {
            size,
            limit: limits.max_file_bytes,
        });
    }

    let kind = FileKind::detect(declared_type, file_name).ok_or_else(|| {
        IngestError::UnsupportedType(if declared_type.is_empty() {
            file_name.to_string()
        } else {
            declared_type.to_string()
        })
    })?;

    let content = match kind {
        FileKind::Pdf => pdf_placeholder(file_name, size),
        FileKind::Text | FileKind::Markdown => decode(bytes, file_name)?.to_string(),
        FileKind::Json => render_json(decode(bytes, file_name)?, file_name, limits)?,
        FileKind::Csv => render_csv(decode(bytes, file_name)?, file_name, limits)?,
    };

    let warning = (content.len() > limits.soft_content_cap).then(|| {
        format!(
            "{} is {} characters long; the model may truncate it to fit its context window.",
            file_name,
            content.len()
        )
    });
    if let Some(warning) = &warning {
        tracing::warn!(file = file_name, "{}", warning);
    }

    Ok(IngestedFile {
        name: file_name.to_string(),
        kind,
        content,
        size_bytes: size,
        warning,
    })
}

fn decode<'a>(bytes: &'a [u8], file_name: &str) -> Result<&'a str, IngestError> {
    let text = std::str::from_utf8(bytes).map_err(|e| IngestError::ParseError {
        file: file_name.to_string(),
        reason: format!("not valid UTF-8 ({})", e),
    })?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

fn pdf_placeholder(file_name: &str, size: u64) -> String {
    format!(
        "[PDF File: {}, Size: {:.2} KB]",
        file_name,
        size as f64 / 1024.0
    )
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// First few elements of an array, or first few keys of an object.
fn json_sample(value: &Value, count: usize) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().take(count).cloned().collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .take(count)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_json(text: &str, file_name: &str, limits: &IngestLimits) -> Result<String, IngestError> {
    let value: Value = serde_json::from_str(text).map_err(|e| IngestError::ParseError {
        file: file_name.to_string(),
        reason: format!("invalid JSON ({})", e),
    })?;
    let sample = json_sample(&value, limits.json_sample_elements);

    if let Value::Array(items) = &value {
        if items.len() > limits.json_array_threshold {
            return Ok(format!(
                "JSON file: {name}\n\
                 Array with {total} items (sample only, first {shown}):\n\
                 ```json\n{sample}\n```\n\
                 Note: this is a sample only; the remaining {rest} items were not included.",
                name = file_name,
                total = items.len(),
                shown = limits.json_sample_elements.min(items.len()),
                sample = pretty(&sample),
                rest = items.len().saturating_sub(limits.json_sample_elements),
            ));
        }
    }

    let shape = match &value {
        Value::Array(items) => format!("Array with {} items", items.len()),
        Value::Object(map) => format!("Object with {} keys", map.len()),
        _ => "Scalar value".to_string(),
    };

    Ok(format!(
        "JSON file: {name}\n{shape}\n\
         Sample:\n```json\n{sample}\n```\n\n\
         Full content:\n```json\n{full}\n```",
        name = file_name,
        shape = shape,
        sample = pretty(&sample),
        full = pretty(&value),
    ))
}

/// Split one CSV record, honoring double-quoted fields and `""` escapes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(field.trim().to_string());
                field.clear();
            }
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

fn render_csv(text: &str, file_name: &str, limits: &IngestLimits) -> Result<String, IngestError> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or_else(|| IngestError::ParseError {
        file: file_name.to_string(),
        reason: "CSV file is empty".to_string(),
    })?;
    let headers = split_csv_line(header);
    let rows: Vec<&str> = lines.collect();

    let mut out = format!(
        "CSV file: {}\nTotal data rows: {}\nHeaders: {}\n",
        file_name,
        rows.len(),
        headers.join(", ")
    );
    for (i, row) in rows.iter().take(limits.sample_rows).enumerate() {
        out.push_str(&format!("Row {}: {}\n", i + 1, split_csv_line(row).join(", ")));
    }

    let large = rows.len() > limits.large_row_threshold || text.len() > limits.soft_content_cap / 2;
    if large {
        out.push_str(&format!(
            "\nNote: file truncated; showing headers and {} of {} rows.",
            rows.len().min(limits.sample_rows),
            rows.len()
        ));
    } else {
        out.push_str(&format!("\nFull content:\n```csv\n{}\n```", text.trim_end()));
    }
    Ok(out)
}
