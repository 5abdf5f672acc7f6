//! Response parsing
//!
//! A generation call must yield one `{path, content}` object (per-file calls) or an array of
//! them (the combined foundation call). Extraction strategies, in order: the whole response as
//! JSON, the first fenced code block, then the first balanced `{...}` / `[...]` span.

use crate::error::ParseError;
use crate::job::GeneratedFile;
use crate::workspace::normalize_path;
use serde_json::Value;

/// Extract the JSON payload of a completion.
pub fn extract_json(content: &str) -> Result<Value, ParseError> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    for block in fenced_blocks(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block.trim()) {
            return Ok(value);
        }
    }

    if let Some(span) = first_balanced_span(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(span) {
            return Ok(value);
        }
    }

    Err(ParseError::NoJson { len: content.len() })
}

/// Parse a per-file response. The planned path wins over whatever path the model echoed.
pub fn parse_file_response(content: &str, planned_path: &str) -> Result<GeneratedFile, ParseError> {
    let value = extract_json(content)?;
    let object = match value {
        Value::Object(mut map) => match map.remove("files") {
            Some(files) => single_file(files)?,
            None => Value::Object(map),
        },
        items @ Value::Array(_) => single_file(items)?,
        other => {
            return Err(ParseError::Shape(format!(
                "expected an object, got {}",
                json_kind(&other)
            )))
        }
    };
    let mut file = file_from_value(&object)?;
    file.path = planned_path.to_string();
    Ok(file)
}

/// Parse a combined response into every file it contains.
pub fn parse_file_array(content: &str) -> Result<Vec<GeneratedFile>, ParseError> {
    let value = extract_json(content)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("files") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ParseError::Shape(format!(
                    "'files' must be an array, got {}",
                    json_kind(&other)
                )))
            }
            None => vec![Value::Object(map)],
        },
        other => {
            return Err(ParseError::Shape(format!(
                "expected an array, got {}",
                json_kind(&other)
            )))
        }
    };
    if items.is_empty() {
        return Err(ParseError::Shape("response contains no files".to_string()));
    }
    items.iter().map(file_from_value).collect()
}

fn single_file(value: Value) -> Result<Value, ParseError> {
    match value {
        Value::Array(mut items) if items.len() == 1 => Ok(items.remove(0)),
        Value::Array(items) => Err(ParseError::Shape(format!(
            "expected exactly one file, got {}",
            items.len()
        ))),
        other => Err(ParseError::Shape(format!(
            "expected a file list, got {}",
            json_kind(&other)
        ))),
    }
}

fn file_from_value(value: &Value) -> Result<GeneratedFile, ParseError> {
    let path = value
        .get("path")
        .and_then(Value::as_str)
        .map(normalize_path)
        .filter(|path| !path.is_empty())
        .ok_or_else(|| ParseError::Shape("file entry without 'path'".to_string()))?;
    let content = value
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| ParseError::Shape(format!("file entry {} without 'content'", path)))?;
    if content.trim().is_empty() {
        return Err(ParseError::EmptyContent(path));
    }
    Ok(GeneratedFile {
        path,
        content: content.to_string(),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Bodies of ``` fenced blocks, language tag stripped.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => break,
        }
    }
    blocks
}

/// First `{...}` or `[...]` span whose brackets balance, skipping brackets inside strings.
fn first_balanced_span(text: &str) -> Option<&str> {
    let start = text.find(|c| c == '{' || c == '[')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
