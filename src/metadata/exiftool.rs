//! Typed access to `exiftool -j` output.

use crate::errors::{AppError, AppResult};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

/// One decoded metadata value. exiftool reports the same tag as a number or a
/// string depending on the file, so values are normalized here once.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().map(FieldValue::Number),
            Value::String(s) => Some(FieldValue::Text(s.clone())),
            Value::Bool(b) => Some(FieldValue::Number(if *b { 1.0 } else { 0.0 })),
            Value::Array(items) => Some(FieldValue::List(
                items.iter().filter_map(FieldValue::from_json).collect(),
            )),
            Value::Null | Value::Object(_) => None,
        }
    }

    /// Numeric value; text is accepted when it parses as a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::List(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Number(n) => Some(format_number(*n)),
            FieldValue::List(_) => None,
        }
    }

    /// Every scalar as text; a single value becomes a one-item list.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            FieldValue::List(items) => items.iter().filter_map(FieldValue::as_text).collect(),
            other => other.as_text().into_iter().collect(),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Tags of a single file.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    fields: HashMap<String, FieldValue>,
}

impl ToolOutput {
    /// Parses the JSON array exiftool prints for one file.
    pub fn parse(json: &[u8]) -> AppResult<Self> {
        let value: Value = serde_json::from_slice(json)
            .map_err(|e| AppError::Extraction(format!("exiftool output: {}", e)))?;
        let object = match value {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            Value::Object(_) => value,
            _ => {
                return Err(AppError::Extraction(
                    "exiftool returned no metadata".to_string(),
                ))
            }
        };
        let map = match object {
            Value::Object(map) => map,
            _ => {
                return Err(AppError::Extraction(
                    "exiftool returned an unexpected shape".to_string(),
                ))
            }
        };

        if let Some(Value::String(err)) = map.get("Error") {
            return Err(AppError::Extraction(format!("exiftool: {}", err)));
        }

        let fields = map
            .iter()
            .filter_map(|(k, v)| FieldValue::from_json(v).map(|fv| (k.clone(), fv)))
            .collect();
        Ok(Self { fields })
    }

    pub fn from_fields<I: IntoIterator<Item = (String, FieldValue)>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Numeric field, `None` when absent or not numeric.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(FieldValue::as_f64)
    }

    /// Numeric field that must parse when present.
    pub fn strict_number(&self, key: &str) -> AppResult<Option<f64>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| {
                AppError::Extraction(format!("{} is not numeric: {:?}", key, value))
            }),
        }
    }

    /// Text field; empty strings count as absent.
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(FieldValue::as_text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Text field only when exiftool reported it as a string.
    pub fn string_only(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(FieldValue::Text(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }
}

/// Runs exiftool on one file. `numeric` passes `-n` (no print conversion).
pub fn run(path: &Path, numeric: bool, tags: &[&str]) -> AppResult<ToolOutput> {
    let mut cmd = Command::new("exiftool");
    cmd.arg("-j").arg("-api").arg("largefilesupport=1");
    if numeric {
        cmd.arg("-n");
    }
    for tag in tags {
        cmd.arg(format!("-{}", tag));
    }
    cmd.arg(path);

    let output = cmd
        .output()
        .map_err(|e| AppError::Extraction(format!("failed to run exiftool: {}", e)))?;

    // exiftool exits non-zero for files it cannot read but still prints JSON
    // with an Error tag, which parse() surfaces.
    if output.stdout.is_empty() {
        return Err(AppError::Extraction(format!(
            "exiftool failed on {:?}: {}",
            path,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    ToolOutput::parse(&output.stdout)
}

/// Human lens name from a print-converted run.
pub fn lens_name(path: &Path) -> AppResult<String> {
    let out = run(path, false, &["LensModel", "LensID"])?;
    Ok(out
        .text("LensModel")
        .or_else(|| out.text("LensID"))
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_values() {
        let json = br#"[{
            "SourceFile": "a.jpg",
            "ISO": "ISO 200",
            "Aperture": 2.8,
            "Subject": ["Beach", "Summer Holiday"],
            "Rating": "4",
            "Model": "X100V",
            "Empty": ""
        }]"#;
        let out = ToolOutput::parse(json).expect("parse");

        assert_eq!(out.number("Aperture"), Some(2.8));
        assert_eq!(out.number("Rating"), Some(4.0));
        assert_eq!(out.number("ISO"), None);
        assert!(out.strict_number("ISO").is_err());
        assert_eq!(out.text("Model").as_deref(), Some("X100V"));
        assert_eq!(out.text("Empty"), None);
        assert_eq!(
            out.get("Subject").map(FieldValue::as_list),
            Some(vec!["Beach".to_string(), "Summer Holiday".to_string()])
        );
    }

    #[test]
    fn test_parse_error_tag() {
        let json = br#"[{"SourceFile": "a.jpg", "Error": "File format error"}]"#;
        assert!(matches!(ToolOutput::parse(json), Err(AppError::Extraction(_))));
        assert!(ToolOutput::parse(b"[]").is_err());
        assert!(ToolOutput::parse(b"garbage").is_err());
    }

    #[test]
    fn test_string_only() {
        let out = ToolOutput::from_fields([
            ("Software".to_string(), FieldValue::Number(1.2)),
            ("Title".to_string(), FieldValue::Text("Dusk".into())),
        ]);
        assert_eq!(out.string_only("Software"), None);
        assert_eq!(out.string_only("Title").as_deref(), Some("Dusk"));
        assert_eq!(out.text("Software").as_deref(), Some("1.2"));
    }
}
