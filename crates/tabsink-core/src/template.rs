//! Table-name templates.
//!
//! A template is literal text interleaved with references:
//!
//! - `${field}`: top-level field of the record body
//! - `${/a/b}`: JSON pointer into the record body
//! - `${header:name}`: record header
//!
//! Templates are compiled once when the sink opens, so syntax errors surface
//! as configuration issues rather than per-record failures.

use crate::error::EvaluationError;
use crate::record::Record;
use serde_json::Value;

/// Resolves the target table for a record.
pub trait TableNameResolver: Send + Sync {
    /// Resolve the table name for `record`.
    fn resolve(&self, record: &Record) -> Result<String, EvaluationError>;
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(String),
    Header(String),
}

/// A compiled table-name template.
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    template: String,
    segments: Vec<Segment>,
    case_sensitive: bool,
}

impl TemplateResolver {
    /// Compile a template.
    ///
    /// When `case_sensitive` is false resolved names are lower-cased, so
    /// `Orders` and `orders` map to the same table.
    pub fn compile(template: &str, case_sensitive: bool) -> Result<Self, EvaluationError> {
        let invalid = |message: &str| EvaluationError::InvalidTemplate {
            template: template.to_string(),
            message: message.to_string(),
        };

        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| invalid("unclosed '${'"))?;
            let reference = after[..end].trim();

            if reference.is_empty() {
                return Err(invalid("empty reference '${}'"));
            }
            if reference.contains("${") {
                return Err(invalid("nested references are not supported"));
            }

            let segment = match reference.strip_prefix("header:") {
                Some(name) if name.trim().is_empty() => {
                    return Err(invalid("header reference without a name"))
                }
                Some(name) => Segment::Header(name.trim().to_string()),
                None => Segment::Field(reference.to_string()),
            };
            segments.push(segment);
            rest = &after[end + 1..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        if segments.is_empty() {
            return Err(invalid("template is empty"));
        }

        Ok(Self {
            template: template.to_string(),
            segments,
            case_sensitive,
        })
    }

    /// The template source text.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Whether the template contains no references.
    pub fn is_constant(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    fn scalar_text(field: &str, value: &Value) -> Result<String, EvaluationError> {
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Null | Value::Array(_) | Value::Object(_) => Err(EvaluationError::NotScalar {
                field: field.to_string(),
            }),
        }
    }
}

impl TableNameResolver for TemplateResolver {
    fn resolve(&self, record: &Record) -> Result<String, EvaluationError> {
        let mut name = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => name.push_str(text),
                Segment::Field(field) => {
                    let value = record
                        .get(field)
                        .ok_or_else(|| EvaluationError::MissingField {
                            field: field.clone(),
                        })?;
                    name.push_str(&Self::scalar_text(field, value)?);
                }
                Segment::Header(header) => {
                    let value =
                        record
                            .header(header)
                            .ok_or_else(|| EvaluationError::MissingHeader {
                                header: header.clone(),
                            })?;
                    name.push_str(value);
                }
            }
        }

        let name = name.trim();
        if name.is_empty() {
            return Err(EvaluationError::EmptyTableName {
                template: self.template.clone(),
            });
        }

        Ok(if self.case_sensitive {
            name.to_string()
        } else {
            name.to_lowercase()
        })
    }
}
