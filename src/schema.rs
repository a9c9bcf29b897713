//! Recursive schema descriptors with structural validation and a canonical
//! textual form.
//!
//! A [`Schema`] describes the shape of a dynamic event value
//! (`serde_json::Value`). Schemas do two jobs:
//!
//! - **Validation**: [`Schema::validate`] checks a value structurally and
//!   reports failures as a tree of [`SchemaError`]s with field-path-level
//!   diagnostics.
//! - **Identity**: [`Schema::render`] produces a canonical string that is
//!   equal for two schemas iff they are structurally equal. The rendered
//!   form feeds the content-addressed topic names, so it must stay stable.

use serde_json::Value;

/// A recursive structural schema for dynamic event values.
///
/// `Bytes` values are represented in JSON as arrays of integers in
/// `0..=255` (the `serde` encoding of `Vec<u8>`). Optional fields inside
/// records mean the key may be absent or null.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// A UTF-8 string.
    String,
    /// A JSON number (integer or float).
    Number,
    /// A boolean.
    Boolean,
    /// A byte array, encoded as a JSON array of integers `0..=255`.
    Bytes,
    /// The inner schema, or null / absent (inside a record).
    Optional(Box<Schema>),
    /// A homogeneous array of the inner schema.
    Array(Box<Schema>),
    /// An ordered mapping of field names to schemas.
    Record(Vec<(String, Schema)>),
    /// Any one of the member schemas. Always kept flat: unions never
    /// contain unions.
    Union(Vec<Schema>),
}

impl Schema {
    /// String schema.
    pub fn string() -> Self {
        Schema::String
    }

    /// Number schema.
    pub fn number() -> Self {
        Schema::Number
    }

    /// Boolean schema.
    pub fn boolean() -> Self {
        Schema::Boolean
    }

    /// Byte-array schema.
    pub fn bytes() -> Self {
        Schema::Bytes
    }

    /// Wrap a schema so that null (or an absent record key) also validates.
    pub fn optional(inner: Schema) -> Self {
        Schema::Optional(Box::new(inner))
    }

    /// An array of `element` values.
    pub fn array(element: Schema) -> Self {
        Schema::Array(Box::new(element))
    }

    /// An ordered record of named fields.
    ///
    /// # Panics
    ///
    /// Panics if any field name is empty; record keys are non-empty by
    /// invariant.
    pub fn record<N: Into<String>>(fields: impl IntoIterator<Item = (N, Schema)>) -> Self {
        let fields: Vec<(String, Schema)> = fields
            .into_iter()
            .map(|(name, schema)| (name.into(), schema))
            .collect();
        assert!(
            fields.iter().all(|(name, _)| !name.is_empty()),
            "record field names must be non-empty"
        );
        Schema::Record(fields)
    }

    /// Build a flat union of `self` and `other`.
    ///
    /// Nested unions on either side are flattened so the canonical string
    /// form stays stable regardless of how the union was assembled.
    pub fn or(self, other: Schema) -> Self {
        let mut members = Vec::new();
        let mut push = |schema: Schema, members: &mut Vec<Schema>| match schema {
            Schema::Union(inner) => members.extend(inner),
            other => members.push(other),
        };
        push(self, &mut members);
        push(other, &mut members);
        Schema::Union(members)
    }

    /// The declared fields, if this schema is a record.
    pub fn record_fields(&self) -> Option<&[(String, Schema)]> {
        match self {
            Schema::Record(fields) => Some(fields),
            _ => None,
        }
    }

    /// Canonical textual form of this schema.
    ///
    /// Two schemas render identically iff they are structurally equal.
    /// Records format as a two-space-indented block with fields in
    /// insertion order:
    ///
    /// ```text
    /// {
    ///   id: String
    ///   tags: String[]
    /// }
    /// ```
    ///
    /// Unions render as `A | B`, arrays as `T[]`, optionals as `T?`. A
    /// union nested inside an array or optional is parenthesized
    /// (`(A | B)[]`) to keep the form injective.
    pub fn render(&self) -> String {
        self.render_at(0)
    }

    fn render_at(&self, level: usize) -> String {
        match self {
            Schema::String => "String".to_string(),
            Schema::Number => "Number".to_string(),
            Schema::Boolean => "Boolean".to_string(),
            Schema::Bytes => "Bytes".to_string(),
            Schema::Optional(inner) => format!("{}?", inner.render_grouped(level)),
            Schema::Array(element) => format!("{}[]", element.render_grouped(level)),
            Schema::Union(members) => members
                .iter()
                .map(|m| m.render_at(level))
                .collect::<Vec<_>>()
                .join(" | "),
            Schema::Record(fields) => {
                let field_pad = "  ".repeat(level + 1);
                let mut out = String::from("{\n");
                for (name, schema) in fields {
                    out.push_str(&field_pad);
                    out.push_str(name);
                    out.push_str(": ");
                    out.push_str(&schema.render_at(level + 1));
                    out.push('\n');
                }
                out.push_str(&"  ".repeat(level));
                out.push('}');
                out
            }
        }
    }

    /// Like [`render_at`](Schema::render_at), but parenthesizes unions so
    /// `T?` and `T[]` suffixes bind unambiguously.
    fn render_grouped(&self, level: usize) -> String {
        match self {
            Schema::Union(_) => format!("({})", self.render_at(level)),
            _ => self.render_at(level),
        }
    }

    /// Validate a value against this schema.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] describing every mismatch. Containers
    /// (records, arrays) with two or more failing members collect them
    /// into a single error whose cause list preserves order; a single
    /// failure propagates directly.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        match self {
            Schema::String => match value {
                Value::String(_) => Ok(()),
                other => Err(SchemaError::mismatch("String", other)),
            },
            Schema::Number => match value {
                Value::Number(_) => Ok(()),
                other => Err(SchemaError::mismatch("Number", other)),
            },
            Schema::Boolean => match value {
                Value::Bool(_) => Ok(()),
                other => Err(SchemaError::mismatch("Boolean", other)),
            },
            Schema::Bytes => validate_bytes(value),
            Schema::Optional(inner) => {
                if value.is_null() {
                    Ok(())
                } else {
                    inner.validate(value)
                }
            }
            Schema::Array(element) => validate_array(element, value),
            Schema::Record(fields) => validate_record(fields, value),
            Schema::Union(members) => validate_union(members, value),
        }
    }
}

fn validate_bytes(value: &Value) -> Result<(), SchemaError> {
    let items = match value {
        Value::Array(items) => items,
        other => return Err(SchemaError::mismatch("Bytes", other)),
    };
    let mut errors = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let ok = item.as_u64().is_some_and(|n| n <= 255);
        if !ok {
            errors.push(SchemaError::new(format!(
                "[{index}]: expected a byte (0-255), got {}",
                preview(item)
            )));
        }
    }
    collect("value does not match Bytes", errors)
}

fn validate_array(element: &Schema, value: &Value) -> Result<(), SchemaError> {
    let items = match value {
        Value::Array(items) => items,
        other => return Err(SchemaError::mismatch("an array", other)),
    };
    let mut errors = Vec::new();
    for (index, item) in items.iter().enumerate() {
        if let Err(err) = element.validate(item) {
            errors.push(err.contextualize(format!("[{index}]")));
        }
    }
    collect("value does not match array schema", errors)
}

fn validate_record(fields: &[(String, Schema)], value: &Value) -> Result<(), SchemaError> {
    let object = match value {
        Value::Object(object) => object,
        other => return Err(SchemaError::mismatch("a record", other)),
    };

    let mut errors = Vec::new();

    // Every present key must be declared and validate against its schema.
    for (key, field_value) in object {
        match fields.iter().find(|(name, _)| name == key) {
            Some((_, field_schema)) => {
                if let Err(err) = field_schema.validate(field_value) {
                    errors.push(err.contextualize(format!("\"{key}\"")));
                }
            }
            None => errors.push(SchemaError::new(format!("unknown field \"{key}\""))),
        }
    }

    // Every required key must be present; optional keys may be absent.
    for (name, field_schema) in fields {
        let required = !matches!(field_schema, Schema::Optional(_));
        if required && !object.contains_key(name) {
            errors.push(SchemaError::new(format!("missing required \"{name}\"")));
        }
    }

    collect("value does not match record schema", errors)
}

fn validate_union(members: &[Schema], value: &Value) -> Result<(), SchemaError> {
    let mut causes = Vec::new();
    for member in members {
        match member.validate(value) {
            Ok(()) => return Ok(()),
            Err(err) => causes.push(err),
        }
    }
    Err(SchemaError::with_causes(
        format!("value matches no variant of {}", Schema::Union(members.to_vec()).render()),
        causes,
    ))
}

/// Zero errors pass, one error propagates directly, two or more collect
/// under a parent whose cause list preserves order.
fn collect(description: &str, mut errors: Vec<SchemaError>) -> Result<(), SchemaError> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(SchemaError::with_causes(description, errors)),
    }
}

/// A short single-line preview of a value for error messages.
fn preview(value: &Value) -> String {
    let mut text = value.to_string();
    const MAX: usize = 48;
    if text.len() > MAX {
        let cut = (0..=MAX).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
        text.truncate(cut);
        text.push('…');
    }
    text
}

/// A schema validation failure, possibly with nested causes.
///
/// Rendered with one extra level of indentation per nesting depth:
///
/// ```text
/// value does not match record schema
///   missing required "title"
///   "count": expected Number, got "three"
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", self.render())]
pub struct SchemaError {
    description: String,
    causes: Vec<SchemaError>,
}

impl SchemaError {
    /// A leaf error with no causes.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            causes: Vec::new(),
        }
    }

    /// An error with an ordered list of nested causes.
    pub fn with_causes(description: impl Into<String>, causes: Vec<SchemaError>) -> Self {
        Self {
            description: description.into(),
            causes,
        }
    }

    fn mismatch(expected: &str, got: &Value) -> Self {
        Self::new(format!("expected {expected}, got {}", preview(got)))
    }

    /// Prefix this error's description with a field or index path segment.
    fn contextualize(self, prefix: String) -> Self {
        Self {
            description: format!("{prefix}: {}", self.description),
            causes: self.causes,
        }
    }

    /// The top-level description of this failure.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Nested causes, in the order they were found.
    pub fn causes(&self) -> &[SchemaError] {
        &self.causes
    }

    fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, level: usize) {
        if level > 0 {
            out.push('\n');
        }
        out.push_str(&"  ".repeat(level));
        out.push_str(&self.description);
        for cause in &self.causes {
            cause.render_into(out, level + 1);
        }
    }
}
