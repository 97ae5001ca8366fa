use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};

/// Form field that carries the client's first name into the identity triple.
pub const FIELD_FIRST_NAME: &str = "firstName";
/// Form field that carries the client's last name into the identity triple.
pub const FIELD_LAST_NAME: &str = "lastName";
/// Form field that carries the exam date into the identity triple.
pub const FIELD_TEST_DATE: &str = "testDate";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IntakeError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("client {0} not found")]
    ClientNotFound(ClientId),
}

/// Row id of a client record. Stable for the lifetime of the database file.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(transparent)]
pub struct ClientId(pub i64);

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The deduplication triple. Two submissions with byte-identical fields are
/// the same client; matching is exact and case-sensitive, and empty strings
/// are legal members of the triple.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClientIdentity {
    pub first_name: String,
    pub last_name: String,
    pub exam_date: String,
}

impl ClientIdentity {
    /// Extracts the identity triple from raw form fields. Absent fields
    /// become empty strings, non-string values their coerced text.
    #[must_use]
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        let field_text = |name: &str| {
            fields
                .get(name)
                .map(coerce_to_text)
                .unwrap_or_default()
        };

        Self {
            first_name: field_text(FIELD_FIRST_NAME),
            last_name: field_text(FIELD_LAST_NAME),
            exam_date: field_text(FIELD_TEST_DATE),
        }
    }
}

impl Display for ClientIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.first_name, self.last_name, self.exam_date
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClientSummary {
    pub client_id: ClientId,
    pub first_name: String,
    pub last_name: String,
    pub exam_date: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// One validated intake submission: the full key-value mapping as received,
/// identity fields included.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Submission {
    fields: Map<String, Value>,
}

impl Submission {
    /// Validates a raw form mapping before it reaches the store.
    ///
    /// # Errors
    /// Returns [`IntakeError::Validation`] when the mapping is empty or any
    /// key is blank. Field *values* are never validated; all of them are
    /// storable after text coercion.
    pub fn new(fields: Map<String, Value>) -> Result<Self, IntakeError> {
        if fields.is_empty() {
            return Err(IntakeError::Validation(
                "submission MUST contain at least one field".to_string(),
            ));
        }

        if fields.keys().any(|key| key.trim().is_empty()) {
            return Err(IntakeError::Validation(
                "field keys cannot be empty".to_string(),
            ));
        }

        Ok(Self { fields })
    }

    /// Parses a JSON document into a submission. The document must be an
    /// object; every other JSON shape is rejected.
    ///
    /// # Errors
    /// Returns [`IntakeError::Validation`] on non-object JSON or on the
    /// conditions of [`Submission::new`].
    pub fn from_value(value: Value) -> Result<Self, IntakeError> {
        match value {
            Value::Object(fields) => Self::new(fields),
            other => Err(IntakeError::Validation(format!(
                "submission MUST be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    #[must_use]
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::from_fields(&self.fields)
    }

    /// Every field as `(key, coerced text)`, identity fields included. The
    /// identity triple is stored twice on purpose: once as client columns,
    /// once as ordinary answer rows.
    pub fn answers(&self) -> impl Iterator<Item = (&str, String)> {
        self.fields
            .iter()
            .map(|(key, value)| (key.as_str(), coerce_to_text(value)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Collapses any JSON value to the text that gets stored. Strings keep their
/// raw contents; everything else keeps its compact JSON form. Lossy by
/// design: a boolean round-trips as `"true"`, never as a boolean again.
#[must_use]
pub fn coerce_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parses an RFC3339 timestamp, requiring the UTC offset.
///
/// # Errors
/// Returns [`IntakeError::Validation`] when parsing fails or the offset is
/// not Z.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, IntakeError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| IntakeError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(IntakeError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`IntakeError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, IntakeError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            IntakeError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
