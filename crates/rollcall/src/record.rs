//! Core record types for rollcall.
//!
//! This module defines the attendance record that flows from capture,
//! through the local queue, to the server.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, SubsecRound, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier of the student a record belongs to.
///
/// The server issues numeric ids, but the value is otherwise opaque to the
/// client and is forwarded as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StudentId {
    /// Numeric id as issued by the server.
    Numeric(i64),
    /// Any other textual id.
    Text(String),
}

impl StudentId {
    /// Parse an id, preferring the numeric form.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        raw.parse::<i64>()
            .map_or_else(|_| Self::Text(raw.to_string()), Self::Numeric)
    }
}

impl std::fmt::Display for StudentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Numeric(id) => write!(f, "{id}"),
            Self::Text(id) => write!(f, "{id}"),
        }
    }
}

/// Coordinates at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl Location {
    /// Create a location, rejecting out-of-range or non-finite coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] if either coordinate is out of range.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::invalid_record(format!(
                "latitude out of range: {latitude}"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::invalid_record(format!(
                "longitude out of range: {longitude}"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// A single attendance mark with its evidence.
///
/// Records are immutable once created; the capture adapter decides whether
/// a record is submitted immediately or queued, and sets `is_offline`
/// accordingly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    /// When the mark was captured.
    #[serde(with = "timestamp_millis")]
    pub timestamp: DateTime<Utc>,

    /// The student the mark belongs to, if it could be resolved.
    pub student_id: Option<StudentId>,

    /// Still frame as a base64 `data:` URL.
    pub image: String,

    /// Where the mark was captured; serialized as `latitude`/`longitude`.
    #[serde(flatten)]
    pub location: Option<Location>,

    /// Whether the record was produced while offline.
    #[serde(default)]
    pub is_offline: bool,
}

fn image_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^data:image/[A-Za-z0-9.+-]+;base64,[A-Za-z0-9+/]").expect("valid regex")
    })
}

impl AttendanceRecord {
    /// Create a record captured now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] if the image is not a base64 data URL.
    pub fn new(
        student_id: Option<StudentId>,
        image: String,
        location: Option<Location>,
    ) -> Result<Self> {
        Self::captured_at(Utc::now(), student_id, image, location)
    }

    /// Create a record with an explicit capture time.
    ///
    /// The timestamp is truncated to millisecond precision, which is what
    /// the wire format carries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] if the image is not a base64 data URL.
    pub fn captured_at(
        timestamp: DateTime<Utc>,
        student_id: Option<StudentId>,
        image: String,
        location: Option<Location>,
    ) -> Result<Self> {
        if !image_pattern().is_match(&image) {
            return Err(Error::invalid_record(
                "image must be a non-empty base64 data URL",
            ));
        }
        Ok(Self {
            timestamp: timestamp.trunc_subsecs(3),
            student_id,
            image,
            location,
            is_offline: false,
        })
    }

    /// Return a copy of this record with the offline flag set.
    #[must_use]
    pub fn offline(mut self, is_offline: bool) -> Self {
        self.is_offline = is_offline;
        self
    }

    /// Encode raw image bytes as a `data:` URL.
    #[must_use]
    pub fn encode_image(mime: &str, bytes: &[u8]) -> String {
        format!("data:{mime};base64,{}", STANDARD.encode(bytes))
    }

    /// BLAKE3 hash of the record's wire representation.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.timestamp_string().as_bytes());
        hasher.update(&[0]);
        if let Some(id) = &self.student_id {
            hasher.update(id.to_string().as_bytes());
        }
        hasher.update(&[0]);
        hasher.update(self.image.as_bytes());
        hasher.update(&[0]);
        if let Some(loc) = self.location {
            hasher.update(&loc.latitude.to_le_bytes());
            hasher.update(&loc.longitude.to_le_bytes());
        }
        hasher.update(&[u8::from(self.is_offline)]);
        hasher.finalize().to_hex().to_string()
    }

    /// The timestamp exactly as it goes over the wire.
    #[must_use]
    pub fn timestamp_string(&self) -> String {
        timestamp_millis::format(&self.timestamp)
    }

    /// Size of the encoded image in bytes.
    #[must_use]
    pub fn image_len(&self) -> usize {
        self.image.len()
    }
}

/// RFC 3339 with millisecond precision and a `Z` suffix.
pub(crate) mod timestamp_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
