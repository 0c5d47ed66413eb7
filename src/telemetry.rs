use chrono::NaiveDateTime;
use std::collections::HashMap;
use thiserror::Error;

/// Value the GPS daemon client uses for a field it has no data for.
pub const UNAVAILABLE_MARKER: &str = "n/a";

/// Textual TPV timestamp layout, e.g. `2024-01-01T00:00:00.000000Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

pub const FIELD_COUNT: usize = 13;

/// Every field of the canonical position record, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldName {
    Time,
    Lat,
    Lon,
    Alt,
    Epx,
    Epy,
    Epv,
    Track,
    Speed,
    Climb,
    Epd,
    Eps,
    Epc,
}

impl FieldName {
    pub const ALL: [FieldName; FIELD_COUNT] = [
        FieldName::Time,
        FieldName::Lat,
        FieldName::Lon,
        FieldName::Alt,
        FieldName::Epx,
        FieldName::Epy,
        FieldName::Epv,
        FieldName::Track,
        FieldName::Speed,
        FieldName::Climb,
        FieldName::Epd,
        FieldName::Eps,
        FieldName::Epc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldName::Time => "time",
            FieldName::Lat => "lat",
            FieldName::Lon => "lon",
            FieldName::Alt => "alt",
            FieldName::Epx => "epx",
            FieldName::Epy => "epy",
            FieldName::Epv => "epv",
            FieldName::Track => "track",
            FieldName::Speed => "speed",
            FieldName::Climb => "climb",
            FieldName::Epd => "epd",
            FieldName::Eps => "eps",
            FieldName::Epc => "epc",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|field| field.as_str() == name)
    }
}

impl core::fmt::Display for FieldName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical telemetry unit. `None` means the source had no value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PositionRecord {
    pub time: Option<f64>,   // seconds since the Unix epoch
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub epx: Option<f64>,
    pub epy: Option<f64>,
    pub epv: Option<f64>,
    pub track: Option<f64>,
    pub speed: Option<f64>,
    pub climb: Option<f64>,
    pub epd: Option<f64>,
    pub eps: Option<f64>,
    pub epc: Option<f64>,
}

impl PositionRecord {
    pub fn get(&self, field: FieldName) -> Option<f64> {
        match field {
            FieldName::Time => self.time,
            FieldName::Lat => self.lat,
            FieldName::Lon => self.lon,
            FieldName::Alt => self.alt,
            FieldName::Epx => self.epx,
            FieldName::Epy => self.epy,
            FieldName::Epv => self.epv,
            FieldName::Track => self.track,
            FieldName::Speed => self.speed,
            FieldName::Climb => self.climb,
            FieldName::Epd => self.epd,
            FieldName::Eps => self.eps,
            FieldName::Epc => self.epc,
        }
    }

    pub(crate) fn set(&mut self, field: FieldName, value: Option<f64>) {
        let slot = match field {
            FieldName::Time => &mut self.time,
            FieldName::Lat => &mut self.lat,
            FieldName::Lon => &mut self.lon,
            FieldName::Alt => &mut self.alt,
            FieldName::Epx => &mut self.epx,
            FieldName::Epy => &mut self.epy,
            FieldName::Epv => &mut self.epv,
            FieldName::Track => &mut self.track,
            FieldName::Speed => &mut self.speed,
            FieldName::Climb => &mut self.climb,
            FieldName::Epd => &mut self.epd,
            FieldName::Eps => &mut self.eps,
            FieldName::Epc => &mut self.epc,
        };
        *slot = value;
    }

    /// Number of fields carrying a value.
    pub fn present_fields(&self) -> usize {
        FieldName::ALL.iter().filter(|field| self.get(**field).is_some()).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Number(f64),
    Text(String),
    Unavailable,
}

impl RawValue {
    fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map_or(RawValue::Unavailable, RawValue::Number),
            serde_json::Value::String(s) if s == UNAVAILABLE_MARKER => RawValue::Unavailable,
            serde_json::Value::String(s) => RawValue::Text(s.clone()),
            serde_json::Value::Bool(b) => RawValue::Text(b.to_string()),
            serde_json::Value::Null => RawValue::Unavailable,
            other => RawValue::Text(other.to_string()),
        }
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        if value == UNAVAILABLE_MARKER {
            RawValue::Unavailable
        } else {
            RawValue::Text(value.to_string())
        }
    }
}

/// One report as delivered by the telemetry source: field name to raw value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSample {
    fields: HashMap<String, RawValue>,
}

impl RawSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<RawValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<RawValue>) {
        self.fields.insert(name.to_string(), value.into());
    }

    /// Missing keys read as unavailable.
    pub fn get(&self, name: &str) -> &RawValue {
        self.fields.get(name).unwrap_or(&RawValue::Unavailable)
    }

    pub fn from_json_object(object: &serde_json::Map<String, serde_json::Value>) -> Self {
        let fields = object
            .iter()
            .map(|(name, value)| (name.clone(), RawValue::from_json(value)))
            .collect();
        Self { fields }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("unparseable timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
    #[error("field {field} is not numeric: {value:?}")]
    InvalidField { field: FieldName, value: String },
}

/// Convert a raw sample into a canonical record.
///
/// Unavailable fields become `None`. The timestamp is parsed as UTC and
/// expressed as fractional seconds since 1970-01-01T00:00:00Z.
pub fn normalize(sample: &RawSample) -> Result<PositionRecord, NormalizeError> {
    let mut record = PositionRecord::default();

    for field in FieldName::ALL {
        let value = match (field, sample.get(field.as_str())) {
            (_, RawValue::Unavailable) => None,
            (FieldName::Time, RawValue::Text(text)) => Some(parse_timestamp(text)?),
            (_, RawValue::Number(n)) if n.is_finite() => Some(*n),
            (_, RawValue::Number(n)) => {
                return Err(NormalizeError::InvalidField { field, value: n.to_string() });
            }
            (_, RawValue::Text(text)) => {
                return Err(NormalizeError::InvalidField { field, value: text.clone() });
            }
        };
        record.set(field, value);
    }

    Ok(record)
}

pub fn parse_timestamp(text: &str) -> Result<f64, NormalizeError> {
    let parsed = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).map_err(|e| {
        NormalizeError::InvalidTimestamp {
            value: text.to_string(),
            reason: e.to_string(),
        }
    })?;
    let utc = parsed.and_utc();
    Ok(utc.timestamp() as f64 + f64::from(utc.timestamp_subsec_nanos()) / 1_000_000_000.0)
}
