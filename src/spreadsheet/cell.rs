use chrono::Duration;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use chrono::NaiveTime;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Storage class of a raw cell, derived from the cell's type tag and number format.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub(crate) enum CellType {
    #[default]
    Empty,
    Boolean,
    Number,
    /// Date/time values stored as numbers from 1900 epoch
    NumberDateTime1900,
    NumberDate1900,
    NumberTime1900,
    /// Date/time values stored as numbers from 1904 epoch
    NumberDateTime1904,
    NumberDate1904,
    NumberTime1904,
    /// ISO 8601 date/time strings (`t="d"` cells)
    IsoDateTime,
    InlineString,
    /// Index into the shared string table
    SharedString,
    Error,
}

impl CellType {
    /// Maps built-in number format ids that denote dates or times.
    pub(crate) fn parse_builtin_number_format_id(id: &str, is_1904: bool) -> Option<Self> {
        match id {
            "22" => Some(if is_1904 { Self::NumberDateTime1904 } else { Self::NumberDateTime1900 }),
            "14" | "15" | "16" | "17" => Some(if is_1904 { Self::NumberDate1904 } else { Self::NumberDate1900 }),
            "18" | "19" | "20" | "21" | "45" | "46" | "47" => Some(if is_1904 { Self::NumberTime1904 } else { Self::NumberTime1900 }),
            _ => None,
        }
    }

    /// Classifies a custom format code by scanning for date and time tokens outside
    /// quoted literals, escapes and bracketed sections.
    pub(crate) fn parse_custom_number_format(format: &str, is_1904: bool) -> Self {
        let mut is_escaped = false;
        let mut is_literal = false;
        let mut is_bracket = false;
        let mut is_date = false;
        let mut is_time = false;
        for character in format.chars() {
            match character {
                _ if is_escaped => is_escaped = false,
                '_' | '\\' => is_escaped = true,

                '"' if is_literal => is_literal = false,
                '"' if !is_bracket => is_literal = true,

                ']' if is_bracket => is_bracket = false,
                '[' if !is_literal => is_bracket = true,
                _ if is_literal || is_bracket => (),

                'Y' | 'y' | 'D' | 'd' => is_date = true,
                'H' | 'h' | 'S' | 's' => is_time = true,
                _ => (),
            }
        }

        match (is_date, is_time, is_1904) {
            (true, true, false) => Self::NumberDateTime1900,
            (true, true, true) => Self::NumberDateTime1904,
            (true, false, false) => Self::NumberDate1900,
            (true, false, true) => Self::NumberDate1904,
            (false, true, false) => Self::NumberTime1900,
            (false, true, true) => Self::NumberTime1904,
            (false, false, _) => Self::Number,
        }
    }

    /// Decodes a raw textual cell value. Values that do not fit the declared type fall back to text.
    pub(crate) fn decode(self, raw: &str, shared_strings: &[String]) -> CellValue {
        match self {
            Self::Empty => CellValue::Empty,
            Self::Boolean => CellValue::Bool(matches!(raw.trim(), "1" | "true" | "TRUE")),
            Self::Number => parse_number(raw),
            Self::NumberDate1900 | Self::NumberDate1904 => serial_to_datetime(raw, self.is_1904())
                .map(|datetime| CellValue::Date(datetime.date()))
                .unwrap_or_else(|| parse_number(raw)),
            Self::NumberDateTime1900 | Self::NumberDateTime1904 => serial_to_datetime(raw, self.is_1904())
                .map(CellValue::DateTime)
                .unwrap_or_else(|| parse_number(raw)),
            Self::NumberTime1900 | Self::NumberTime1904 => serial_to_time(raw)
                .map(CellValue::Time)
                .unwrap_or_else(|| parse_number(raw)),
            Self::IsoDateTime => parse_iso_datetime(raw),
            Self::InlineString => CellValue::String(raw.to_owned()),
            Self::SharedString => raw
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|index| shared_strings.get(index))
                .map(|string| CellValue::String(string.to_owned()))
                .unwrap_or_else(|| CellValue::Error("#REF!".to_owned())),
            Self::Error => CellValue::Error(raw.to_owned()),
        }
    }

    fn is_1904(self) -> bool {
        matches!(self, Self::NumberDate1904 | Self::NumberDateTime1904 | Self::NumberTime1904)
    }
}

/// A typed cell value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    /// An error literal such as `#DIV/0!`
    Error(String),
}

impl CellValue {
    /// Empty cells and whitespace-only strings.
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::String(value) => value.trim().is_empty(),
            _ => false,
        }
    }

    /// Native numbers, and strings that parse as a finite float.
    pub fn is_numeric(&self) -> bool {
        match self {
            CellValue::Int(_) => true,
            CellValue::Float(value) => value.is_finite(),
            CellValue::String(value) => value.trim().parse::<f64>().map(f64::is_finite).unwrap_or(false),
            _ => false,
        }
    }

    /// Non-empty strings that are not numeric.
    pub fn is_text(&self) -> bool {
        matches!(self, CellValue::String(_)) && !self.is_empty() && !self.is_numeric()
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(value) | CellValue::Error(value) => Some(value),
            _ => None,
        }
    }

    /// JSON rendering used by result envelopes. Empty cells become `""`, never `null`;
    /// temporal values use ISO-8601 text.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Empty => serde_json::Value::String(String::new()),
            CellValue::Bool(value) => serde_json::Value::Bool(*value),
            CellValue::Int(value) => serde_json::Value::from(*value),
            CellValue::Float(value) => serde_json::Number::from_f64(*value)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(value.to_string())),
            _ => serde_json::Value::String(self.to_string()),
        }
    }
}

impl Display for CellValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Bool(value) => write!(f, "{value}"),
            CellValue::Int(value) => write!(f, "{value}"),
            CellValue::Float(value) => write!(f, "{value}"),
            CellValue::String(value) | CellValue::Error(value) => write!(f, "{value}"),
            CellValue::Date(value) => write!(f, "{}", value.format("%Y-%m-%d")),
            CellValue::Time(value) => write!(f, "{}", value.format("%H:%M:%S%.f")),
            CellValue::DateTime(value) => write!(f, "{}", value.format("%Y-%m-%dT%H:%M:%S%.f")),
        }
    }
}

/// Integer text that fits `i64` becomes `Int`, other numbers `Float`, anything else stays text.
pub(crate) fn parse_number(raw: &str) -> CellValue {
    let raw = raw.trim();
    if let Ok(value) = raw.parse::<i64>() {
        return CellValue::Int(value);
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 => CellValue::Int(value as i64),
        Ok(value) if value.is_finite() => CellValue::Float(value),
        _ => CellValue::String(raw.to_owned()),
    }
}

/// Converts a serial date number. The 1900 system reproduces the Lotus 1-2-3 leap year bug
/// (serials below 60 are shifted by one day); the 1904 system is offset by 1462 days.
fn serial_to_datetime(raw: &str, is_1904: bool) -> Option<NaiveDateTime> {
    let serial = raw.trim().parse::<f64>().ok().filter(|value| value.is_finite() && *value >= 0.0)?;
    let total = (serial * MICROS_PER_DAY as f64).round() as i64;
    let days = total.div_euclid(MICROS_PER_DAY);
    let micros = total.rem_euclid(MICROS_PER_DAY);
    let offset = if is_1904 {
        1462
    } else if days < 60 {
        1
    } else {
        0
    };
    let base = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    base.checked_add_signed(Duration::days(days + offset))?
        .checked_add_signed(Duration::microseconds(micros))
}

/// The fractional part of a serial number as a time of day.
fn serial_to_time(raw: &str) -> Option<NaiveTime> {
    let serial = raw.trim().parse::<f64>().ok().filter(|value| value.is_finite())?;
    let micros = ((serial.fract().abs()) * MICROS_PER_DAY as f64).round() as i64 % MICROS_PER_DAY;
    let seconds = (micros / 1_000_000) as u32;
    let nanos = ((micros % 1_000_000) * 1_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(seconds, nanos)
}

fn parse_iso_datetime(raw: &str) -> CellValue {
    let raw = raw.trim();
    if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        CellValue::DateTime(datetime)
    } else if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        CellValue::Date(date)
    } else if let Ok(time) = NaiveTime::parse_from_str(raw, "%H:%M:%S%.f") {
        CellValue::Time(time)
    } else {
        CellValue::String(raw.to_owned())
    }
}

/// Converts BIFF error codes to their display literals.
pub(crate) fn to_error_value(value: u8) -> &'static str {
    match value {
        0x00 => "#NULL!",
        0x07 => "#DIV/0!",
        0x0F => "#VALUE!",
        0x17 => "#REF!",
        0x1D => "#NAME?",
        0x24 => "#NUM!",
        0x2A => "#N/A",
        0x2B => "#GETTING_DATA",
        _ => "#ERROR!",
    }
}

/// A decoded cell at an absolute sheet position.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Cell {
    pub(crate) row: usize,
    pub(crate) col: usize,
    pub(crate) value: CellValue,
}
