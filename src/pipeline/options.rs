use crate::error::IngestError;
use crate::security::MacroPolicy;
use crate::spreadsheet::merge::MergeMode;
use crate::spreadsheet::range::RangeInfo;
use crate::spreadsheet::skip::parse_skip_rows;
use crate::spreadsheet::skip::SkipSet;
use crate::spreadsheet::SheetRef;
use crate::table::header::HeaderMode;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::str::FromStr;

/// Raw `key = value` extraction directives as supplied by the caller.
///
/// Keys are case-insensitive and `_` is accepted in place of `-`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Directives {
    values: IndexMap<String, String>,
}

impl Directives {
    pub fn new() -> Directives {
        Directives::default()
    }

    pub fn set(mut self, key: &str, value: &str) -> Directives {
        self.values.insert(Self::normalize_key(key), value.to_owned());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&Self::normalize_key(key)).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    fn normalize_key(key: &str) -> String {
        key.trim().to_ascii_lowercase().replace('_', "-")
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Directives {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Directives::new(), |directives, (key, value)| directives.set(key.as_ref(), value.as_ref()))
    }
}

/// Trait for handling one named directive.
pub trait Param<T> {
    /// The directive key
    fn name() -> &'static str;

    /// Parses a present value.
    fn parse(value: &str) -> Result<T, IngestError>;

    /// Reads the directive, `None` when absent.
    fn read(directives: &Directives) -> Result<Option<T>, IngestError> {
        directives.get(Self::name()).map(Self::parse).transpose()
    }

    fn invalid(message: impl Display) -> IngestError {
        IngestError::InvalidOption {
            name: Self::name().to_owned(),
            message: message.to_string(),
        }
    }
}

/// Where the read window comes from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectRange {
    /// The explicit range if given, otherwise the sheet's declared extent
    #[default]
    Auto,
    /// Like `auto`, then fully-empty outer rows and columns are trimmed from the result
    Smart,
    /// An explicit range is required
    Manual,
}

impl FromStr for DetectRange {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(DetectRange::Auto),
            "smart" => Ok(DetectRange::Smart),
            "manual" => Ok(DetectRange::Manual),
            other => Err(format!("expected 'auto', 'smart' or 'manual', got '{other}'")),
        }
    }
}

impl Display for DetectRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DetectRange::Auto => "auto",
            DetectRange::Smart => "smart",
            DetectRange::Manual => "manual",
        };
        write!(f, "{name}")
    }
}

struct SheetParam;
struct RangeParam;
struct HeaderRowParam;
struct SkipRowsParam;
struct DetectRangeParam;
struct MergeCellsParam;
struct MergeHeadersParam;
struct JsonCacheParam;
pub(crate) struct MacroSecurityParam;

impl Param<SheetRef> for SheetParam {
    fn name() -> &'static str {
        "sheet"
    }

    /// A numeric value is kept as a name: an existing sheet with that name wins over the index.
    fn parse(value: &str) -> Result<SheetRef, IngestError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Self::invalid("sheet name must not be empty"));
        }
        Ok(SheetRef::Name(value.to_owned()))
    }
}

impl Param<(RangeInfo, Option<String>)> for RangeParam {
    fn name() -> &'static str {
        "range"
    }

    /// Accepts an optional sheet qualifier: `Data!A1:C10` or `'My Sheet'!B2`.
    fn parse(value: &str) -> Result<(RangeInfo, Option<String>), IngestError> {
        let value = value.trim();
        let (sheet, spec) = match value.rsplit_once('!') {
            Some((sheet, spec)) => {
                let sheet = sheet.trim().trim_matches('\'');
                if sheet.is_empty() {
                    return Err(IngestError::MalformedRange {
                        spec: value.to_owned(),
                        reason: "empty sheet qualifier".to_owned(),
                    });
                }
                (Some(sheet), spec)
            }
            None => (None, value),
        };
        let parsed = RangeInfo::parse(spec)?;
        let range = match sheet {
            Some(sheet) => parsed.range.with_sheet(sheet),
            None => parsed.range,
        };
        Ok((range, parsed.warning))
    }
}

impl Param<HeaderMode> for HeaderRowParam {
    fn name() -> &'static str {
        "header-row"
    }

    fn parse(value: &str) -> Result<HeaderMode, IngestError> {
        value.parse().map_err(Self::invalid)
    }
}

impl Param<SkipSet> for SkipRowsParam {
    fn name() -> &'static str {
        "skip-rows"
    }

    fn parse(value: &str) -> Result<SkipSet, IngestError> {
        parse_skip_rows(value)
    }
}

impl Param<DetectRange> for DetectRangeParam {
    fn name() -> &'static str {
        "detect-range"
    }

    fn parse(value: &str) -> Result<DetectRange, IngestError> {
        value.parse().map_err(Self::invalid)
    }
}

impl Param<MergeMode> for MergeCellsParam {
    fn name() -> &'static str {
        "merge-cells"
    }

    fn parse(value: &str) -> Result<MergeMode, IngestError> {
        value.parse().map_err(Self::invalid)
    }
}

impl Param<bool> for MergeHeadersParam {
    fn name() -> &'static str {
        "merge-headers"
    }

    fn parse(value: &str) -> Result<bool, IngestError> {
        parse_bool(value).map_err(Self::invalid)
    }
}

impl Param<bool> for JsonCacheParam {
    fn name() -> &'static str {
        "json-cache"
    }

    fn parse(value: &str) -> Result<bool, IngestError> {
        parse_bool(value).map_err(Self::invalid)
    }
}

impl Param<MacroPolicy> for MacroSecurityParam {
    fn name() -> &'static str {
        "macro-security"
    }

    fn parse(value: &str) -> Result<MacroPolicy, IngestError> {
        value.parse().map_err(Self::invalid)
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}

/// Every directive key that is understood.
pub const KNOWN_OPTIONS: [&str; 9] = [
    "sheet",
    "range",
    "header-row",
    "skip-rows",
    "detect-range",
    "merge-cells",
    "merge-headers",
    "json-cache",
    "macro-security",
];

/// Validated extraction options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractOptions {
    pub sheet: SheetRef,
    pub range: Option<RangeInfo>,
    pub header: HeaderMode,
    /// 0-based positions within the range-restricted rows
    pub skip_rows: SkipSet,
    pub detect_range: DetectRange,
    pub merge_cells: MergeMode,
    pub merge_headers: bool,
    pub json_cache: bool,
    pub macro_security: MacroPolicy,
    /// Notes produced while parsing: reordered ranges, unknown keys
    pub warnings: Vec<String>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            sheet: SheetRef::Active,
            range: None,
            header: HeaderMode::Auto,
            skip_rows: SkipSet::new(),
            detect_range: DetectRange::Auto,
            merge_cells: MergeMode::Expand,
            merge_headers: false,
            json_cache: true,
            macro_security: MacroPolicy::default(),
            warnings: Vec::new(),
        }
    }
}

impl TryFrom<&Directives> for ExtractOptions {
    type Error = IngestError;

    fn try_from(directives: &Directives) -> Result<Self, Self::Error> {
        let defaults = ExtractOptions::default();
        let mut warnings = Vec::new();
        for key in directives.keys().filter(|key| !KNOWN_OPTIONS.contains(key)) {
            tracing::warn!("Ignoring unknown option '{key}'");
            warnings.push(format!("unknown option '{key}' was ignored"));
        }

        let sheet = SheetParam::read(directives)?;
        let range = match RangeParam::read(directives)? {
            Some((range, warning)) => {
                warnings.extend(warning);
                Some(range)
            }
            None => None,
        };
        let sheet = match (sheet, range.as_ref().and_then(|range| range.sheet_name.clone())) {
            (Some(SheetRef::Name(sheet)), Some(qualifier)) if sheet != qualifier => {
                return Err(RangeParam::invalid(format!(
                    "range names sheet '{qualifier}' but the sheet option is '{sheet}'"
                )));
            }
            (Some(sheet), _) => sheet,
            (None, Some(qualifier)) => SheetRef::Name(qualifier),
            (None, None) => defaults.sheet,
        };
        let detect_range = DetectRangeParam::read(directives)?.unwrap_or(defaults.detect_range);
        if detect_range == DetectRange::Manual && range.is_none() {
            return Err(DetectRangeParam::invalid("'manual' requires the range option"));
        }

        Ok(ExtractOptions {
            sheet,
            range,
            header: HeaderRowParam::read(directives)?.unwrap_or(defaults.header),
            skip_rows: SkipRowsParam::read(directives)?.unwrap_or(defaults.skip_rows),
            detect_range,
            merge_cells: MergeCellsParam::read(directives)?.unwrap_or(defaults.merge_cells),
            merge_headers: MergeHeadersParam::read(directives)?.unwrap_or(defaults.merge_headers),
            json_cache: JsonCacheParam::read(directives)?.unwrap_or(defaults.json_cache),
            macro_security: MacroSecurityParam::read(directives)?.unwrap_or(defaults.macro_security),
            warnings,
        })
    }
}

impl ExtractOptions {
    /// Stable text form of every option that affects the extracted data, used in cache keys.
    pub fn canonical(&self) -> String {
        let skip_rows: Vec<String> = self.skip_rows.iter().map(usize::to_string).collect();
        format!(
            "sheet={};range={};header-row={};skip-rows={};detect-range={};merge-cells={};merge-headers={};macro-security={}",
            self.sheet,
            self.range.as_ref().map(ToString::to_string).unwrap_or_default(),
            self.header,
            skip_rows.join(","),
            self.detect_range,
            self.merge_cells,
            self.merge_headers,
            self.macro_security,
        )
    }
}
