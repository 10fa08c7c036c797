use crate::error::IngestError;
use crate::spreadsheet::cell::CellValue;
use crate::spreadsheet::Row;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;

pub const STRICT_CONFIDENCE: f64 = 0.8;
pub const KEYWORD_CONFIDENCE: f64 = 0.6;
pub const EXPLICIT_CONFIDENCE: f64 = 1.0;

/// Rows inspected when looking for a header candidate.
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

/// Common column titles in English and Chinese.
pub const BUSINESS_KEYWORDS: &[&str] = &[
    "id", "name", "date", "time", "amount", "total", "sum", "price", "cost", "quantity", "qty", "unit",
    "description", "category", "type", "status", "code", "number", "no", "customer", "client", "product",
    "item", "sku", "order", "invoice", "account", "balance", "revenue", "sales", "region", "department",
    "email", "phone", "address", "city", "country", "year", "month", "value", "rate", "percent", "note",
    "编号", "序号", "名称", "姓名", "日期", "时间", "金额", "总计", "合计", "价格", "单价", "成本", "数量",
    "单位", "描述", "类别", "类型", "状态", "代码", "客户", "产品", "订单", "账户", "余额", "收入", "销售",
    "地区", "部门", "电话", "地址", "城市", "年份", "月份", "备注", "比例",
];

/// Ratio thresholds of the two detection tiers. Ratios are taken over non-empty cells.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderThresholds {
    /// Tier 1: minimum text ratio of the candidate row (inclusive)
    pub strict_text_ratio: f64,
    /// Tier 1: minimum numeric ratio of the following row (inclusive)
    pub strict_numeric_ratio: f64,
    /// Tier 2: the candidate row's text ratio must exceed this
    pub keyword_text_ratio: f64,
    /// Tier 2: the following row's numeric ratio must exceed this
    pub keyword_numeric_ratio: f64,
}

impl Default for HeaderThresholds {
    fn default() -> Self {
        HeaderThresholds {
            strict_text_ratio: 0.8,
            strict_numeric_ratio: 0.5,
            keyword_text_ratio: 0.6,
            keyword_numeric_ratio: 0.3,
        }
    }
}

/// How the header row is chosen.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMode {
    #[default]
    Auto,
    None,
    /// 1-based position within the rows left after range restriction and skipping
    Row(usize),
}

impl FromStr for HeaderMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(HeaderMode::Auto),
            "none" | "false" => Ok(HeaderMode::None),
            _ => match value.parse::<usize>() {
                Ok(0) => Err("header rows are numbered from 1".to_owned()),
                Ok(index) => Ok(HeaderMode::Row(index)),
                Err(_) => Err(format!("expected a row number, 'auto' or 'none', got '{value}'")),
            },
        }
    }
}

impl Display for HeaderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderMode::Auto => write!(f, "auto"),
            HeaderMode::None => write!(f, "none"),
            HeaderMode::Row(index) => write!(f, "{index}"),
        }
    }
}

/// Which rule accepted the header.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionTier {
    Strict,
    Keyword,
    Explicit,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeaderDetectionResult {
    pub has_header: bool,
    /// 0-based position of the header within the rows it was detected in
    pub header_row_index: Option<usize>,
    /// 0-based absolute sheet row of the header
    pub sheet_row: Option<usize>,
    pub confidence: f64,
    pub normalized_names: Vec<String>,
    /// Parallel to `normalized_names`, true where a blank header cell got a `column{n}` name
    #[serde(default)]
    pub generated_names: Vec<bool>,
    pub tier: Option<DetectionTier>,
}

impl HeaderDetectionResult {
    pub fn none() -> HeaderDetectionResult {
        HeaderDetectionResult {
            has_header: false,
            header_row_index: None,
            sheet_row: None,
            confidence: 0.0,
            normalized_names: Vec::new(),
            generated_names: Vec::new(),
            tier: None,
        }
    }

    fn accepted(index: usize, row: &Row, confidence: f64, tier: DetectionTier) -> HeaderDetectionResult {
        let (normalized_names, generated_names) = normalize_names(&row.cells);
        HeaderDetectionResult {
            has_header: true,
            header_row_index: Some(index),
            sheet_row: Some(row.index),
            confidence,
            normalized_names,
            generated_names,
            tier: Some(tier),
        }
    }
}

/// Decides whether, and which, row is a header.
#[derive(Clone, Debug)]
pub struct HeaderDetector {
    thresholds: HeaderThresholds,
    sample_size: usize,
    /// Lower-cased ASCII keywords match whole tokens
    ascii_keywords: HashSet<String>,
    /// Other keywords match as substrings
    other_keywords: Vec<String>,
}

impl Default for HeaderDetector {
    fn default() -> Self {
        HeaderDetector::new(HeaderThresholds::default(), DEFAULT_SAMPLE_SIZE, &[])
    }
}

impl HeaderDetector {
    pub fn new(thresholds: HeaderThresholds, sample_size: usize, extra_keywords: &[String]) -> HeaderDetector {
        let mut ascii_keywords = HashSet::new();
        let mut other_keywords = Vec::new();
        let keywords = BUSINESS_KEYWORDS
            .iter()
            .map(|keyword| keyword.to_string())
            .chain(extra_keywords.iter().cloned());
        for keyword in keywords {
            let keyword = keyword.trim().to_lowercase();
            if keyword.is_empty() {
                continue;
            }
            if keyword.is_ascii() {
                ascii_keywords.insert(keyword);
            } else {
                other_keywords.push(keyword);
            }
        }
        HeaderDetector {
            thresholds,
            sample_size: sample_size.max(2),
            ascii_keywords,
            other_keywords,
        }
    }

    pub fn resolve(&self, rows: &[Row], mode: HeaderMode) -> Result<HeaderDetectionResult, IngestError> {
        match mode {
            HeaderMode::Auto => Ok(self.detect(rows)),
            HeaderMode::None => Ok(HeaderDetectionResult::none()),
            HeaderMode::Row(index) => self.explicit(rows, index),
        }
    }

    /// Heuristic detection. The candidate is the first non-empty row among the first
    /// `sample_size` rows, judged against the next non-empty row.
    pub fn detect(&self, rows: &[Row]) -> HeaderDetectionResult {
        let mut sample = rows
            .iter()
            .take(self.sample_size)
            .enumerate()
            .filter(|(_, row)| !row.is_empty());
        let Some((index, candidate)) = sample.next() else {
            return HeaderDetectionResult::none();
        };
        let Some((_, following)) = sample.next() else {
            return HeaderDetectionResult::none();
        };

        let text = text_ratio(candidate);
        let numeric = numeric_ratio(following);
        let thresholds = &self.thresholds;
        if text >= thresholds.strict_text_ratio && numeric >= thresholds.strict_numeric_ratio {
            return HeaderDetectionResult::accepted(index, candidate, STRICT_CONFIDENCE, DetectionTier::Strict);
        }
        if text > thresholds.keyword_text_ratio
            && numeric > thresholds.keyword_numeric_ratio
            && self.has_keyword(candidate)
        {
            return HeaderDetectionResult::accepted(index, candidate, KEYWORD_CONFIDENCE, DetectionTier::Keyword);
        }
        tracing::debug!("No header detected: text ratio {text:.2}, numeric ratio {numeric:.2}");
        HeaderDetectionResult::none()
    }

    /// Takes the row at 1-based `index` as the header.
    pub fn explicit(&self, rows: &[Row], index: usize) -> Result<HeaderDetectionResult, IngestError> {
        if index == 0 || index > rows.len() {
            return Err(IngestError::HeaderRowOutOfRange { index, rows: rows.len() });
        }
        let position = index - 1;
        Ok(HeaderDetectionResult::accepted(position, &rows[position], EXPLICIT_CONFIDENCE, DetectionTier::Explicit))
    }

    fn has_keyword(&self, row: &Row) -> bool {
        row.cells.iter().filter_map(CellValue::as_str).any(|text| {
            let text = text.to_lowercase();
            let by_token = text
                .split(|character: char| !character.is_alphanumeric())
                .any(|token| self.ascii_keywords.contains(token));
            by_token || self.other_keywords.iter().any(|keyword| text.contains(keyword.as_str()))
        })
    }
}

fn non_empty(row: &Row) -> impl Iterator<Item = &CellValue> {
    row.cells.iter().filter(|cell| !cell.is_empty())
}

fn ratio(row: &Row, predicate: fn(&CellValue) -> bool) -> f64 {
    let (total, matching) = non_empty(row).fold((0usize, 0usize), |(total, matching), cell| {
        (total + 1, matching + predicate(cell) as usize)
    });
    if total == 0 {
        0.0
    } else {
        matching as f64 / total as f64
    }
}

pub fn text_ratio(row: &Row) -> f64 {
    ratio(row, CellValue::is_text)
}

pub fn numeric_ratio(row: &Row) -> f64 {
    ratio(row, CellValue::is_numeric)
}

/// Trims, collapses inner whitespace, names blank cells `column{n}` (1-based) and
/// de-duplicates with `_2`, `_3`... suffixes. Also returns which names were generated.
pub fn normalize_names(cells: &[CellValue]) -> (Vec<String>, Vec<bool>) {
    let mut used = HashSet::new();
    let mut names = Vec::with_capacity(cells.len());
    let mut generated = Vec::with_capacity(cells.len());
    for (position, cell) in cells.iter().enumerate() {
        let text = cell.to_string();
        let base = text.split_whitespace().collect::<Vec<_>>().join(" ");
        generated.push(base.is_empty());
        let base = if base.is_empty() { format!("column{}", position + 1) } else { base };
        let mut name = base.clone();
        let mut suffix = 2;
        while used.contains(&name) {
            name = format!("{base}_{suffix}");
            suffix += 1;
        }
        used.insert(name.clone());
        names.push(name);
    }
    (names, generated)
}
