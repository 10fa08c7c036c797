use crate::error::IngestError;
use std::collections::BTreeSet;

/// Ordered, de-duplicated row indices to drop, relative to the range-restricted rows.
pub type SkipSet = BTreeSet<usize>;

/// Parses `"1,3,5-7"` style specs. Whitespace around tokens is ignored, ranges are inclusive
/// and ascending, and a blank spec yields the empty set.
pub fn parse_skip_rows(spec: &str) -> Result<SkipSet, IngestError> {
    let mut rows = SkipSet::new();
    if spec.trim().is_empty() {
        return Ok(rows);
    }
    for token in spec.split(',') {
        let malformed = || IngestError::MalformedSkipSpec {
            spec: spec.to_owned(),
            token: token.trim().to_owned(),
        };
        let token = token.trim();
        match token.split_once('-') {
            Some((lower, upper)) => {
                let lower = parse_index(lower).ok_or_else(malformed)?;
                let upper = parse_index(upper).ok_or_else(malformed)?;
                if lower > upper {
                    return Err(malformed());
                }
                rows.extend(lower..=upper);
            }
            None => {
                rows.insert(parse_index(token).ok_or_else(malformed)?);
            }
        }
    }
    Ok(rows)
}

fn parse_index(text: &str) -> Option<usize> {
    let text = text.trim();
    if text.is_empty() || !text.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn indices_and_ranges() {
        let rows = parse_skip_rows("1,3,5-7").unwrap();
        assert_eq!(rows.into_iter().collect::<Vec<_>>(), vec![1, 3, 5, 6, 7]);
    }

    #[test]
    fn whitespace_and_duplicates() {
        let rows = parse_skip_rows(" 4 , 2-3,3 , 0 ").unwrap();
        assert_eq!(rows.into_iter().collect::<Vec<_>>(), vec![0, 2, 3, 4]);
        assert!(parse_skip_rows("").unwrap().is_empty());
        assert!(parse_skip_rows("   ").unwrap().is_empty());
    }

    #[test]
    fn malformed_tokens_are_named() {
        for (spec, token) in [("abc", "abc"), ("1,,2", ""), ("1,x-3", "x-3"), ("7-5", "7-5"), ("-1", "-1"), ("1-2-3", "1-2-3"), ("2.5", "2.5")] {
            let error = parse_skip_rows(spec).unwrap_err();
            assert_eq!(error.kind(), ErrorKind::MalformedSkipSpecError, "{spec}");
            assert!(matches!(error, IngestError::MalformedSkipSpec { token: ref t, .. } if t == token), "{spec}");
        }
    }
}
