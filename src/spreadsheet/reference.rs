//! Conversions between A1-style references and 0-based indices.
//! Columns use bijective base-26 (`A` = 0, `Z` = 25, `AA` = 26); rows are 1-based on the surface.

/// Converts column letters to a 0-based index. Case-insensitive; returns `None` for empty input,
/// non-letters or overflow.
pub fn col_to_index(col: &str) -> Option<usize> {
    if col.is_empty() {
        return None;
    }
    let mut index = 0usize;
    for byte in col.bytes() {
        if !byte.is_ascii_alphabetic() {
            return None;
        }
        let digit = (byte.to_ascii_uppercase() - b'A') as usize + 1;
        index = index.checked_mul(26)?.checked_add(digit)?;
    }
    Some(index - 1)
}

/// Converts a 0-based column index to its letters.
pub fn index_to_col(index: usize) -> String {
    let mut letters = Vec::new();
    let mut value = index + 1;
    while value > 0 {
        let remainder = (value - 1) % 26;
        letters.push(b'A' + remainder as u8);
        value = (value - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Converts a 1-based row number to a 0-based index. `"0"` and non-digits are rejected.
pub fn row_to_index(row: &str) -> Option<usize> {
    if row.is_empty() || !row.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    row.parse::<usize>().ok()?.checked_sub(1)
}

/// Splits a reference such as `"AB12"` into `(row, col)`. A leading `$` on either part is accepted.
pub fn reference_to_index(reference: &str) -> Option<(usize, usize)> {
    let reference = reference.trim();
    let split = reference
        .char_indices()
        .find(|(index, character)| character.is_ascii_digit() || (*index > 0 && *character == '$'))
        .map(|(index, _)| index)?;
    let (col, row) = reference.split_at(split);
    let col = col.strip_prefix('$').unwrap_or(col);
    let row = row.strip_prefix('$').unwrap_or(row);
    Some((row_to_index(row)?, col_to_index(col)?))
}

/// Formats `(row, col)` as an A1 reference.
pub fn index_to_reference(row: usize, col: usize) -> String {
    format!("{}{}", index_to_col(col), row + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters() {
        assert_eq!(col_to_index("A"), Some(0));
        assert_eq!(col_to_index("z"), Some(25));
        assert_eq!(col_to_index("AA"), Some(26));
        assert_eq!(col_to_index("AZ"), Some(51));
        assert_eq!(col_to_index("XFD"), Some(16383));
        assert_eq!(col_to_index(""), None);
        assert_eq!(col_to_index("A1"), None);
        assert_eq!(col_to_index(&"Z".repeat(64)), None);

        for index in [0, 25, 26, 701, 702, 16383] {
            assert_eq!(col_to_index(&index_to_col(index)), Some(index));
        }
        assert_eq!(index_to_col(701), "ZZ");
        assert_eq!(index_to_col(702), "AAA");
    }

    #[test]
    fn rows_are_one_based() {
        assert_eq!(row_to_index("1"), Some(0));
        assert_eq!(row_to_index("10"), Some(9));
        assert_eq!(row_to_index("0"), None);
        assert_eq!(row_to_index("-1"), None);
        assert_eq!(row_to_index(""), None);
    }

    #[test]
    fn cell_references() {
        assert_eq!(reference_to_index("A1"), Some((0, 0)));
        assert_eq!(reference_to_index("c10"), Some((9, 2)));
        assert_eq!(reference_to_index("$B$2"), Some((1, 1)));
        assert_eq!(reference_to_index("B"), None);
        assert_eq!(reference_to_index("12"), None);
        assert_eq!(index_to_reference(4, 3), "D5");
    }
}
