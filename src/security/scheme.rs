//! Deny-listed URI schemes and obfuscation-resistant matching.
use crate::security::Severity;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use unicode_normalization::UnicodeNormalization;

/// URI schemes that must never be followed from spreadsheet content.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnsafeScheme {
    File,
    Javascript,
    Vbscript,
    Ftp,
    Ldap,
}

impl UnsafeScheme {
    pub const ALL: [UnsafeScheme; 5] = [
        UnsafeScheme::Javascript,
        UnsafeScheme::Vbscript,
        UnsafeScheme::File,
        UnsafeScheme::Ftp,
        UnsafeScheme::Ldap,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            UnsafeScheme::File => "file",
            UnsafeScheme::Javascript => "javascript",
            UnsafeScheme::Vbscript => "vbscript",
            UnsafeScheme::Ftp => "ftp",
            UnsafeScheme::Ldap => "ldap",
        }
    }

    /// Script and local-file schemes are high severity, remote protocols medium.
    pub fn severity(&self) -> Severity {
        match self {
            UnsafeScheme::Javascript | UnsafeScheme::Vbscript | UnsafeScheme::File => Severity::High,
            UnsafeScheme::Ftp | UnsafeScheme::Ldap => Severity::Medium,
        }
    }

    /// Script schemes run whatever follows the colon, whitespace included.
    fn is_script(&self) -> bool {
        matches!(self, UnsafeScheme::Javascript | UnsafeScheme::Vbscript)
    }

    fn from_name(name: &str) -> Option<UnsafeScheme> {
        UnsafeScheme::ALL
            .into_iter()
            .find(|scheme| scheme.name().eq_ignore_ascii_case(name))
    }
}

impl Display for UnsafeScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.name())
    }
}

/// Finds a deny-listed scheme in free text: first in the raw string, then in its
/// [`normalize`]d form.
pub fn find_unsafe_scheme(text: &str) -> Option<UnsafeScheme> {
    if let Some(scheme) = find_in(text) {
        return Some(scheme);
    }
    let normalized = normalize(text);
    if normalized != text {
        find_in(&normalized)
    } else {
        None
    }
}

/// Like [`find_unsafe_scheme`], and also checks the scheme a URL parser extracts from the target.
pub fn hyperlink_scheme(target: &str) -> Option<UnsafeScheme> {
    find_unsafe_scheme(target).or_else(|| {
        url::Url::parse(target.trim())
            .ok()
            .and_then(|url| UnsafeScheme::from_name(url.scheme()))
    })
}

/// Percent-decodes, applies NFKC and removes control and zero-width characters.
pub fn normalize(text: &str) -> String {
    let decoded = urlencoding::decode_binary(text.as_bytes());
    String::from_utf8_lossy(&decoded)
        .nfkc()
        .filter(|character| !character.is_control() && !is_invisible(*character))
        .collect()
}

fn is_invisible(character: char) -> bool {
    matches!(character, '\u{200B}'..='\u{200F}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}' | '\u{00AD}')
}

/// A scheme matches when it starts the text or follows a non-alphanumeric character.
/// Non-script schemes must also be followed by something other than whitespace, so prose
/// such as `see file: report.pdf` stays clean.
fn find_in(text: &str) -> Option<UnsafeScheme> {
    let lower = text.to_ascii_lowercase();
    UnsafeScheme::ALL.into_iter().find(|scheme| {
        let prefix = format!("{}:", scheme.name());
        lower.match_indices(&prefix).any(|(start, _)| {
            let before = lower[..start].chars().next_back();
            let after = lower[start + prefix.len()..].chars().next();
            before.map(|character| !character.is_ascii_alphanumeric()).unwrap_or(true)
                && (scheme.is_script() || after.map(|character| !character.is_whitespace()).unwrap_or(false))
        })
    })
}
