//! Source text normalization, language detection and placeholder protection.
//! `normalize_source` defines the identity used for deduplication and cache keys.

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Canonical form of an annotation: trimmed, Unicode NFC.
pub fn normalize_source(text: &str) -> String {
    text.trim().nfc().collect()
}

/// True for empty or whitespace-only text.
pub fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

/// Detects the dominant language of `text` using whatlang.
/// Returns an ISO 639-1 code or None if detection is unreliable.
pub fn detect_language(text: &str) -> Option<String> {
    let info = whatlang::detect(text)?;
    if !info.is_reliable() {
        return None;
    }
    Some(lang_to_code(info.lang()))
}

fn lang_to_code(lang: whatlang::Lang) -> String {
    use whatlang::Lang::*;
    match lang {
        Eng => "en",
        Cmn => "zh",
        Jpn => "ja",
        Kor => "ko",
        Fra => "fr",
        Deu => "de",
        Spa => "es",
        Rus => "ru",
        Por => "pt",
        Ita => "it",
        Ara => "ar",
        Vie => "vi",
        Tha => "th",
        Nld => "nl",
        Pol => "pl",
        Ukr => "uk",
        _ => "other",
    }
    .to_string()
}

/// A placeholder substitution that must be restored after translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderEntry {
    pub tag: String,      // e.g. "<<PH0>>"
    pub original: String, // e.g. "300x600"
}

/// Protects drawing tokens (dimensions, axis labels, numbers with units)
/// by replacing them with placeholder tags before translation.
pub struct PlaceholderProtector {
    patterns: Vec<Regex>,
    tag_pattern: Regex,
}

impl Default for PlaceholderProtector {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderProtector {
    pub fn new() -> Self {
        Self {
            patterns: vec![
                // Section dimensions (e.g. 300x600, 200×400×12)
                Regex::new(r"\d+(?:\.\d+)?(?:\s*[xX×*]\s*\d+(?:\.\d+)?)+").unwrap(),
                // Axis / grid / mark labels (e.g. A-1, KZ1, C-12a)
                Regex::new(r"\b[A-Z]{1,3}-?\d+[a-z]?\b").unwrap(),
                // Numbers with units (e.g. 12mm, 3.5m, 45°, 2%)
                Regex::new(r"[±]?\d+(?:\.\d+)?\s*(?:mm|cm|m|kN|MPa|kg|°|%)").unwrap(),
                // Standalone numbers / decimals / elevations
                Regex::new(r"[+\-±]?\d+(?:\.\d+)?").unwrap(),
            ],
            tag_pattern: Regex::new(r"<<PH\d+>>").unwrap(),
        }
    }

    /// Replace matched tokens with `<<PH0>>`, `<<PH1>>`, etc.
    /// Returns the protected text and the list of entries for later restoration.
    pub fn protect(&self, text: &str) -> (String, Vec<PlaceholderEntry>) {
        let mut entries = Vec::new();
        let mut result = text.to_string();

        for pat in &self.patterns {
            // Spans already replaced by a tag are off limits for later patterns.
            let taken: Vec<(usize, usize)> = self
                .tag_pattern
                .find_iter(&result)
                .map(|m| (m.start(), m.end()))
                .collect();
            let found: Vec<(usize, usize)> = pat
                .find_iter(&result)
                .map(|m| (m.start(), m.end()))
                .filter(|&(s, e)| !taken.iter().any(|&(ts, te)| s < te && ts < e))
                .collect();
            if found.is_empty() {
                continue;
            }

            let mut rebuilt = String::with_capacity(result.len());
            let mut cursor = 0;
            for (start, end) in found {
                rebuilt.push_str(&result[cursor..start]);
                let tag = format!("<<PH{}>>", entries.len());
                rebuilt.push_str(&tag);
                entries.push(PlaceholderEntry {
                    tag,
                    original: result[start..end].to_string(),
                });
                cursor = end;
            }
            rebuilt.push_str(&result[cursor..]);
            result = rebuilt;
        }

        (result, entries)
    }

    /// Restore placeholders in the translated text.
    pub fn restore(&self, text: &str, entries: &[PlaceholderEntry]) -> String {
        let mut result = text.to_string();
        for entry in entries {
            result = result.replace(&entry.tag, &entry.original);
        }
        result
    }
}
