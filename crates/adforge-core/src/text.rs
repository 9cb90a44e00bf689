//! Query text normalization and fingerprinting.
//!
//! Raw CSV cells arrive in rough shape: character-per-token spacing from
//! upstream OCR ("p i z z a"), search-operator junk pasted into product
//! names ("shoes filetype png"), stray punctuation. Everything here is a
//! pure function of its inputs so query construction stays deterministic.

use sha2::{Digest, Sha256};

use crate::config::QueryConfig;
use crate::table::RowSnapshot;

/// Fix text where characters are separated by single spaces.
///
/// Decided by a ratio test: if more than 70% of whitespace-split tokens are
/// single characters, runs of spaced characters are collapsed into words and
/// runs of 2+ spaces are treated as word boundaries.
///
/// `"p i z z a   s l i c e"` → `"pizza slice"`, `"normal text"` unchanged.
pub fn clean_spaced_text(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }

    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return String::new();
    }

    let single = tokens.iter().filter(|t| t.chars().count() == 1).count();
    if (single as f64) / (tokens.len() as f64) > 0.7 {
        return reconstruct_spaced_text(text);
    }
    tokens.join(" ")
}

fn reconstruct_spaced_text(text: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    // Multi-space runs separate words; single spaces separate characters.
    for group in split_on_space_runs(text) {
        let group = group.trim();
        if group.is_empty() {
            continue;
        }
        let chars: Vec<&str> = group.split_whitespace().collect();
        if !chars.is_empty() && chars.iter().all(|c| c.chars().count() == 1) {
            words.push(chars.concat());
        } else {
            words.push(group.to_string());
        }
    }
    words.join(" ")
}

fn split_on_space_runs(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b' ' {
            let run_start = i;
            while i < bytes.len() && bytes[i] == b' ' {
                i += 1;
            }
            if i - run_start >= 2 {
                out.push(&text[start..run_start]);
                start = i;
            }
        } else {
            i += 1;
        }
    }
    out.push(&text[start..]);
    out
}

/// Cut the query at the first occurrence of any junk suffix
/// (case-insensitive). `"pizza crust filetype png"` → `"pizza crust"`.
pub fn strip_junk_suffixes(text: &str, suffixes: &[String]) -> String {
    let mut text = text.to_string();
    let mut lower = text.to_lowercase();
    for suffix in suffixes {
        if let Some(idx) = lower.find(&suffix.to_lowercase()) {
            text = text[..idx].trim_end().to_string();
            lower = text.to_lowercase();
        }
    }
    text
}

/// Clean and normalize a search query.
///
/// Fixes character spacing, strips junk suffixes, removes punctuation except
/// hyphens, lowercases, collapses whitespace, and optionally caps the word
/// count (`max_words == 0` means unlimited).
pub fn clean_query(text: &str, max_words: usize, strip_suffixes: &[String]) -> String {
    if text.is_empty() {
        return String::new();
    }

    let cleaned = clean_spaced_text(text);
    let cleaned = strip_junk_suffixes(&cleaned, strip_suffixes);

    let cleaned: String = cleaned
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    let mut words: Vec<&str> = cleaned.split_whitespace().collect();
    if max_words > 0 && words.len() > max_words {
        words.truncate(max_words);
    }
    words.join(" ").to_lowercase()
}

/// Whether a raw cell value is usable as a query source.
pub fn is_valid_query(text: &str, ignore_values: &[String]) -> bool {
    let text = text.trim().to_lowercase();
    if text.chars().count() <= 1 {
        return false;
    }
    !ignore_values.iter().any(|v| v.as_str() == text)
}

/// 16-hex-digit digest of the lowercased, whitespace-collapsed query.
///
/// Two rows with textually identical normalized queries share a fingerprint;
/// this is the image-cache key.
pub fn query_fingerprint(query: &str) -> String {
    let normalized = query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Build the search query for one row.
///
/// Walks the configured priority columns, skipping absent / ignored values,
/// and cleans the first usable one. Falls back to the text column when no
/// priority column yields anything.
pub fn build_query(row: &RowSnapshot, cfg: &QueryConfig) -> String {
    for column in &cfg.priority_columns {
        let Some(raw) = row.get_non_empty(column) else {
            continue;
        };
        if !is_valid_query(raw, &cfg.ignore_values) {
            continue;
        }
        let cleaned = clean_query(raw, cfg.max_query_words, &cfg.strip_suffixes);
        if !cleaned.is_empty() {
            tracing::debug!(column, query = %cleaned, "query built");
            return cleaned;
        }
    }

    let text = row.get_non_empty(&cfg.text_column).unwrap_or("");
    clean_query(text, cfg.max_query_words, &cfg.strip_suffixes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn no_suffixes() -> Vec<String> {
        Vec::new()
    }

    fn default_suffixes() -> Vec<String> {
        ["filetype png", "filetype jpg", "site:", "inurl:"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn spaced_text_is_reconstructed() {
        assert_eq!(clean_spaced_text("p i z z a"), "pizza");
        assert_eq!(clean_spaced_text("p i z z a   s l i c e"), "pizza slice");
        assert_eq!(clean_spaced_text("normal text"), "normal text");
        assert_eq!(clean_spaced_text(""), "");
    }

    #[test]
    fn below_ratio_is_left_alone() {
        // 2 of 3 tokens are single chars: 0.66 < 0.7.
        assert_eq!(clean_spaced_text("a b chair"), "a b chair");
    }

    #[test]
    fn clean_query_matrix() {
        assert_eq!(
            clean_query("p i z z a   s l i c e", 0, &no_suffixes()),
            "pizza slice"
        );
        assert_eq!(clean_query("Pizza!! ", 0, &no_suffixes()), "pizza");
        assert_eq!(
            clean_query("shoes filetype png", 0, &default_suffixes()),
            "shoes"
        );
        assert_eq!(clean_query("normal text", 0, &no_suffixes()), "normal text");
    }

    #[test]
    fn hyphen_survives_punctuation_pass() {
        assert_eq!(
            clean_query("anti-slip mat (blue)", 0, &no_suffixes()),
            "anti-slip mat blue"
        );
    }

    #[test]
    fn word_cap_applies_only_when_positive() {
        assert_eq!(clean_query("one two three four", 2, &no_suffixes()), "one two");
        assert_eq!(
            clean_query("one two three four", 0, &no_suffixes()),
            "one two three four"
        );
    }

    #[test]
    fn suffix_stripping_is_case_insensitive() {
        assert_eq!(
            clean_query("Running Shoes Site:amazon.com", 0, &default_suffixes()),
            "running shoes"
        );
    }

    #[test]
    fn valid_query_rejects_ignored_and_short() {
        let ignored = vec!["nan".to_string(), "none".to_string(), "general".to_string()];
        assert!(is_valid_query("red sneakers", &ignored));
        assert!(!is_valid_query("NaN", &ignored));
        assert!(!is_valid_query("  General ", &ignored));
        assert!(!is_valid_query("x", &ignored));
        assert!(!is_valid_query("", &ignored));
    }

    #[test]
    fn build_query_walks_priority_then_falls_back() {
        let cfg = QueryConfig::default();

        let row = RowSnapshot::from_pairs([
            ("img_desc", "nan"),
            ("keywords", "g a l a x y   p h o n e"),
            ("text", "buy now"),
        ]);
        assert_eq!(build_query(&row, &cfg), "galaxy phone");

        let row = RowSnapshot::from_pairs([("img_desc", "unknown"), ("text", "Buy Now!")]);
        assert_eq!(build_query(&row, &cfg), "buy now");

        let row = RowSnapshot::from_pairs([("other", "x")]);
        assert_eq!(build_query(&row, &cfg), "");
    }

    #[test]
    fn fingerprint_is_case_and_space_insensitive() {
        let a = query_fingerprint("Red  Sneakers");
        let b = query_fingerprint("red sneakers");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, query_fingerprint("blue sneakers"));
    }
}
