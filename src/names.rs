// 🔤 Name normalization + similarity
//
// "BIG4 Sunny Caravan Park", "Sunny Caravan Park" and "SUNNY  CARAVAN PARK"
// must compare as the same park; "Lakeside Tourist Park" and
// "Riverside Tourist Park" must not.

use std::collections::BTreeSet;
use strsim::{jaro_winkler, normalized_levenshtein};

/// Words that say "this is a park" but not which one. Operator brand words
/// are here too: they are shared by dozens of unrelated parks.
const GENERIC_TOKENS: [&str; 30] = [
    "the", "and", "of", "at", "on", "by",
    "caravan", "park", "parks", "holiday", "holidays", "tourist", "tourism",
    "camping", "camp", "campground", "ground", "grounds", "resort", "village",
    "van", "cabins", "motor", "rv",
    "big4", "nrma", "discovery", "gday", "ingenia", "reflections",
];

/// Tokens shorter than this never count as significant
const MIN_SIGNIFICANT_LEN: usize = 3;

/// Disjoint significant tokens scale the score down by this much
const DISJOINT_PENALTY: f64 = 0.6;

/// Lowercase, keep letters/digits/spaces, collapse whitespace.
/// "G'Day Parks - Byron" → "gday parks byron"
pub fn normalize_name(raw: &str) -> String {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .map(|c| if c == '-' { ' ' } else { c })
        .flat_map(|c| c.to_lowercase())
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Collapse whitespace but keep the original casing for display
pub fn clean_display(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn tokens(normalized: &str) -> BTreeSet<&str> {
    normalized.split_whitespace().collect()
}

/// Tokens that can identify a park: long enough and not generic
pub fn significant_tokens(normalized: &str) -> BTreeSet<&str> {
    normalized
        .split_whitespace()
        .filter(|t| t.chars().count() >= MIN_SIGNIFICANT_LEN)
        .filter(|t| !GENERIC_TOKENS.contains(t))
        .collect()
}

/// Token-set ratio: compares the shared tokens against each side's full
/// token list, so a name that only adds a brand prefix still scores 1.0.
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let shared: Vec<&str> = ta.intersection(&tb).copied().collect();
    let only_a: Vec<&str> = ta.difference(&tb).copied().collect();
    let only_b: Vec<&str> = tb.difference(&ta).copied().collect();

    if !shared.is_empty() && (only_a.is_empty() || only_b.is_empty()) {
        return 1.0;
    }

    let sect = shared.join(" ");
    let join = |rest: &[&str]| -> String {
        let mut all: Vec<&str> = shared.clone();
        all.extend_from_slice(rest);
        all.join(" ")
    };
    let combined_a = join(&only_a);
    let combined_b = join(&only_b);

    let mut best = normalized_levenshtein(&combined_a, &combined_b);
    if !sect.is_empty() {
        best = best
            .max(normalized_levenshtein(&sect, &combined_a))
            .max(normalized_levenshtein(&sect, &combined_b));
    }
    best
}

/// Similarity of two already-normalized names in [0, 1]
pub fn name_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let jw = jaro_winkler(a, b);
    let ts = token_set_ratio(a, b);

    let sig_a = significant_tokens(a);
    let sig_b = significant_tokens(b);

    if sig_a.is_empty() || sig_b.is_empty() {
        // "Caravan Park" says nothing about which park
        return jw.min(ts);
    }
    if sig_a.is_disjoint(&sig_b) {
        return jw.min(ts) * DISJOINT_PENALTY;
    }
    jw.max(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Sunny   CARAVAN Park "), "sunny caravan park");
        assert_eq!(normalize_name("G'Day Parks - Byron"), "gday parks byron");
        assert_eq!(normalize_name("Tweed (Holiday) Park!"), "tweed holiday park");
        assert_eq!(normalize_name("***"), "");
    }

    #[test]
    fn test_clean_display_keeps_case() {
        assert_eq!(clean_display("  BIG4  Sunny Park "), "BIG4 Sunny Park");
    }

    #[test]
    fn test_significant_tokens_skip_generic_words() {
        let sig = significant_tokens("big4 sunny caravan park");
        assert_eq!(sig.into_iter().collect::<Vec<_>>(), vec!["sunny"]);
        assert!(significant_tokens("the caravan park").is_empty());
    }

    #[test]
    fn test_identical_names() {
        assert_eq!(name_similarity("sunny caravan park", "sunny caravan park"), 1.0);
    }

    #[test]
    fn test_brand_prefix_still_matches() {
        let s = name_similarity("big4 sunny caravan park", "sunny caravan park");
        assert!(s >= 0.99, "got {}", s);
    }

    #[test]
    fn test_abbreviation_scores_high() {
        let s = name_similarity("sunny caravan park", "sunny caravan pk");
        assert!(s > 0.9, "got {}", s);
    }

    #[test]
    fn test_different_parks_score_low() {
        let s = name_similarity("lakeside tourist park", "riverside tourist park");
        assert!(s < 0.6, "got {}", s);
    }

    #[test]
    fn test_generic_only_name_is_not_a_strong_match() {
        let s = name_similarity("caravan park", "sunny caravan park");
        assert!(s < 0.85, "got {}", s);
    }

    #[test]
    fn test_empty_name_never_matches() {
        assert_eq!(name_similarity("", "sunny caravan park"), 0.0);
        assert_eq!(token_set_ratio("", "x"), 0.0);
    }
}
