//! Shared text normalization for track/artist matching.
//! Used by the offline store builder, both resolvers and the mapping cache.
//!
//! CRITICAL: the offline database stores `*_clean` columns precomputed with
//! these functions. Any change here requires a rebuild of the optimized DB.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashSet;
use strsim::normalized_levenshtein;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// CHARACTER TABLES
// ============================================================================

/// Apostrophe variants mapped to the straight apostrophe:
/// left/right single curly quote, modifier letter apostrophe, modifier
/// letter prime, grave accent, acute accent.
const APOSTROPHE_VARIANTS: &[char] = &[
    '\u{2018}', '\u{2019}', '\u{02BC}', '\u{02B9}', '\u{0060}', '\u{00B4}',
];

/// Double-quote variants mapped to the straight quote:
/// left/right curly, low-9, angle quotes and single guillemets.
const QUOTE_VARIANTS: &[char] = &[
    '\u{201C}', '\u{201D}', '\u{201E}', '\u{00AB}', '\u{00BB}', '\u{2039}', '\u{203A}',
];

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// Parenthetical and bracketed content: "(Remastered 2019)", "[Bonus Track]".
static PARENTHETICAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\([^)]*\)|\[[^\]]*\]").unwrap());

/// Featured-artist suffix without brackets: "Song feat. Artist".
static FEAT_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(?:feat\.?|featuring|ft\.?)\s+.*$").unwrap());

/// Connector words that split a collaboration credit into individual artists.
/// Checked against whitespace-delimited words of the normalized credit, so
/// the boundaries are exact; "android" never splits on "and".
const CONNECTOR_WORDS: &[&str] = &[
    "feat", "feat.", "featuring", "ft", "ft.", "with", "and", "vs", "vs.", "versus", "x",
];

// ============================================================================
// NORMALIZATION
// ============================================================================

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn map_quote_variant(c: char) -> char {
    if APOSTROPHE_VARIANTS.contains(&c) {
        '\''
    } else if QUOTE_VARIANTS.contains(&c) {
        '"'
    } else {
        c
    }
}

/// Base normalization applied before any comparison: NFKC fold, apostrophe
/// and quote unification, lowercase, whitespace collapse.
///
/// The variant mapping runs on both sides of the NFKC pass: U+00B4 would
/// otherwise decompose into space + combining acute before the table sees it.
///
/// Idempotent: `normalize_base(normalize_base(s)) == normalize_base(s)`.
pub fn normalize_base(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let premapped: String = s.chars().map(map_quote_variant).collect();
    let folded: String = premapped.nfkc().map(map_quote_variant).collect();
    collapse_whitespace(&folded.to_lowercase())
}

/// [`normalize_base`] plus stylized-dollar handling: `$` becomes `s` only
/// when flanked by word characters on both sides, so "A$AP" → "asap" while
/// "$100" keeps its dollar sign.
pub fn normalize_for_matching(s: &str) -> String {
    let base = normalize_base(s);
    let chars: Vec<char> = base.chars().collect();
    let mut out = String::with_capacity(base.len());
    for (i, &c) in chars.iter().enumerate() {
        let flanked = c == '$'
            && i > 0
            && chars[i - 1].is_alphanumeric()
            && chars.get(i + 1).is_some_and(|n| n.is_alphanumeric());
        out.push(if flanked { 's' } else { c });
    }
    out
}

/// Conservative cleaner used for DB indexing and human-visible comparison:
/// [`normalize_base`], strip parenthetical/bracketed content, strip
/// "feat"/"featuring"/"ft." suffixes, collapse whitespace.
///
/// Idempotent, and the result never contains curly apostrophes/quotes or
/// doubled internal whitespace.
pub fn clean_conservative(s: &str) -> String {
    let mut result = normalize_base(s);
    result = PARENTHETICAL.replace_all(&result, " ").into_owned();
    result = FEAT_SUFFIX.replace(&result, "").into_owned();
    collapse_whitespace(&result)
}

/// Last-resort matching key: [`clean_conservative`], transliterate to ASCII,
/// drop everything that is not alphanumeric. "Beyoncé – Halo!" → "beyoncehalo".
pub fn clean_aggressive(s: &str) -> String {
    let conservative = clean_conservative(s);
    any_ascii(&conservative)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

// ============================================================================
// TOKENIZATION
// ============================================================================

/// Split an artist credit on collaboration connectors
/// (feat/featuring/ft/with/&/and/vs/versus/x plus comma) into a set of
/// normalized artist tokens. Empty tokens are dropped.
///
/// "A feat. B" yields {"a", "b"}; "A & B & C" yields {"a", "b", "c"}.
pub fn tokenize_artist_credit(s: &str) -> FxHashSet<String> {
    let base = normalize_for_matching(s)
        .replace('&', " & ")
        .replace(',', " , ");
    let mut tokens = FxHashSet::default();
    let mut current: Vec<&str> = Vec::new();
    for word in base.split_whitespace() {
        if word == "&" || word == "," || CONNECTOR_WORDS.contains(&word) {
            if !current.is_empty() {
                tokens.insert(current.join(" "));
                current.clear();
            }
        } else {
            current.push(word);
        }
    }
    if !current.is_empty() {
        tokens.insert(current.join(" "));
    }
    tokens
}

// ============================================================================
// PHONETIC & FUZZY SIMILARITY
// ============================================================================

fn soundex_digit(c: char) -> u8 {
    match c {
        'B' | 'F' | 'P' | 'V' => 1,
        'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => 2,
        'D' | 'T' => 3,
        'L' => 4,
        'M' | 'N' => 5,
        'R' => 6,
        _ => 0,
    }
}

/// Classic 4-character Soundex: first letter plus three digits, skipping
/// repeats and zero-coded letters, zero-padded. Non-ASCII letters are
/// ignored; an input with no ASCII letters yields the empty string.
pub fn soundex(s: &str) -> String {
    let mut letters = s
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase());
    let Some(first) = letters.next() else {
        return String::new();
    };
    let mut code = String::with_capacity(4);
    code.push(first);
    let mut prev = soundex_digit(first);
    for c in letters {
        let digit = soundex_digit(c);
        if digit != 0 && digit != prev {
            code.push((b'0' + digit) as char);
            if code.len() == 4 {
                break;
            }
        }
        prev = digit;
    }
    while code.len() < 4 {
        code.push('0');
    }
    code
}

fn code_agreement(a: &str, b: &str) -> f64 {
    let matching = a
        .chars()
        .zip(b.chars())
        .filter(|(x, y)| x == y)
        .count();
    matching as f64 / 4.0
}

/// Word-level Soundex similarity in [0, 1]: each word of the shorter name is
/// paired with its best-agreeing word of the other, averaged over the longer
/// word count. Equal codes give 1.0 ("smith" vs "smyth").
pub fn phonetic_similarity(a: &str, b: &str) -> f64 {
    let codes_a: Vec<String> = a.split_whitespace().map(soundex).collect();
    let codes_b: Vec<String> = b.split_whitespace().map(soundex).collect();
    if codes_a.is_empty() || codes_b.is_empty() {
        return 0.0;
    }
    let (short, long) = if codes_a.len() <= codes_b.len() {
        (&codes_a, &codes_b)
    } else {
        (&codes_b, &codes_a)
    };
    let total: f64 = short
        .iter()
        .map(|ca| {
            long.iter()
                .map(|cb| code_agreement(ca, cb))
                .fold(0.0, f64::max)
        })
        .sum();
    total / long.len() as f64
}

/// Levenshtein-based similarity in [0, 1]. Symmetric; identical strings
/// score 1.0. Only consulted in high-accuracy mode.
pub fn fuzzy_ratio(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b)
}

/// Blended artist similarity: 0.6 edit-distance + 0.4 phonetic, with a 10%
/// boost (capped at 1.0) when both components are individually strong
/// (fuzzy > 0.8 and phonetic > 0.75).
pub fn enhanced_artist_similarity(a: &str, b: &str) -> f64 {
    let fuzzy = fuzzy_ratio(a, b);
    let phonetic = phonetic_similarity(a, b);
    let mut blended = 0.6 * fuzzy + 0.4 * phonetic;
    if fuzzy > 0.8 && phonetic > 0.75 {
        blended = (blended * 1.1).min(1.0);
    }
    blended
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_unifies_punctuation() {
        assert_eq!(normalize_base("Don\u{2019}t  Stop"), "don't stop");
        assert_eq!(normalize_base("\u{201C}Heroes\u{201D}"), "\"heroes\"");
        assert_eq!(normalize_base("Can\u{00B4}t"), "can't");
    }

    #[test]
    fn normalize_base_is_idempotent() {
        for s in ["Don\u{2019}t Stop", "  A   B  ", "ｆｕｌｌｗｉｄｔｈ", "Crème Brûlée"] {
            let once = normalize_base(s);
            assert_eq!(normalize_base(&once), once);
        }
    }

    #[test]
    fn normalize_base_empty() {
        assert_eq!(normalize_base(""), "");
    }

    #[test]
    fn normalize_for_matching_stylized_dollar() {
        assert_eq!(normalize_for_matching("A$AP Rocky"), "asap rocky");
        assert_eq!(normalize_for_matching("$100 Bill"), "$100 bill");
        assert_eq!(normalize_for_matching("Too $hort"), "too $hort");
        assert_eq!(normalize_for_matching("Ke$ha"), "kesha");
    }

    #[test]
    fn clean_conservative_strips_qualifiers() {
        assert_eq!(clean_conservative("Song (2021 Remaster)"), "song");
        assert_eq!(clean_conservative("Track [Live at Wembley]"), "track");
        assert_eq!(clean_conservative("Hit feat. Someone"), "hit");
        assert_eq!(clean_conservative("Hit featuring A & B"), "hit");
        assert_eq!(clean_conservative("Plain Title"), "plain title");
    }

    #[test]
    fn clean_conservative_is_idempotent() {
        for s in [
            "Song (Deluxe) [Bonus] feat. X",
            "Don\u{2019}t Stop Me Now",
            "A  B   C",
        ] {
            let once = clean_conservative(s);
            assert_eq!(clean_conservative(&once), once);
        }
    }

    #[test]
    fn clean_conservative_no_variant_chars_or_doubled_space() {
        let cleaned = clean_conservative("\u{2018}Round  Midnight \u{201C}Take 2\u{201D}");
        assert!(!cleaned.contains('\u{2018}'));
        assert!(!cleaned.contains('\u{201C}'));
        assert!(!cleaned.contains("  "));
    }

    #[test]
    fn clean_aggressive_ascii_alnum_only() {
        assert_eq!(clean_aggressive("Beyoncé – Halo!"), "beyoncehalo");
        assert_eq!(clean_aggressive("Sigur Rós"), "sigurros");
        assert!(clean_aggressive("...").is_empty());
    }

    #[test]
    fn tokenize_feat() {
        let tokens = tokenize_artist_credit("A feat. B");
        assert!(tokens.contains("a"));
        assert!(tokens.contains("b"));
    }

    #[test]
    fn tokenize_ampersands() {
        let tokens = tokenize_artist_credit("A & B & C");
        assert!(tokens.contains("a"));
        assert!(tokens.contains("b"));
        assert!(tokens.contains("c"));
    }

    #[test]
    fn tokenize_multiword_artists() {
        let tokens = tokenize_artist_credit("Daft Punk feat. Pharrell Williams");
        assert!(tokens.contains("daft punk"));
        assert!(tokens.contains("pharrell williams"));
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn tokenize_does_not_split_inside_words() {
        let tokens = tokenize_artist_credit("Band of Horses");
        assert!(tokens.contains("band of horses"));
        let tokens = tokenize_artist_credit("Android");
        assert!(tokens.contains("android"));
    }

    #[test]
    fn tokenize_vs_and_x() {
        let tokens = tokenize_artist_credit("DJ Snake x Lil Jon");
        assert!(tokens.contains("dj snake"));
        assert!(tokens.contains("lil jon"));
        let tokens = tokenize_artist_credit("Artist1 vs. Artist2");
        assert!(tokens.contains("artist1"));
        assert!(tokens.contains("artist2"));
    }

    #[test]
    fn tokenize_drops_empty() {
        assert!(tokenize_artist_credit("").is_empty());
        assert!(tokenize_artist_credit(" & ").is_empty());
    }

    #[test]
    fn soundex_classic_codes() {
        assert_eq!(soundex("Smith"), "S530");
        assert_eq!(soundex("Smyth"), "S530");
        assert_eq!(soundex("Robert"), "R163");
        assert_eq!(soundex("Rupert"), "R163");
        assert_eq!(soundex("Ashcraft"), "A226");
    }

    #[test]
    fn soundex_length_and_determinism() {
        for s in ["Weeknd", "Tchaikovsky", "A", "bb"] {
            let code = soundex(s);
            assert_eq!(code.len(), 4, "code for {s:?}");
            assert_eq!(soundex(s), code);
        }
        assert_eq!(soundex(""), "");
    }

    #[test]
    fn fuzzy_ratio_contract() {
        assert!((fuzzy_ratio("the weeknd", "the weeknd") - 1.0).abs() < f64::EPSILON);
        let ab = fuzzy_ratio("metallica", "megadeth");
        let ba = fuzzy_ratio("megadeth", "metallica");
        assert!((ab - ba).abs() < f64::EPSILON);
        assert!(fuzzy_ratio("weeknd", "weekend") > 0.8);
    }

    #[test]
    fn phonetic_similarity_equal_codes() {
        assert!((phonetic_similarity("smith", "smyth") - 1.0).abs() < f64::EPSILON);
        assert!(phonetic_similarity("john smith", "jon smyth") > 0.9);
        assert!(phonetic_similarity("metallica", "enya") < 0.5);
        assert_eq!(phonetic_similarity("", "smith"), 0.0);
    }

    #[test]
    fn enhanced_similarity_boost_capped() {
        let s = enhanced_artist_similarity("the weeknd", "the weeknd");
        assert!(s <= 1.0);
        assert!(s > 0.99);
        // Misspelling stays above the fuzzy acceptance floor.
        assert!(enhanced_artist_similarity("linkin park", "linkn park") >= 0.8);
        assert!(enhanced_artist_similarity("adele", "rammstein") < 0.5);
    }
}
