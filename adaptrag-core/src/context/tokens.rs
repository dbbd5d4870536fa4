//! Mixed-script token estimation.
//!
//! Dense scripts (CJK ideographs, kana, hangul) average well under two
//! characters per token, while Latin-script text averages about four. A flat
//! per-character rate is wrong for both, so the two are counted separately.

/// Characters per token for dense-script text.
const DENSE_CHARS_PER_TOKEN: f64 = 1.5;
/// Characters per token for everything else.
const LATIN_CHARS_PER_TOKEN: f64 = 4.0;

/// Whether a character belongs to a dense (roughly one-token-per-glyph) script.
pub fn is_dense_script(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF     // hiragana, katakana
        | 0x3400..=0x4DBF   // CJK extension A
        | 0x4E00..=0x9FFF   // CJK unified ideographs
        | 0xAC00..=0xD7AF   // hangul syllables
        | 0xF900..=0xFAFF   // CJK compatibility ideographs
        | 0xFF00..=0xFFEF   // fullwidth forms
        | 0x3000..=0x303F   // CJK punctuation
        | 0x20000..=0x2A6DF // CJK extension B
    )
}

/// Estimate the token count of a piece of text.
///
/// Non-empty text always counts as at least one token.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let (dense, other) = text.chars().fold((0usize, 0usize), |(d, o), c| {
        if is_dense_script(c) {
            (d + 1, o)
        } else {
            (d, o + 1)
        }
    });
    let estimate =
        dense as f64 / DENSE_CHARS_PER_TOKEN + other as f64 / LATIN_CHARS_PER_TOKEN;
    (estimate.ceil() as usize).max(1)
}
