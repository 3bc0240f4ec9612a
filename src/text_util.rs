//! Text normalization and tokenization for OCR page text.
//!
//! Invoice pages mix Japanese (often with half-width katakana and
//! full-width digits from the scanner) with Latin product codes and
//! amounts. [`normalize`] folds the width variants onto one form so the
//! same page always produces the same text, and [`tokenize`] splits the
//! result into terms suitable for BM25: whole words for Latin/digit runs,
//! character bigrams for CJK runs.

/// Maximum number of characters in a snippet before truncation.
pub const DEFAULT_SNIPPET_MAX_CHARS: usize = 160;

const IDEOGRAPHIC_SPACE: char = '\u{3000}';
const HALFWIDTH_VOICED_MARK: char = '\u{FF9E}';
const HALFWIDTH_SEMI_VOICED_MARK: char = '\u{FF9F}';

/// Full-width katakana for U+FF66..=U+FF9D, in code point order.
const HALFWIDTH_KATAKANA: [char; 56] = [
    'ヲ', 'ァ', 'ィ', 'ゥ', 'ェ', 'ォ', 'ャ', 'ュ', 'ョ', 'ッ', 'ー', 'ア',
    'イ', 'ウ', 'エ', 'オ', 'カ', 'キ', 'ク', 'ケ', 'コ', 'サ', 'シ', 'ス',
    'セ', 'ソ', 'タ', 'チ', 'ツ', 'テ', 'ト', 'ナ', 'ニ', 'ヌ', 'ネ', 'ノ',
    'ハ', 'ヒ', 'フ', 'ヘ', 'ホ', 'マ', 'ミ', 'ム', 'メ', 'モ', 'ヤ', 'ユ',
    'ヨ', 'ラ', 'リ', 'ル', 'レ', 'ロ', 'ワ', 'ン',
];

/// Normalize raw extracted page text.
///
/// - full-width ASCII and the ideographic space become ASCII
/// - half-width katakana become full-width, composing voiced marks
/// - zero-width characters are dropped
/// - digit-group commas are removed (`1,234` becomes `1234`)
/// - whitespace runs collapse to one space, ends are trimmed
///
/// Case is preserved. Never fails; empty or whitespace-only input yields
/// an empty string.
///
/// # Examples
///
/// ```
/// use rebate_rag::text_util::normalize;
///
/// assert_eq!(normalize("  請求書\n\n合計 ￥１２,３４０  "), "請求書 合計 ¥12340");
/// assert_eq!(normalize("ｶﾞｿﾘﾝ"), "ガソリン");
/// ```
pub fn normalize(raw: &str) -> String {
    let mut folded: Vec<char> = Vec::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            HALFWIDTH_VOICED_MARK => match folded.last().copied() {
                Some(prev) if voiced(prev).is_some() => {
                    folded.pop();
                    folded.extend(voiced(prev));
                }
                _ => folded.push('\u{309B}'),
            },
            HALFWIDTH_SEMI_VOICED_MARK => match folded.last().copied() {
                Some(prev) if semi_voiced(prev).is_some() => {
                    folded.pop();
                    folded.extend(semi_voiced(prev));
                }
                _ => folded.push('\u{309C}'),
            },
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' => {}
            other => folded.push(fold_width(other)),
        }
    }

    let mut out = String::with_capacity(folded.len());
    let mut pending_space = false;
    for (i, &c) in folded.iter().enumerate() {
        if c.is_whitespace() || c.is_control() {
            pending_space = !out.is_empty();
            continue;
        }
        if c == ','
            && !pending_space
            && out.chars().next_back().is_some_and(|p| p.is_ascii_digit())
            && folded.get(i + 1).is_some_and(|n| n.is_ascii_digit())
        {
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }
    out
}

fn fold_width(c: char) -> char {
    let code = c as u32;
    match code {
        0xFF01..=0xFF5E => char::from_u32(code - 0xFEE0).unwrap_or(c),
        0xFF61 => '。',
        0xFF62 => '「',
        0xFF63 => '」',
        0xFF64 => '、',
        0xFF65 => '・',
        0xFF66..=0xFF9D => HALFWIDTH_KATAKANA[(code - 0xFF66) as usize],
        0xFFE0 => '¢',
        0xFFE1 => '£',
        0xFFE5 => '¥',
        0xFFE6 => '₩',
        _ if c == IDEOGRAPHIC_SPACE => ' ',
        _ => c,
    }
}

fn voiced(c: char) -> Option<char> {
    let code = c as u32;
    let shifted = match code {
        // カ..チ sit on odd code points with the voiced form right after.
        0x30AB..=0x30C1 if (code - 0x30AB) % 2 == 0 => code + 1,
        0x30C4 | 0x30C6 | 0x30C8 => code + 1,
        0x30CF | 0x30D2 | 0x30D5 | 0x30D8 | 0x30DB => code + 1,
        0x30A6 => 0x30F4,
        _ => return None,
    };
    char::from_u32(shifted)
}

fn semi_voiced(c: char) -> Option<char> {
    let code = c as u32;
    match code {
        0x30CF | 0x30D2 | 0x30D5 | 0x30D8 | 0x30DB => char::from_u32(code + 2),
        _ => None,
    }
}

/// Whether `c` belongs to a script written without word separators.
pub fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3005
            | 0x3040..=0x309F
            | 0x30A0..=0x30FF
            | 0x31F0..=0x31FF
            | 0x3400..=0x4DBF
            | 0x4E00..=0x9FFF
            | 0xAC00..=0xD7AF
            | 0xF900..=0xFAFF
    )
}

fn is_currency(c: char) -> bool {
    matches!(c, '¥' | '$' | '€' | '£' | '¢' | '₩')
}

/// Split normalized text into lexical terms.
///
/// Latin words and digit runs become single lowercase terms, runs of CJK
/// characters become overlapping bigrams (a lone CJK character is kept as
/// a unigram) and currency symbols are standalone terms. Everything else
/// separates terms.
///
/// # Examples
///
/// ```
/// use rebate_rag::text_util::tokenize;
///
/// assert_eq!(tokenize("合計金額 ¥1200 Total"), vec![
///     "合計", "計金", "金額", "¥", "1200", "total"
/// ]);
/// ```
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    for c in text.chars() {
        if is_cjk(c) {
            flush_word(&mut word, &mut tokens);
            cjk_run.push(c);
        } else if c.is_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut tokens);
            word.extend(c.to_lowercase());
        } else {
            flush_word(&mut word, &mut tokens);
            flush_cjk(&mut cjk_run, &mut tokens);
            if is_currency(c) {
                tokens.push(c.to_string());
            }
        }
    }
    flush_word(&mut word, &mut tokens);
    flush_cjk(&mut cjk_run, &mut tokens);
    tokens
}

fn flush_word(word: &mut String, tokens: &mut Vec<String>) {
    if !word.is_empty() {
        tokens.push(std::mem::take(word));
    }
}

fn flush_cjk(run: &mut Vec<char>, tokens: &mut Vec<String>) {
    match run.len() {
        0 => {}
        1 => tokens.push(run[0].to_string()),
        _ => tokens.extend(run.windows(2).map(|w| w.iter().collect())),
    }
    run.clear();
}

/// Shorten text for display, cutting on a character boundary.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let mut chars = text.char_indices();
    match chars.nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn collapses_whitespace() {
        assert_eq!(normalize("a \t b\n\n\nc"), "a b c");
        assert_eq!(normalize("   "), "");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn folds_full_width_ascii() {
        assert_eq!(normalize("ＡＢＣ１２３"), "ABC123");
        assert_eq!(normalize("品番：Ａ－１"), "品番:A-1");
    }

    #[test]
    fn ideographic_space_is_whitespace() {
        assert_eq!(normalize("請求\u{3000}\u{3000}書"), "請求 書");
    }

    #[test]
    fn half_width_katakana_composes_voiced_marks() {
        assert_eq!(normalize("ﾊﾟﾝ ﾀﾞﾝﾎﾞｰﾙ"), "パン ダンボール");
        assert_eq!(normalize("ｳﾞｨ"), "ヴィ");
    }

    #[test]
    fn stray_voiced_mark_is_kept() {
        assert_eq!(normalize("aﾞ"), "a\u{309B}");
    }

    #[test]
    fn removes_digit_group_separators() {
        assert_eq!(normalize("1,234,567円"), "1234567円");
        assert_eq!(normalize("１，２００"), "1200");
    }

    #[test]
    fn keeps_commas_between_words() {
        assert_eq!(normalize("a,b 1, 2"), "a,b 1, 2");
    }

    #[test]
    fn preserves_case_and_currency() {
        assert_eq!(normalize("Total ￥500 $3"), "Total ¥500 $3");
    }

    #[test]
    fn drops_zero_width_characters() {
        assert_eq!(normalize("合\u{200B}計\u{FEFF}"), "合計");
    }

    #[test]
    fn tokenize_mixed_text() {
        let tokens = tokenize("リベート 2024年 ABC-12");
        assert_eq!(
            tokens,
            vec!["リベ", "ベー", "ート", "2024", "年", "abc", "12"]
        );
    }

    #[test]
    fn tokenize_single_cjk_character() {
        assert_eq!(tokenize("円"), vec!["円"]);
    }

    #[test]
    fn tokenize_empty() {
        assert!(tokenize("").is_empty());
        assert!(tokenize(" - , ").is_empty());
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let text = "請求書".repeat(100);
        let s = snippet(&text, 10);
        assert_eq!(s.chars().count(), 13);
        assert!(s.ends_with("..."));
        assert_eq!(snippet("short", 10), "short");
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(s in "\\PC{0,64}") {
            let once = normalize(&s);
            prop_assert_eq!(normalize(&once), once);
        }

        #[test]
        fn normalize_has_no_edge_or_double_spaces(s in "[ a-z\\t\\n\u{3000}あ-ん]{0,64}") {
            let out = normalize(&s);
            prop_assert!(!out.starts_with(' '));
            prop_assert!(!out.ends_with(' '));
            prop_assert!(!out.contains("  "));
        }
    }
}
