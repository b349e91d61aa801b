//! Sentence boundary detection tuned for legal text
//!
//! Plain terminator splitting shreds citations ("Roe v. Wade, 410 U.S. 113")
//! into fragments. The splitter here checks the token ending at each period
//! against a table of citation and title abbreviations, and refuses to break
//! inside decimal numbers.

use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Abbreviations whose trailing period never ends a sentence
static ABBREVIATIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "v.", "vs.", "co.", "corp.", "inc.", "ltd.", "llc.", "no.", "nos.", "id.", "u.s.",
        "u.s.c.", "cal.", "fed.", "mr.", "mrs.", "ms.", "dr.", "jr.", "sr.", "st.", "art.",
        "sec.", "stat.", "cir.", "dist.", "supp.", "rev.", "etc.", "e.g.", "i.e.", "app.",
        "div.", "dep't.", "reg.", "pub.", "l.", "ch.",
    ]
    .into_iter()
    .collect()
});

/// A sentence span as byte offsets into the source text (end exclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sentence {
    pub start: usize,
    pub end: usize,
}

/// Split `text` into sentence spans
///
/// Boundaries are terminator characters (`.`, `?`, `!`) followed by
/// whitespace or end of input, excluding abbreviation periods and decimal
/// points. Trailing closing quotes and parentheses stay with their sentence.
pub fn split_sentences(text: &str) -> Vec<Sentence> {
    let bytes = text.as_bytes();
    let mut sentences = Vec::new();
    let mut start = skip_whitespace(bytes, 0);
    let mut i = start;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'.' || b == b'?' || b == b'!' {
            // Swallow a run of terminators ("?!", "...").
            let mut end = i + 1;
            while end < bytes.len() && matches!(bytes[end], b'.' | b'?' | b'!') {
                end += 1;
            }
            // Keep closing quotes and parentheses attached.
            while end < bytes.len() && matches!(bytes[end], b'"' | b'\'' | b')' | b']') {
                end += 1;
            }

            let followed_by_break = end >= bytes.len() || bytes[end].is_ascii_whitespace();
            if followed_by_break && is_boundary(bytes, start, i, end) {
                sentences.push(Sentence { start, end });
                start = skip_whitespace(bytes, end);
                i = start;
                continue;
            }
            i = end;
            continue;
        }
        i += 1;
    }

    if start < bytes.len() {
        let end = trim_trailing_whitespace(bytes, start);
        if end > start {
            sentences.push(Sentence { start, end });
        }
    }
    sentences
}

fn is_boundary(bytes: &[u8], sentence_start: usize, terminator: usize, _end: usize) -> bool {
    if bytes[terminator] != b'.' {
        return true;
    }
    // Decimal point: digit on both sides.
    if terminator > 0
        && terminator + 1 < bytes.len()
        && bytes[terminator - 1].is_ascii_digit()
        && bytes[terminator + 1].is_ascii_digit()
    {
        return false;
    }
    // Abbreviation: the whitespace-delimited token ending at this period.
    let mut token_start = terminator;
    while token_start > sentence_start && !bytes[token_start - 1].is_ascii_whitespace() {
        token_start -= 1;
    }
    let token = std::str::from_utf8(&bytes[token_start..=terminator])
        .unwrap_or_default()
        .to_ascii_lowercase();
    !ABBREVIATIONS.contains(token.as_str())
}

fn skip_whitespace(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn trim_trailing_whitespace(bytes: &[u8], start: usize) -> usize {
    let mut end = bytes.len();
    while end > start && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(source: &str) -> Vec<&str> {
        split_sentences(source)
            .into_iter()
            .map(|s| &source[s.start..s.end])
            .collect()
    }

    #[test]
    fn test_plain_sentences() {
        let got = texts("First sentence. Second sentence! Third?");
        assert_eq!(
            got,
            vec!["First sentence.", "Second sentence!", "Third?"]
        );
    }

    #[test]
    fn test_citation_not_split() {
        let got = texts("See Roe v. Wade, 410 U.S. 113. The holding was later revisited.");
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], "See Roe v. Wade, 410 U.S. 113.");
    }

    #[test]
    fn test_company_abbreviation_not_split() {
        let got = texts("The contract names Acme Co. as the supplier. Delivery is due in May.");
        assert_eq!(got.len(), 2);
        assert!(got[0].ends_with("as the supplier."));
    }

    #[test]
    fn test_decimal_not_split() {
        let got = texts("The rate is 3.25 percent. Interest accrues daily.");
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], "The rate is 3.25 percent.");
    }

    #[test]
    fn test_no_trailing_terminator() {
        let got = texts("An unterminated fragment");
        assert_eq!(got, vec!["An unterminated fragment"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn test_closing_quote_stays_attached() {
        let got = texts("He said \"stop.\" Then he left.");
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], "He said \"stop.\"");
    }
}
