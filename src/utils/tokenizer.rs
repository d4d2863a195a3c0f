//! Tokenizer and character offset mapping.
//!
//! Tokens are maximal runs of word characters; every other non-whitespace
//! character is a token of its own. Whitespace is never part of a token, so
//! tokens plus the whitespace gaps between them tile the whole text.
//!
//! All offsets are Unicode scalar (char) offsets. [`OffsetMap`] converts them
//! back to byte offsets for slicing.

use crate::error::TokenizationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Sentence-final punctuation tokens
const SENTENCE_TERMINATORS: [&str; 3] = [".", "!", "?"];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\w+|\S").expect("token pattern is valid"))
}

/// Half-open character range `[begin, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TextSpan {
    pub begin: u32,
    pub end: u32,
}

impl TextSpan {
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// True if both ranges share at least one character
    pub fn intersects(&self, begin: u32, end: u32) -> bool {
        self.begin < end && begin < self.end
    }
}

/// Token and sentence boundaries of one text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizedText {
    pub tokens: Vec<TextSpan>,
    pub sentences: Vec<TextSpan>,
}

/// Maps char offsets to byte offsets of a text
#[derive(Debug, Clone, Default)]
pub struct OffsetMap {
    /// Byte offset of every char, plus the text length. Empty for ASCII text.
    byte_offsets: Vec<u32>,
    char_len: u32,
}

impl OffsetMap {
    pub fn new(text: &str) -> Self {
        if text.is_ascii() {
            return Self {
                byte_offsets: Vec::new(),
                char_len: text.len() as u32,
            };
        }

        let mut byte_offsets: Vec<u32> = text.char_indices().map(|(b, _)| b as u32).collect();
        let char_len = byte_offsets.len() as u32;
        byte_offsets.push(text.len() as u32);

        Self {
            byte_offsets,
            char_len,
        }
    }

    /// Length of the text in chars
    pub fn char_len(&self) -> u32 {
        self.char_len
    }

    /// Byte offset of a char offset (clamped to the text length)
    pub fn byte(&self, char_offset: u32) -> usize {
        let c = char_offset.min(self.char_len);
        if self.byte_offsets.is_empty() {
            c as usize
        } else {
            self.byte_offsets[c as usize] as usize
        }
    }

    /// Char offset of a byte offset that lies on a char boundary
    pub fn char_at_byte(&self, byte_offset: usize) -> u32 {
        if self.byte_offsets.is_empty() {
            return (byte_offset as u32).min(self.char_len);
        }
        self.byte_offsets.partition_point(|&b| (b as usize) < byte_offset) as u32
    }

    /// Slice `text` by char offsets
    pub fn slice<'a>(&self, text: &'a str, begin: u32, end: u32) -> &'a str {
        let b = self.byte(begin);
        let e = self.byte(end.max(begin));
        &text[b..e]
    }
}

/// Check raw document content and decode it as text
pub fn decode_text(content: &[u8], max_len: usize) -> Result<&str, TokenizationError> {
    if content.len() > max_len || content.len() > u32::MAX as usize {
        return Err(TokenizationError::TooLarge { len: content.len() });
    }

    if let Some(offset) = memchr::memchr(0, content) {
        return Err(TokenizationError::BinaryContent { offset });
    }

    std::str::from_utf8(content).map_err(|e| TokenizationError::InvalidUtf8 {
        valid_up_to: e.valid_up_to(),
    })
}

/// Tokenize raw document content
pub fn tokenize(content: &[u8], max_len: usize) -> Result<TokenizedText, TokenizationError> {
    let text = decode_text(content, max_len)?;
    Ok(tokenize_str(text))
}

/// Tokenize text and derive its sentence segmentation
pub fn tokenize_str(text: &str) -> TokenizedText {
    let mut tokens = Vec::new();
    let mut terminal = Vec::new();
    let mut blank_line_before = Vec::new();

    let mut prev_byte = 0usize;
    let mut prev_char = 0u32;

    for m in token_pattern().find_iter(text) {
        let gap = &text[prev_byte..m.start()];
        let begin = prev_char + gap.chars().count() as u32;
        let end = begin + m.as_str().chars().count() as u32;

        blank_line_before.push(memchr::memchr_iter(b'\n', gap.as_bytes()).count() >= 2);
        terminal.push(SENTENCE_TERMINATORS.contains(&m.as_str()));
        tokens.push(TextSpan::new(begin, end));

        prev_byte = m.end();
        prev_char = end;
    }

    let sentences = segment_sentences(&tokens, &terminal, &blank_line_before);
    TokenizedText { tokens, sentences }
}

/// Token texts of a string, in order
pub fn split_tokens(text: &str) -> Vec<&str> {
    token_pattern().find_iter(text).map(|m| m.as_str()).collect()
}

fn segment_sentences(
    tokens: &[TextSpan],
    terminal: &[bool],
    blank_line_before: &[bool],
) -> Vec<TextSpan> {
    let mut sentences = Vec::new();
    let mut start: Option<usize> = None;

    for i in 0..tokens.len() {
        if blank_line_before[i] {
            if let Some(s) = start.take() {
                sentences.push(TextSpan::new(tokens[s].begin, tokens[i - 1].end));
            }
        }

        if start.is_none() {
            start = Some(i);
        }

        if terminal[i] {
            if let Some(s) = start.take() {
                sentences.push(TextSpan::new(tokens[s].begin, tokens[i].end));
            }
        }
    }

    if let Some(s) = start {
        sentences.push(TextSpan::new(tokens[s].begin, tokens[tokens.len() - 1].end));
    }

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    const GALICIA: &str = "The capital of Galicia is Santiago de Compostela.";

    fn texts<'a>(text: &'a str, spans: &[TextSpan]) -> Vec<&'a str> {
        let map = OffsetMap::new(text);
        spans.iter().map(|s| map.slice(text, s.begin, s.end)).collect()
    }

    #[test]
    fn test_tokenize_punctuation_is_separate() {
        let t = tokenize_str(GALICIA);
        assert_eq!(
            texts(GALICIA, &t.tokens),
            vec!["The", "capital", "of", "Galicia", "is", "Santiago", "de", "Compostela", "."]
        );
        assert_eq!(t.tokens[3], TextSpan::new(15, 22));
        assert_eq!(t.tokens[8], TextSpan::new(48, 49));
    }

    #[test]
    fn test_sentences() {
        let text = "Goodbye moon. Hello World.";
        let t = tokenize_str(text);
        assert_eq!(t.tokens.len(), 6);
        assert_eq!(texts(text, &t.sentences), vec!["Goodbye moon.", "Hello World."]);

        let t = tokenize_str(GALICIA);
        assert_eq!(t.sentences, vec![TextSpan::new(0, 49)]);
    }

    #[test]
    fn test_blank_line_ends_sentence() {
        let text = "Heading\n\nFirst line without stop";
        let t = tokenize_str(text);
        assert_eq!(texts(text, &t.sentences), vec!["Heading", "First line without stop"]);
    }

    #[test]
    fn test_tokens_and_gaps_cover_text() {
        let text = "  Él dijo: «¡hola!»\n\tadiós  ";
        let t = tokenize_str(text);
        let map = OffsetMap::new(text);

        let mut covered = 0u32;
        let mut cursor = 0u32;
        for token in &t.tokens {
            let gap = map.slice(text, cursor, token.begin);
            assert!(gap.chars().all(char::is_whitespace));
            covered += token.begin - cursor + token.len();
            cursor = token.end;
        }
        covered += map.char_len() - cursor;

        assert_eq!(covered, text.chars().count() as u32);
        assert_eq!(texts(text, &t.tokens)[0], "Él");
    }

    #[test]
    fn test_tokenize_is_deterministic() {
        assert_eq!(tokenize_str(GALICIA), tokenize_str(GALICIA));
    }

    #[test]
    fn test_offset_map_non_ascii() {
        let text = "añb";
        let map = OffsetMap::new(text);
        assert_eq!(map.char_len(), 3);
        assert_eq!(map.byte(2), 3);
        assert_eq!(map.char_at_byte(3), 2);
        assert_eq!(map.slice(text, 1, 2), "ñ");
    }

    #[test]
    fn test_reject_binary_and_invalid_utf8() {
        assert_eq!(
            tokenize(b"ab\0cd", 1024),
            Err(TokenizationError::BinaryContent { offset: 2 })
        );

        let mut late = "word ".repeat(4000).into_bytes();
        late.push(0);
        late.extend_from_slice(b" tail");
        assert_eq!(
            tokenize(&late, 1 << 20),
            Err(TokenizationError::BinaryContent { offset: 20000 })
        );
        assert_eq!(
            tokenize(&[b'a', 0xff, b'b'], 1024),
            Err(TokenizationError::InvalidUtf8 { valid_up_to: 1 })
        );
        assert_eq!(
            tokenize(b"abcdef", 3),
            Err(TokenizationError::TooLarge { len: 6 })
        );
    }

    #[test]
    fn test_empty_text() {
        let t = tokenize_str("   \n ");
        assert!(t.tokens.is_empty());
        assert!(t.sentences.is_empty());
    }
}
