//! Query parser.
//!
//! ```text
//! query       := sequence ('|' sequence)*
//! sequence    := element+
//! element     := word | '"' phrase '"' | structural
//! structural  := '<' layer ('.' feature ('=' '"' value '"')?)? '/>'
//! ```
//!
//! Words and phrases are split with the document tokenizer, so `World.`
//! matches the two tokens `World` and `.`. Elements of a sequence must match
//! adjacent tokens.

use crate::error::QueryParseError;
use crate::index::types::normalize_layer_name;
use crate::utils::tokenizer::split_tokens;

/// Parsed query: a set of alternative sequences
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub alternatives: Vec<Sequence>,
}

/// Elements that must match consecutive tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub elements: Vec<Element>,
}

impl Sequence {
    /// True if the sequence matches annotations only, not token text
    pub fn is_structural(&self) -> bool {
        self.elements.iter().all(|e| matches!(e, Element::Annotation(_)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// Exact token text
    Token(String),
    /// Annotation on a layer, optionally with a feature (value)
    Annotation(AnnotationPattern),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationPattern {
    /// Normalized layer name
    pub layer: String,
    pub feature: Option<String>,
    pub value: Option<String>,
}

/// Parse a query string
pub fn parse_query(input: &str) -> Result<Query, QueryParseError> {
    let mut parser = QueryParser::new(input);
    parser.parse()
}

struct QueryParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> QueryParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(&mut self) -> Result<Query, QueryParseError> {
        self.skip_whitespace();
        if self.is_eof() {
            return Err(QueryParseError::Empty);
        }

        let mut alternatives = vec![self.parse_sequence()?];
        while self.consume_char('|') {
            alternatives.push(self.parse_sequence()?);
        }

        Ok(Query { alternatives })
    }

    fn parse_sequence(&mut self) -> Result<Sequence, QueryParseError> {
        let start = self.pos;
        let mut elements = Vec::new();

        loop {
            self.skip_whitespace();
            match self.peek_char() {
                None | Some('|') => break,
                Some('"') => elements.extend(self.parse_phrase()?),
                Some('<') => elements.push(self.parse_structural()?),
                Some(_) => elements.extend(self.parse_word()),
            }
        }

        if elements.is_empty() {
            return Err(QueryParseError::DanglingAlternative { pos: start });
        }
        Ok(Sequence { elements })
    }

    fn parse_word(&mut self) -> Vec<Element> {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() || matches!(ch, '|' | '"' | '<') {
                break;
            }
            self.advance();
        }
        tokens_of(&self.input[start..self.pos])
    }

    fn parse_phrase(&mut self) -> Result<Vec<Element>, QueryParseError> {
        let start = self.pos;
        self.consume_char('"');

        let mut phrase = String::new();
        loop {
            match self.peek_char() {
                None => return Err(QueryParseError::UnterminatedPhrase { pos: start }),
                Some('"') => {
                    self.advance();
                    break;
                }
                // `\x` is the literal `x`
                Some('\\') => {
                    self.advance();
                    if let Some(ch) = self.peek_char() {
                        phrase.push(ch);
                        self.advance();
                    }
                }
                Some(ch) => {
                    phrase.push(ch);
                    self.advance();
                }
            }
        }

        Ok(tokens_of(&phrase))
    }

    fn parse_structural(&mut self) -> Result<Element, QueryParseError> {
        let start = self.pos;
        self.consume_char('<');
        self.skip_whitespace();

        let layer = self.parse_name(start)?;
        if layer.is_empty() {
            return Err(self.invalid("missing layer name"));
        }

        let mut feature = None;
        let mut value = None;
        if self.consume_char('.') {
            let name = self.parse_name(start)?;
            if name.is_empty() {
                return Err(self.invalid("missing feature name"));
            }
            feature = Some(name.to_string());

            self.skip_whitespace();
            if self.consume_char('=') {
                self.skip_whitespace();
                value = Some(self.parse_value(start)?);
            }
        }

        self.skip_whitespace();
        if self.is_eof() {
            return Err(QueryParseError::UnterminatedStructural { pos: start });
        }
        if !self.remaining().starts_with("/>") {
            return Err(self.invalid("expected '/>'"));
        }
        self.pos += 2;

        Ok(Element::Annotation(AnnotationPattern {
            layer: normalize_layer_name(layer),
            feature,
            value,
        }))
    }

    /// Layer or feature name
    fn parse_name(&mut self, structural_start: usize) -> Result<&'a str, QueryParseError> {
        let start = self.pos;
        while let Some(ch) = self.peek_char() {
            if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                self.advance();
            } else if ch.is_whitespace() || matches!(ch, '.' | '=' | '/') {
                break;
            } else {
                return Err(QueryParseError::UnexpectedChar { pos: self.pos, ch });
            }
        }
        if self.is_eof() {
            return Err(QueryParseError::UnterminatedStructural {
                pos: structural_start,
            });
        }
        Ok(&self.input[start..self.pos])
    }

    fn parse_value(&mut self, structural_start: usize) -> Result<String, QueryParseError> {
        if !self.consume_char('"') {
            return Err(self.invalid("expected quoted feature value"));
        }

        let mut value = String::new();
        loop {
            match self.peek_char() {
                None => {
                    return Err(QueryParseError::UnterminatedStructural {
                        pos: structural_start,
                    })
                }
                Some('"') => {
                    self.advance();
                    return Ok(value);
                }
                Some('\\') => {
                    self.advance();
                    if let Some(ch) = self.peek_char() {
                        value.push(ch);
                        self.advance();
                    }
                }
                Some(ch) => {
                    value.push(ch);
                    self.advance();
                }
            }
        }
    }

    fn invalid(&self, reason: &str) -> QueryParseError {
        QueryParseError::InvalidStructural {
            pos: self.pos,
            reason: reason.to_string(),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek_char().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn consume_char(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn advance(&mut self) {
        if let Some(ch) = self.peek_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn remaining(&self) -> &str {
        &self.input[self.pos..]
    }
}

fn tokens_of(text: &str) -> Vec<Element> {
    split_tokens(text)
        .into_iter()
        .map(|t| Element::Token(t.to_string()))
        .collect()
}
