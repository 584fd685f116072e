//! OData filter expressions for table queries.
//!
//! [`Filter`] builds expressions that are safe to send to the service
//! (string literals are quoted and escaped), and parses and evaluates the
//! same grammar for backends that run queries in-process.

use chrono::{DateTime, SecondsFormat, Utc};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use azkeep_common::{EdmValue, Entity};

/// Filter parse failure.
#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("unexpected end of filter expression")]
    UnexpectedEnd,
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid literal '{0}'")]
    InvalidLiteral(String),
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn keyword(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
        }
    }

    fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "gt" => Some(CompareOp::Gt),
            "ge" => Some(CompareOp::Ge),
            "lt" => Some(CompareOp::Lt),
            "le" => Some(CompareOp::Le),
            _ => None,
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
        }
    }
}

/// A filter expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        property: String,
        op: CompareOp,
        value: EdmValue,
    },
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// A single comparison.
    ///
    /// Non-finite doubles (NaN, infinities) have no literal form: they never
    /// match, and the rendered expression does not parse back.
    pub fn compare(property: impl Into<String>, op: CompareOp, value: impl Into<EdmValue>) -> Self {
        Filter::Compare {
            property: property.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(property: impl Into<String>, value: impl Into<EdmValue>) -> Self {
        Self::compare(property, CompareOp::Eq, value)
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Parse an expression.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let filter = parser.parse_or()?;
        match parser.next() {
            None => Ok(filter),
            Some(token) => Err(FilterError::UnexpectedToken(token.to_string())),
        }
    }

    /// Evaluate against an entity.
    ///
    /// A comparison against a property the entity lacks, or one holding a
    /// value of an incomparable type, is false.
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Filter::Compare {
                property,
                op,
                value,
            } => entity
                .property(property)
                .and_then(|actual| compare_values(&actual, value))
                .map(|ordering| op.holds(ordering))
                .unwrap_or(false),
            Filter::And(a, b) => a.matches(entity) && b.matches(entity),
            Filter::Or(a, b) => a.matches(entity) || b.matches(entity),
            Filter::Not(inner) => !inner.matches(entity),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Compare {
                property,
                op,
                value,
            } => write!(f, "{} {} {}", property, op.keyword(), Literal(value)),
            Filter::And(a, b) => write!(f, "({}) and ({})", a, b),
            Filter::Or(a, b) => write!(f, "({}) or ({})", a, b),
            Filter::Not(inner) => write!(f, "not ({})", inner),
        }
    }
}

/// Literal rendering of a value in filter syntax.
struct Literal<'a>(&'a EdmValue);

impl fmt::Display for Literal<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            EdmValue::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            EdmValue::Int32(n) => write!(f, "{}", n),
            EdmValue::Int64(n) => write!(f, "{}L", n),
            EdmValue::Double(d) => write!(f, "{:?}", d),
            EdmValue::Boolean(b) => write!(f, "{}", b),
            EdmValue::DateTime(dt) => write!(
                f,
                "datetime'{}'",
                dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
            ),
            EdmValue::Guid(id) => write!(f, "guid'{}'", id),
            EdmValue::Binary(bytes) => {
                write!(f, "X'")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "'")
            }
        }
    }
}

fn compare_values(actual: &EdmValue, expected: &EdmValue) -> Option<Ordering> {
    use EdmValue::*;

    match (actual, expected) {
        (String(a), String(b)) => Some(a.cmp(b)),
        (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
        (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
        (Guid(a), Guid(b)) => Some(a.cmp(b)),
        (Binary(a), Binary(b)) => Some(a.cmp(b)),
        (Int32(a), Int32(b)) => Some(a.cmp(b)),
        (Int32(a), Int64(b)) => Some(i64::from(*a).cmp(b)),
        (Int64(a), Int32(b)) => Some(a.cmp(&i64::from(*b))),
        (Int64(a), Int64(b)) => Some(a.cmp(b)),
        (Double(a), _) => as_f64(expected).and_then(|b| a.partial_cmp(&b)),
        (_, Double(b)) => as_f64(actual).and_then(|a| a.partial_cmp(b)),
        _ => None,
    }
}

fn as_f64(value: &EdmValue) -> Option<f64> {
    match value {
        EdmValue::Int32(n) => Some(f64::from(*n)),
        EdmValue::Int64(n) => Some(*n as f64),
        EdmValue::Double(d) => Some(*d),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    Word(String),
    Value(EdmValue),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Word(w) => write!(f, "{}", w),
            Token::Value(v) => write!(f, "{}", Literal(v)),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
        } else if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
        } else if c == '\'' {
            let (text, next) = read_quoted(&chars, i)?;
            tokens.push(Token::Value(EdmValue::String(text)));
            i = next;
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || matches!(chars[i], '.' | '+' | '-')) {
                // A sign only continues a number directly after an exponent marker.
                if matches!(chars[i], '+' | '-') && !matches!(chars[i - 1], 'e' | 'E') {
                    break;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Value(parse_number(&text)?));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();

            if chars.get(i) == Some(&'\'') {
                let (text, next) = read_quoted(&chars, i)?;
                tokens.push(Token::Value(parse_typed(&word, &text)?));
                i = next;
            } else {
                match word.as_str() {
                    "true" => tokens.push(Token::Value(EdmValue::Boolean(true))),
                    "false" => tokens.push(Token::Value(EdmValue::Boolean(false))),
                    _ => tokens.push(Token::Word(word)),
                }
            }
        } else {
            return Err(FilterError::UnexpectedToken(c.to_string()));
        }
    }

    Ok(tokens)
}

/// Read a `'...'` literal starting at `start`; `''` is an escaped quote.
fn read_quoted(chars: &[char], start: usize) -> Result<(String, usize), FilterError> {
    let mut text = String::new();
    let mut i = start + 1;

    loop {
        match chars.get(i) {
            None => return Err(FilterError::UnterminatedString),
            Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                text.push('\'');
                i += 2;
            }
            Some('\'') => return Ok((text, i + 1)),
            Some(c) => {
                text.push(*c);
                i += 1;
            }
        }
    }
}

fn parse_number(text: &str) -> Result<EdmValue, FilterError> {
    let invalid = || FilterError::InvalidLiteral(text.to_string());

    if let Some(digits) = text.strip_suffix('L') {
        return digits.parse().map(EdmValue::Int64).map_err(|_| invalid());
    }
    if text.contains(['.', 'e', 'E']) {
        return text.parse().map(EdmValue::Double).map_err(|_| invalid());
    }
    match text.parse::<i32>() {
        Ok(n) => Ok(EdmValue::Int32(n)),
        Err(_) => text.parse().map(EdmValue::Int64).map_err(|_| invalid()),
    }
}

fn parse_typed(prefix: &str, text: &str) -> Result<EdmValue, FilterError> {
    let invalid = || FilterError::InvalidLiteral(format!("{}'{}'", prefix, text));

    match prefix {
        "datetime" => DateTime::parse_from_rfc3339(text)
            .map(|dt| EdmValue::DateTime(dt.with_timezone(&Utc)))
            .map_err(|_| invalid()),
        "guid" => Uuid::parse_str(text).map(EdmValue::Guid).map_err(|_| invalid()),
        "X" | "binary" => {
            if text.len() % 2 != 0 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            text.as_bytes()
                .chunks(2)
                .map(|pair| {
                    std::str::from_utf8(pair)
                        .ok()
                        .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                        .ok_or_else(invalid)
                })
                .collect::<Result<Vec<u8>, _>>()
                .map(EdmValue::Binary)
        }
        _ => Err(invalid()),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == word)
    }

    fn parse_or(&mut self) -> Result<Filter, FilterError> {
        let mut left = self.parse_and()?;
        while self.peek_word("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = left.or(right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Filter, FilterError> {
        let mut left = self.parse_unary()?;
        while self.peek_word("and") {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = left.and(right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Filter, FilterError> {
        if self.peek_word("not") {
            self.pos += 1;
            return Ok(self.parse_unary()?.negate());
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Filter, FilterError> {
        match self.next().ok_or(FilterError::UnexpectedEnd)? {
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(other) => Err(FilterError::UnexpectedToken(other.to_string())),
                    None => Err(FilterError::UnexpectedEnd),
                }
            }
            Token::Word(property) => {
                let op = match self.next().ok_or(FilterError::UnexpectedEnd)? {
                    Token::Word(w) => CompareOp::from_keyword(&w)
                        .ok_or(FilterError::UnexpectedToken(w))?,
                    other => return Err(FilterError::UnexpectedToken(other.to_string())),
                };
                match self.next().ok_or(FilterError::UnexpectedEnd)? {
                    Token::Value(value) => Ok(Filter::Compare {
                        property,
                        op,
                        value,
                    }),
                    other => Err(FilterError::UnexpectedToken(other.to_string())),
                }
            }
            other => Err(FilterError::UnexpectedToken(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn build(pk: &str, rk: &str) -> Entity {
        Entity::new(pk, rk)
            .with("Score", 80)
            .unwrap()
            .with("Size", 5_000_000_000i64)
            .unwrap()
            .with("Ratio", 0.25)
            .unwrap()
            .with("Passed", true)
            .unwrap()
            .with("Finished", Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
            .unwrap()
    }

    #[test]
    fn test_parse_key_lookup() {
        let filter = Filter::parse("PartitionKey eq 'site' and RowKey eq '1'").unwrap();
        assert!(filter.matches(&build("site", "1")));
        assert!(!filter.matches(&build("site", "2")));
    }

    #[test]
    fn test_precedence_and_binds_tighter_than_or() {
        let filter = Filter::parse("RowKey eq 'x' or RowKey eq '1' and Score gt 90").unwrap();
        assert!(!filter.matches(&build("p", "1")));
        assert!(filter.matches(&build("p", "x")));
    }

    #[test]
    fn test_parentheses_and_not() {
        let filter = Filter::parse("not (Score lt 50 or Passed eq false)").unwrap();
        assert!(filter.matches(&build("p", "1")));
    }

    #[test]
    fn test_numeric_literals() {
        let entity = build("p", "1");
        assert!(Filter::parse("Size ge 5000000000L").unwrap().matches(&entity));
        assert!(Filter::parse("Ratio lt 0.5").unwrap().matches(&entity));
        assert!(Filter::parse("Score eq 80.0").unwrap().matches(&entity));
        assert!(Filter::parse("Score gt -1").unwrap().matches(&entity));
    }

    #[test]
    fn test_datetime_literal() {
        let filter = Filter::parse("Finished gt datetime'2024-01-01T00:00:00Z'").unwrap();
        assert!(filter.matches(&build("p", "1")));
    }

    #[test]
    fn test_missing_property_and_type_mismatch_are_false() {
        let entity = build("p", "1");
        assert!(!Filter::parse("Owner eq 'me'").unwrap().matches(&entity));
        assert!(!Filter::parse("Score eq '80'").unwrap().matches(&entity));
        assert!(!Filter::parse("Score ne '80'").unwrap().matches(&entity));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Filter::parse("RowKey eq"), Err(FilterError::UnexpectedEnd));
        assert_eq!(Filter::parse("RowKey eq 'open"), Err(FilterError::UnterminatedString));
        assert!(matches!(
            Filter::parse("RowKey like 'a'"),
            Err(FilterError::UnexpectedToken(_))
        ));
        assert!(matches!(
            Filter::parse("(RowKey eq 'a'"),
            Err(FilterError::UnexpectedEnd)
        ));
        assert!(matches!(
            Filter::parse("RowKey eq 'a' 'b'"),
            Err(FilterError::UnexpectedToken(_))
        ));
    }

    #[test]
    fn test_display_renders_typed_literals() {
        let id = Uuid::nil();
        let filter = Filter::eq("Big", 7i64)
            .and(Filter::eq("Id", id))
            .or(Filter::eq("Blob", vec![0xab, 0x01]).negate());

        assert_eq!(
            filter.to_string(),
            "((Big eq 7L) and (Id eq guid'00000000-0000-0000-0000-000000000000')) or (not (Blob eq X'ab01'))"
        );
        assert_eq!(Filter::parse(&filter.to_string()).unwrap(), filter);
    }

    #[test]
    fn test_binary_literal_rejects_non_hex() {
        let entity = Entity::new("p", "1").with("Blob", vec![0xa0u8]).unwrap();
        assert!(Filter::parse("Blob eq X'a0'").unwrap().matches(&entity));

        assert_eq!(
            Filter::parse("Blob eq X'a\u{e9}0'"),
            Err(FilterError::InvalidLiteral("X'a\u{e9}0'".to_string()))
        );
        assert!(matches!(
            Filter::parse("Blob eq binary'zz'"),
            Err(FilterError::InvalidLiteral(_))
        ));
    }

    #[test]
    fn test_non_finite_double_never_matches() {
        let entity = Entity::new("p", "1").with("Ratio", f64::NAN).unwrap();
        let filter = Filter::eq("Ratio", f64::NAN);

        assert!(!filter.matches(&entity));
        assert!(Filter::parse(&filter.to_string()).is_err());
        assert!(Filter::parse(&Filter::eq("Ratio", f64::INFINITY).to_string()).is_err());
    }

    proptest! {
        #[test]
        fn quoted_keys_select_exactly_their_entity(pk in "\\PC*", other in "\\PC*") {
            let filter = Filter::parse(&Filter::eq("PartitionKey", pk.as_str()).to_string()).unwrap();
            prop_assert!(filter.matches(&Entity::new(pk.clone(), "r")));
            prop_assert_eq!(filter.matches(&Entity::new(other.clone(), "r")), other == pk);
        }
    }
}
