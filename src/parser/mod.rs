use std::error::Error;
use std::fmt;
use crate::config::ParseMode;

/// Number of integers a command must carry
pub const INT_ARRAY_SIZE: usize = 7;

/// Default token separator
pub const DEFAULT_DELIMITER: u8 = b',';

/// Values collected from one command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerList {
    values: [i32; INT_ARRAY_SIZE],
    count: usize,
}

impl IntegerList {
    /// Values actually collected
    pub fn as_slice(&self) -> &[i32] {
        &self.values[..self.count]
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// The full vector, only when exactly `INT_ARRAY_SIZE` values were parsed
    pub fn complete(&self) -> Option<&[i32; INT_ARRAY_SIZE]> {
        if self.count == INT_ARRAY_SIZE {
            Some(&self.values)
        } else {
            None
        }
    }
}

/// Raised in strict mode only
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A token is not a decimal i32. `position` is 1-based.
    InvalidToken { position: usize, token: String },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::InvalidToken { position, token } => {
                write!(f, "Invalid number '{}' at position {}", token, position)
            }
        }
    }
}

impl Error for ParseError {}

/// Splits a delimited line into at most `INT_ARRAY_SIZE` integers.
#[derive(Debug, Clone, Copy)]
pub struct IntegerListParser {
    delimiter: u8,
    mode: ParseMode,
}

impl IntegerListParser {
    pub fn new(delimiter: u8, mode: ParseMode) -> Self {
        Self { delimiter, mode }
    }

    /// Empty tokens are skipped, not counted. Tokens after the seventh value
    /// are ignored.
    pub fn parse(&self, line: &[u8]) -> Result<IntegerList, ParseError> {
        let mut list = IntegerList {
            values: [0; INT_ARRAY_SIZE],
            count: 0,
        };

        let tokens = line
            .split(|&b| b == self.delimiter)
            .filter(|token| !token.is_empty());

        for token in tokens {
            let value = match self.mode {
                ParseMode::Permissive => atoi(token),
                ParseMode::Strict => strict_int(token).ok_or_else(|| ParseError::InvalidToken {
                    position: list.count + 1,
                    token: String::from_utf8_lossy(token).into_owned(),
                })?,
            };
            list.values[list.count] = value;
            list.count += 1;
            if list.count >= INT_ARRAY_SIZE {
                break;
            }
        }

        Ok(list)
    }
}

impl Default for IntegerListParser {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER, ParseMode::Permissive)
    }
}

/// C `atoi` semantics: leading whitespace, optional sign, digits up to the
/// first non-digit. No digits gives 0; out-of-range saturates.
pub fn atoi(token: &[u8]) -> i32 {
    let mut bytes = token
        .iter()
        .copied()
        .skip_while(|b| matches!(*b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c))
        .peekable();

    let negative = match bytes.peek() {
        Some(b'-') => {
            bytes.next();
            true
        }
        Some(b'+') => {
            bytes.next();
            false
        }
        _ => false,
    };

    let mut magnitude: i64 = 0;
    for b in bytes.take_while(u8::is_ascii_digit) {
        magnitude = magnitude * 10 + i64::from(b - b'0');
        // Past this point the result is pinned to a bound anyway
        if magnitude > i64::from(i32::MAX) + 1 {
            break;
        }
    }

    let signed = if negative { -magnitude } else { magnitude };
    signed.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

fn strict_int(token: &[u8]) -> Option<i32> {
    let text = std::str::from_utf8(token).ok()?;
    text.trim_matches(|c: char| c.is_ascii_whitespace()).parse::<i32>().ok()
}
