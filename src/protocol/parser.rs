//! Incremental RESP Reply Parser
//!
//! Replies arrive over a byte stream, so a read may end in the middle of a
//! value or carry several values at once. The parser reads from the front of
//! a buffer and returns either:
//!
//! - `Ok(Some((value, consumed)))` - a complete value using `consumed` bytes
//! - `Ok(None)` - the value is incomplete, read more and try again
//! - `Err(ParseError)` - the stream is corrupt and the connection is unusable
//!
//! The caller advances its buffer by `consumed` after every complete value.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use std::num::ParseIntError;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array nesting depth (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// An incremental RESP reply parser.
///
/// # Example
///
/// ```
/// use flashmq::protocol::{RespParser, RespValue};
///
/// let mut parser = RespParser::new();
/// let buffer = b"$5\r\nhello\r\n:1\r\n";
///
/// let (first, used) = parser.parse(buffer).unwrap().unwrap();
/// assert_eq!(first, RespValue::bulk_string("hello"));
///
/// let (second, _) = parser.parse(&buffer[used..]).unwrap().unwrap();
/// assert_eq!(second, RespValue::Integer(1));
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    /// Current nesting depth (for array parsing)
    depth: usize,
}

impl RespParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one RESP value from the front of the buffer.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match buf[0] {
            prefix::SIMPLE_STRING => {
                Ok(parse_line(buf)?.map(|(s, n)| (RespValue::SimpleString(s), n)))
            }
            prefix::ERROR => Ok(parse_line(buf)?.map(|(s, n)| (RespValue::Error(s), n))),
            prefix::INTEGER => Ok(parse_length(buf)?.map(|(i, n)| (RespValue::Integer(i), n))),
            prefix::BULK_STRING => self.parse_bulk_string(buf),
            prefix::ARRAY => self.parse_array(buf),
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// Parses a bulk string: `$<length>\r\n<data>\r\n`
    fn parse_bulk_string(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (length, header) = match parse_length(buf)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        if length == -1 {
            return Ok(Some((RespValue::Null, header)));
        }
        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }

        let length = length as usize;
        if length > MAX_BULK_SIZE {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: MAX_BULK_SIZE,
            });
        }

        let total_needed = header + length + 2;
        if buf.len() < total_needed {
            return Ok(None);
        }

        if &buf[header + length..total_needed] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[header..header + length]);
        Ok(Some((RespValue::BulkString(data), total_needed)))
    }

    /// Parses an array: `*<count>\r\n<elements...>`
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (count, header) = match parse_length(buf)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        if count == -1 {
            return Ok(Some((RespValue::Null, header)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        // Do not trust the declared count for the allocation.
        let mut elements = Vec::with_capacity((count as usize).min(1024));
        let mut consumed = header;

        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..]) {
                Ok(Some((value, used))) => {
                    elements.push(value);
                    consumed += used;
                }
                other => {
                    self.depth -= 1;
                    return other;
                }
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }
}

/// Reads the text between the prefix byte and the first CRLF.
fn parse_line(buf: &[u8]) -> ParseResult<Option<(String, usize)>> {
    match find_crlf(&buf[1..]) {
        Some(pos) => {
            let s = std::str::from_utf8(&buf[1..1 + pos])
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            // prefix + content + CRLF
            Ok(Some((s.to_string(), 1 + pos + 2)))
        }
        None => Ok(None),
    }
}

/// Reads the signed integer between the prefix byte and the first CRLF.
fn parse_length(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    match parse_line(buf)? {
        Some((s, consumed)) => {
            let n: i64 = s
                .parse()
                .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;
            Ok(Some((n, consumed)))
        }
        None => Ok(None),
    }
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Helper function to parse a single RESP message from bytes.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_reply() {
        let (value, consumed) = parse_message(b"+OK\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::ok());
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_parse_error_reply() {
        let input = b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n";
        let (value, consumed) = parse_message(input).unwrap().unwrap();
        assert!(value.is_error());
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_parse_integer_reply() {
        let (value, consumed) = parse_message(b":-42\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Integer(-42));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_parse_bulk_replies() {
        let (value, consumed) = parse_message(b"$5\r\nhello\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::bulk_string("hello"));
        assert_eq!(consumed, 11);

        let (value, consumed) = parse_message(b"$0\r\n\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::bulk_string(""));
        assert_eq!(consumed, 6);

        let (value, consumed) = parse_message(b"$-1\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Null);
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_binary_safe_bulk_string() {
        let (value, _) = parse_message(b"$5\r\nhel\x00o\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::bulk_string(&b"hel\x00o"[..]));
    }

    #[test]
    fn test_parse_pubsub_message() {
        let input = b"*3\r\n$7\r\nmessage\r\n$14\r\nfedify_channel\r\n$0\r\n\r\n";
        let (value, consumed) = parse_message(input).unwrap().unwrap();
        assert_eq!(consumed, input.len());
        assert_eq!(
            value,
            RespValue::Array(vec![
                RespValue::bulk_string("message"),
                RespValue::bulk_string("fedify_channel"),
                RespValue::bulk_string(""),
            ])
        );
    }

    #[test]
    fn test_parse_null_and_empty_arrays() {
        assert_eq!(parse_message(b"*-1\r\n").unwrap().unwrap().0, RespValue::Null);
        assert_eq!(
            parse_message(b"*0\r\n").unwrap().unwrap().0,
            RespValue::Array(vec![])
        );
    }

    #[test]
    fn test_incomplete_replies() {
        assert!(parse_message(b"").unwrap().is_none());
        assert!(parse_message(b"+OK").unwrap().is_none());
        assert!(parse_message(b"$5\r\nhel").unwrap().is_none());
        assert!(parse_message(b"*2\r\n$3\r\nfoo\r\n").unwrap().is_none());
        assert!(parse_message(b"*2\r\n$3\r\nfoo\r\n$3\r\nba").unwrap().is_none());
    }

    #[test]
    fn test_parser_reusable_after_incomplete_nested_array() {
        let mut parser = RespParser::new();
        assert!(parser.parse(b"*1\r\n*1\r\n*1\r\n").unwrap().is_none());

        let (value, _) = parser.parse(b"*1\r\n:1\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Array(vec![RespValue::Integer(1)]));
    }

    #[test]
    fn test_pipelined_replies() {
        let buffer = b"+OK\r\n:1\r\n$-1\r\n";
        let mut parser = RespParser::new();
        let mut offset = 0;
        let mut replies = Vec::new();
        while let Some((value, used)) = parser.parse(&buffer[offset..]).unwrap() {
            replies.push(value);
            offset += used;
        }
        assert_eq!(
            replies,
            vec![RespValue::ok(), RespValue::Integer(1), RespValue::Null]
        );
        assert_eq!(offset, buffer.len());
    }

    #[test]
    fn test_rejects_inline_and_unknown_prefix() {
        assert_eq!(
            parse_message(b"PING\r\n"),
            Err(ParseError::UnknownPrefix(b'P'))
        );
        assert_eq!(
            parse_message(b"@x\r\n"),
            Err(ParseError::UnknownPrefix(b'@'))
        );
    }

    #[test]
    fn test_invalid_lengths() {
        assert!(matches!(
            parse_message(b":not_a_number\r\n"),
            Err(ParseError::InvalidInteger(_))
        ));
        assert_eq!(
            parse_message(b"$-2\r\n"),
            Err(ParseError::InvalidBulkLength(-2))
        );
        assert_eq!(
            parse_message(b"*-3\r\n"),
            Err(ParseError::InvalidArrayLength(-3))
        );
        assert!(matches!(
            parse_message(b"$3\r\nabcXY"),
            Err(ParseError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_nesting_limit() {
        let mut input = Vec::new();
        for _ in 0..=MAX_NESTING_DEPTH + 1 {
            input.extend_from_slice(b"*1\r\n");
        }
        input.extend_from_slice(b":1\r\n");
        assert!(matches!(
            parse_message(&input),
            Err(ParseError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_request_reply_symmetry() {
        let request = RespValue::command(["ZRANGEBYSCORE", "fedify_queue", "0", "1700000000000"]);
        let (parsed, consumed) = parse_message(&request.serialize()).unwrap().unwrap();
        assert_eq!(parsed, request);
        assert_eq!(consumed, request.serialize().len());
    }
}
