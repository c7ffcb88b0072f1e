//! RESP Protocol Implementation
//!
//! The client half of the Redis Serialization Protocol (RESP2), used by
//! [`RespConnection`](crate::connection::RespConnection) to talk to a real
//! Redis-compatible server.
//!
//! ## Modules
//!
//! - `types`: The `RespValue` enum, command building and serialization
//! - `parser`: Incremental parser for server replies
//!
//! ## Example
//!
//! ```
//! use flashmq::protocol::{parse_message, RespValue};
//!
//! // Building a request
//! let request = RespValue::command(["ZADD", "fedify_queue", "0", "\"hello\""]);
//! assert!(request.serialize().starts_with(b"*4\r\n$4\r\nZADD\r\n"));
//!
//! // Parsing a reply
//! let (reply, consumed) = parse_message(b":1\r\n").unwrap().unwrap();
//! assert_eq!(reply, RespValue::Integer(1));
//! assert_eq!(consumed, 4);
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::RespValue;
