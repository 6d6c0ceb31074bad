//! The line-framed text protocol: request parsing and response encoding.
//!
//! Requests are single ASCII lines terminated by LF or CR-LF; responses are
//! single lines prefixed `+` (success) or `-` (failure), always terminated by
//! CR-LF.

pub mod codec;
mod message;

pub use message::{Request, Response, Status};
