//! Framing for the text protocol: request parsing out of a [`Buffer`] and
//! bit-exact response encoding.

use std::sync::Arc;

use crate::net::{Buffer, TcpConnection};
use crate::protocol::message::{Request, Response, Status};

/// Tries to parse one request line out of the buffer.
///
/// A request is one text line terminated by LF, optionally preceded by CR.
/// Returns `None` when no complete line is buffered yet; the caller waits
/// for more bytes. On success the line and its terminator(s) are consumed
/// from the buffer.
pub fn parse_request(buf: &mut Buffer) -> Option<Request> {
    let lf = buf.peek().iter().position(|&b| b == b'\n')?;
    let line_len = if lf > 0 && buf.peek()[lf - 1] == b'\r' {
        lf - 1
    } else {
        lf
    };
    let line = String::from_utf8_lossy(&buf.peek()[..line_len]).into_owned();
    buf.retrieve(lf + 1);

    Some(parse_line(&line))
}

/// Maps one terminator-free line to a request. The first whitespace-delimited
/// token is the command (case-insensitive); a PUT value is the remainder of
/// the raw line after the key with leading whitespace stripped, preserving
/// interior spacing exactly.
fn parse_line(line: &str) -> Request {
    let (command, rest) = split_token(line);
    if command.is_empty() {
        return Request::Unknown;
    }

    match command.to_ascii_uppercase().as_str() {
        "PUT" | "SET" => {
            let (key, rest) = split_token(rest);
            let value = rest.trim_start();
            if key.is_empty() || value.is_empty() {
                Request::Unknown
            } else {
                Request::Put {
                    key: key.to_string(),
                    value: value.to_string(),
                }
            }
        }
        "GET" => match single_key(rest) {
            Some(key) => Request::Get { key },
            None => Request::Unknown,
        },
        "DEL" | "DELETE" => match single_key(rest) {
            Some(key) => Request::Del { key },
            None => Request::Unknown,
        },
        "EXISTS" => match single_key(rest) {
            Some(key) => Request::Exists { key },
            None => Request::Unknown,
        },
        "SIZE" | "DBSIZE" => Request::Size,
        "CLEAR" | "FLUSHDB" => Request::Clear,
        "PING" => Request::Ping,
        "QUIT" | "EXIT" => Request::Quit,
        _ => Request::Unknown,
    }
}

/// splits the next whitespace-delimited token off the front of `s`,
/// returning `(token, remainder-after-token)`
fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    }
}

fn single_key(rest: &str) -> Option<String> {
    let (key, _) = split_token(rest);
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

/// Encodes a response to its wire form, always terminated by CR LF:
///
/// ```text
/// +OK             success, no payload
/// +OK <msg>       success, with payload
/// -NOT_FOUND      key absent
/// -ERROR <msg>    generic error
/// +PONG           ping reply
/// +BYE            quit reply
/// ```
pub fn encode_response(response: &Response) -> String {
    let mut out = String::new();
    match response.status {
        Status::Ok => {
            out.push_str("+OK");
            if !response.message.is_empty() {
                out.push(' ');
                out.push_str(&response.message);
            }
        }
        Status::NotFound => out.push_str("-NOT_FOUND"),
        Status::Error => {
            out.push_str("-ERROR");
            if !response.message.is_empty() {
                out.push(' ');
                out.push_str(&response.message);
            }
        }
        Status::Pong => out.push_str("+PONG"),
        Status::Bye => out.push_str("+BYE"),
    }
    out.push_str("\r\n");
    out
}

/// Parses a response line (with or without its terminator) back into a
/// [`Response`]; the client side of the protocol.
pub fn parse_response(line: &str) -> Response {
    let line = line.trim_end_matches(|c| c == '\r' || c == '\n');

    if let Some(rest) = line.strip_prefix("+OK") {
        return Response::ok(rest.strip_prefix(' ').unwrap_or(rest));
    }
    if line == "+PONG" {
        return Response::pong();
    }
    if line == "+BYE" {
        return Response::bye();
    }
    if line == "-NOT_FOUND" {
        return Response::not_found();
    }
    if let Some(rest) = line.strip_prefix("-ERROR") {
        return Response::error(rest.strip_prefix(' ').unwrap_or(rest));
    }
    Response::error(format!("unparseable response: {}", line))
}

/// encodes and sends a response on the given connection
pub fn send_response(conn: &Arc<TcpConnection>, response: &Response) {
    conn.send(encode_response(response).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(bytes: &[u8]) -> Buffer {
        let mut buf = Buffer::new();
        buf.append(bytes);
        buf
    }

    #[test]
    fn incomplete_line_waits_for_more_bytes() {
        let mut buf = buffer_with(b"GET na");
        assert_eq!(parse_request(&mut buf), None);
        assert_eq!(buf.readable_bytes(), 6);
    }

    #[test]
    fn lone_cr_is_not_a_terminator() {
        let mut buf = buffer_with(b"PING\r");
        assert_eq!(parse_request(&mut buf), None);
    }

    #[test]
    fn crlf_and_lf_framings_coexist() {
        let mut buf = buffer_with(b"PING\nPING\r\nSIZE\n");
        assert_eq!(parse_request(&mut buf), Some(Request::Ping));
        assert_eq!(parse_request(&mut buf), Some(Request::Ping));
        assert_eq!(parse_request(&mut buf), Some(Request::Size));
        assert_eq!(parse_request(&mut buf), None);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn commands_fold_case_and_accept_aliases() {
        for (line, expected) in vec![
            ("set k v", Request::Put { key: "k".into(), value: "v".into() }),
            ("put k v", Request::Put { key: "k".into(), value: "v".into() }),
            ("get k", Request::Get { key: "k".into() }),
            ("delete k", Request::Del { key: "k".into() }),
            ("DEL k", Request::Del { key: "k".into() }),
            ("exists k", Request::Exists { key: "k".into() }),
            ("dbsize", Request::Size),
            ("SIZE", Request::Size),
            ("flushdb", Request::Clear),
            ("CLEAR", Request::Clear),
            ("ping", Request::Ping),
            ("exit", Request::Quit),
            ("QUIT", Request::Quit),
            ("nonsense", Request::Unknown),
            ("", Request::Unknown),
        ] {
            let mut buf = buffer_with(format!("{}\r\n", line).as_bytes());
            assert_eq!(parse_request(&mut buf), Some(expected), "line: {:?}", line);
        }
    }

    #[test]
    fn put_preserves_interior_value_spacing() {
        let mut buf = buffer_with(b"PUT greeting Hello,   World!\r\n");
        assert_eq!(
            parse_request(&mut buf),
            Some(Request::Put {
                key: "greeting".into(),
                value: "Hello,   World!".into(),
            })
        );
    }

    #[test]
    fn put_key_that_is_a_substring_of_the_command() {
        // a key sharing letters with the verb must not confuse value extraction
        let mut buf = buffer_with(b"PUT T  spaced  value\n");
        assert_eq!(
            parse_request(&mut buf),
            Some(Request::Put {
                key: "T".into(),
                value: "spaced  value".into(),
            })
        );
    }

    #[test]
    fn missing_arity_becomes_unknown() {
        for line in &["PUT onlykey\r\n", "GET\r\n", "DEL\r\n", "EXISTS\r\n", "SET k\r\n"] {
            let mut buf = buffer_with(line.as_bytes());
            assert_eq!(parse_request(&mut buf), Some(Request::Unknown), "line: {:?}", line);
        }
    }

    #[test]
    fn extra_tokens_after_a_single_key_are_ignored() {
        let mut buf = buffer_with(b"GET name extra tokens\r\n");
        assert_eq!(parse_request(&mut buf), Some(Request::Get { key: "name".into() }));
    }

    #[test]
    fn response_encoding_is_bit_exact() {
        assert_eq!(encode_response(&Response::ok("")), "+OK\r\n");
        assert_eq!(encode_response(&Response::ok("CREATED")), "+OK CREATED\r\n");
        assert_eq!(encode_response(&Response::not_found()), "-NOT_FOUND\r\n");
        assert_eq!(
            encode_response(&Response::error("Unknown command")),
            "-ERROR Unknown command\r\n"
        );
        assert_eq!(encode_response(&Response::pong()), "+PONG\r\n");
        assert_eq!(encode_response(&Response::bye()), "+BYE\r\n");
    }

    #[test]
    fn encode_parse_encode_is_identity() {
        let responses = vec![
            Response::ok(""),
            Response::ok("some value with  spaces"),
            Response::not_found(),
            Response::error("Key cannot be empty"),
            Response::pong(),
            Response::bye(),
        ];
        for response in responses {
            let encoded = encode_response(&response);
            let reparsed = parse_response(&encoded);
            assert_eq!(encode_response(&reparsed), encoded);
        }
    }
}
