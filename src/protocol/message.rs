/// These are the request commands a client can send over the wire.
///
/// A line that cannot be mapped to a command (unknown verb, missing key or
/// value) parses as `Unknown`; the server answers it with an error instead
/// of dropping the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `PUT key value` / `SET key value` — insert or update
    Put {
        /// the key to store under
        key: String,
        /// the value; the rest of the line with interior spacing preserved
        value: String,
    },
    /// `GET key`
    Get {
        /// the key to look up
        key: String,
    },
    /// `DEL key` / `DELETE key`
    Del {
        /// the key to remove
        key: String,
    },
    /// `EXISTS key`
    Exists {
        /// the key to probe
        key: String,
    },
    /// `SIZE` / `DBSIZE`
    Size,
    /// `CLEAR` / `FLUSHDB`
    Clear,
    /// `PING`
    Ping,
    /// `QUIT` / `EXIT`
    Quit,
    /// anything the codec could not map to a command
    Unknown,
}

/// status discriminant of a [`Response`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// success, message carries the payload if any
    Ok,
    /// the requested key is absent
    NotFound,
    /// a protocol or validation error, message carries the reason
    Error,
    /// reply to `PING`
    Pong,
    /// reply to `QUIT`
    Bye,
}

/// A response as sent back over the wire: a status plus an optional payload
/// or error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// outcome discriminant
    pub status: Status,
    /// payload for `Ok`, reason for `Error`, empty otherwise
    pub message: String,
}

impl Response {
    /// success with a payload (pass `""` for a bare `+OK`)
    pub fn ok(message: impl Into<String>) -> Response {
        Response {
            status: Status::Ok,
            message: message.into(),
        }
    }

    /// the key was not found
    pub fn not_found() -> Response {
        Response {
            status: Status::NotFound,
            message: String::new(),
        }
    }

    /// a generic error carrying a reason
    pub fn error(message: impl Into<String>) -> Response {
        Response {
            status: Status::Error,
            message: message.into(),
        }
    }

    /// reply to a ping
    pub fn pong() -> Response {
        Response {
            status: Status::Pong,
            message: String::new(),
        }
    }

    /// reply to a quit
    pub fn bye() -> Response {
        Response {
            status: Status::Bye,
            message: String::new(),
        }
    }
}
