use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};

use tracing::debug;

use crate::error::{KvError, Result};
use crate::protocol::codec;
use crate::protocol::{Response, Status};

/// `KvClient` is the blocking counterpart of the server's wire protocol:
/// one request line out, one response line back.
pub struct KvClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    welcome: String,
}

impl KvClient {
    /// Connects to a server and consumes its welcome line.
    ///
    /// # Errors
    /// fails when the connection cannot be established or the server closes
    /// before greeting
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<KvClient> {
        let stream = TcpStream::connect(addr)?;
        let writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        let mut welcome = String::new();
        if reader.read_line(&mut welcome)? == 0 {
            return Err(KvError::Protocol(
                "server closed the connection before greeting".to_string(),
            ));
        }
        let welcome = welcome.trim_end().to_string();
        debug!(%welcome, "connected");

        Ok(KvClient {
            reader,
            writer,
            welcome,
        })
    }

    /// the greeting the server sent on connect
    pub fn welcome(&self) -> &str {
        &self.welcome
    }

    /// Sends one raw request line and reads one response line.
    ///
    /// # Errors
    /// fails on socket errors or when the server closes mid-exchange
    pub fn request(&mut self, line: &str) -> Result<Response> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;

        let mut reply = String::new();
        if self.reader.read_line(&mut reply)? == 0 {
            return Err(KvError::Protocol(
                "server closed the connection".to_string(),
            ));
        }
        Ok(codec::parse_response(&reply))
    }

    /// stores `value` under `key`; returns `true` when newly created
    pub fn put(&mut self, key: &str, value: &str) -> Result<bool> {
        let response = self.request(&format!("PUT {} {}", key, value))?;
        match response.status {
            Status::Ok => Ok(response.message == "CREATED"),
            _ => Err(KvError::Protocol(response.message)),
        }
    }

    /// fetches the value for `key`, or `None` when absent
    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        let response = self.request(&format!("GET {}", key))?;
        match response.status {
            Status::Ok => Ok(Some(response.message)),
            Status::NotFound => Ok(None),
            _ => Err(KvError::Protocol(response.message)),
        }
    }

    /// deletes `key`; returns whether it existed
    pub fn del(&mut self, key: &str) -> Result<bool> {
        let response = self.request(&format!("DEL {}", key))?;
        match response.status {
            Status::Ok => Ok(true),
            Status::NotFound => Ok(false),
            _ => Err(KvError::Protocol(response.message)),
        }
    }

    /// true if `key` is present on the server
    pub fn exists(&mut self, key: &str) -> Result<bool> {
        let response = self.request(&format!("EXISTS {}", key))?;
        match response.status {
            Status::Ok => Ok(response.message == "1"),
            _ => Err(KvError::Protocol(response.message)),
        }
    }

    /// number of entries on the server
    pub fn size(&mut self) -> Result<usize> {
        let response = self.request("SIZE")?;
        match response.status {
            Status::Ok => response
                .message
                .parse()
                .map_err(|_| KvError::Protocol(format!("bad SIZE reply: {}", response.message))),
            _ => Err(KvError::Protocol(response.message)),
        }
    }

    /// removes every entry on the server
    pub fn clear(&mut self) -> Result<()> {
        let response = self.request("CLEAR")?;
        match response.status {
            Status::Ok => Ok(()),
            _ => Err(KvError::Protocol(response.message)),
        }
    }

    /// round-trips a PING
    pub fn ping(&mut self) -> Result<()> {
        let response = self.request("PING")?;
        match response.status {
            Status::Pong => Ok(()),
            _ => Err(KvError::Protocol(response.message)),
        }
    }

    /// says goodbye; the server half-closes after replying
    pub fn quit(&mut self) -> Result<()> {
        let response = self.request("QUIT")?;
        match response.status {
            Status::Bye => Ok(()),
            _ => Err(KvError::Protocol(response.message)),
        }
    }
}
