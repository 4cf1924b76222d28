//! Response start and body writing.
//!
//! Applications call [`StartResponse::start`] once with a status line and
//! headers. Nothing is sent until the first body write, at which point the
//! status line and headers go out, completed with the headers the server
//! adds itself.
//!
//! # Example
//! ```
//! use std::io::Write;
//! use devserve::request::Version;
//! use devserve::response::StartResponse;
//!
//! let mut out = vec![];
//! {
//!     let mut response = StartResponse::new(&mut out, Version::Http11, false);
//!     let mut body = response
//!         .start("200 OK", vec![("Content-Length".into(), "6".into())])
//!         .unwrap();
//!     body.write_all(b"Hello!").unwrap();
//!     assert_eq!(response.status_code(), Some(200));
//!     assert!(!response.close_connection());
//! }
//! let text = String::from_utf8(out).unwrap();
//! assert!(text.starts_with("HTTP/1.1 200 OK\r\nContent-Length: 6\r\nServer: devserve/"));
//! assert!(text.ends_with("\r\n\r\nHello!"));
//! ```
use std::collections::HashSet;
use std::io;
use std::io::prelude::*;
use std::time::SystemTime;

use log::trace;
use thiserror::Error;

use crate::environ::ServerInfo;
use crate::handler::AppError;
use crate::request::Version;

pub type HeaderList = Vec<(String, String)>;

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("write before start_response")]
    NotStarted,
    #[error("headers already set")]
    HeadersAlreadySet,
    #[error("invalid status line {0:?}")]
    InvalidStatus(String),
}

impl From<ResponseError> for io::Error {
    fn from(err: ResponseError) -> Self {
        io::Error::new(io::ErrorKind::Other, err)
    }
}

/// A parsed status line such as `200 OK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub reason: String,
}

impl Status {
    pub fn parse(status: &str) -> Result<Self, ResponseError> {
        let status = status.trim();
        let (code, reason) = status.split_once(' ').unwrap_or((status, ""));
        match code.parse::<u16>() {
            Ok(code) if (100..1000).contains(&code) => Ok(Self {
                code,
                reason: reason.trim().to_string(),
            }),
            _ => Err(ResponseError::InvalidStatus(status.to_string())),
        }
    }
}

/// The response-start callback of one request.
///
/// Holds the headers set by the application until the first body write
/// sends them.
pub struct StartResponse<'w> {
    out: &'w mut dyn Write,
    protocol: Version,
    is_head: bool,
    headers_set: Option<(Status, HeaderList)>,
    sent_status: Option<u16>,
    close_connection: bool,
    bytes_written: u64,
}

impl<'w> StartResponse<'w> {
    /// `protocol` is the version written in the status line; `is_head` tells
    /// whether the request method was `HEAD`.
    pub fn new(out: &'w mut dyn Write, protocol: Version, is_head: bool) -> Self {
        Self {
            out,
            protocol,
            is_head,
            headers_set: None,
            sent_status: None,
            close_connection: false,
            bytes_written: 0,
        }
    }

    /// Set the status line and headers and get a writer for the body.
    ///
    /// Calling this twice for the same request is an error; see
    /// [`start_with_error`](Self::start_with_error) for replacing headers
    /// while handling an error.
    pub fn start(
        &mut self,
        status: &str,
        headers: HeaderList,
    ) -> Result<BodyWriter<'_, 'w>, ResponseError> {
        if self.headers_set.is_some() {
            return Err(ResponseError::HeadersAlreadySet);
        }
        self.headers_set = Some((Status::parse(status)?, headers));
        Ok(BodyWriter { response: self })
    }

    /// Start the response on behalf of an error handler.
    ///
    /// If headers have already been sent the error cannot be reported in a
    /// fresh response and is handed back to be raised again. Otherwise any
    /// previously set headers are replaced.
    pub fn start_with_error(
        &mut self,
        status: &str,
        headers: HeaderList,
        error: AppError,
    ) -> Result<BodyWriter<'_, 'w>, AppError> {
        if self.headers_sent() {
            return Err(error);
        }
        self.headers_set = Some((Status::parse(status)?, headers));
        Ok(BodyWriter { response: self })
    }

    pub fn headers_sent(&self) -> bool {
        self.sent_status.is_some()
    }

    /// Status code sent to the client, if headers have gone out.
    pub fn status_code(&self) -> Option<u16> {
        self.sent_status
    }

    /// True if the response end can only be signalled by closing the
    /// connection.
    pub fn close_connection(&self) -> bool {
        self.close_connection
    }

    /// Body bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Forget headers set but not yet sent, so an error response can be
    /// started instead.
    pub(crate) fn rollback(&mut self) {
        if !self.headers_sent() {
            self.headers_set = None;
        }
    }

    /// Write a piece of the body, sending the headers first if needed. An
    /// empty write only sends the headers.
    pub(crate) fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.headers_sent() {
            self.send_headers()?;
        }
        self.out.write_all(data)?;
        self.out.flush()?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn send_headers(&mut self) -> io::Result<()> {
        let (status, headers) = self.headers_set.as_ref().ok_or(ResponseError::NotStarted)?;
        let mut head = format!("{} {} {}\r\n", self.protocol, status.code, status.reason);
        let mut header_keys = HashSet::new();
        for (key, value) in headers {
            head.push_str(&format!("{}: {}\r\n", key, value));
            header_keys.insert(key.to_ascii_lowercase());
        }
        let delimited = header_keys.contains("content-length")
            || self.is_head
            || status.code < 200
            || status.code == 204
            || status.code == 304;
        if !delimited {
            self.close_connection = true;
            head.push_str("Connection: close\r\n");
        }
        if !header_keys.contains("server") {
            head.push_str(&format!("Server: {}\r\n", ServerInfo::software()));
        }
        if !header_keys.contains("date") {
            head.push_str(&format!("Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now())));
        }
        head.push_str("\r\n");
        trace!("sending response head {:?}", head);
        self.out.write_all(head.as_bytes())?;
        self.sent_status = Some(status.code);
        Ok(())
    }
}

/// Writes body bytes of a started response.
pub struct BodyWriter<'r, 'w> {
    response: &'r mut StartResponse<'w>,
}

impl Write for BodyWriter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.response.write_body(buf)?;
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        self.response.out.flush()
    }
}
