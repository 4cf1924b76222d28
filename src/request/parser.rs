use std::io;

use thiserror::Error;

use crate::io::LineRead;
use crate::request::{Header, Headers, RequestHead, Version};

/// Longest request line or header line accepted, terminator excluded.
pub const MAX_LINE: usize = 65536;
/// Most header lines accepted in one request.
pub const MAX_HEADERS: usize = 100;

const WHITESPACE: [u8; 2] = *b" \t";
const TOKEN_SYMBOLS: [u8; 15] = *b"!#$%&'*+-.^_`|~";

fn one_of(chars: &'static [u8]) -> impl Fn(u8) -> bool {
    move |c: u8| chars.contains(&c)
}

fn whitespace() -> impl Fn(u8) -> bool {
    one_of(&WHITESPACE[..])
}

fn token() -> impl Fn(u8) -> bool {
    |c: u8| c.is_ascii_alphanumeric() || TOKEN_SYMBOLS.contains(&c)
}

fn visible() -> impl Fn(u8) -> bool {
    |c: u8| (0x21..=0x7e).contains(&c)
}

/// An HTTP/1.x request head parser. Reads the request line and headers one
/// line at a time and leaves the body unread in the stream.
pub struct RequestParser<R> {
    stream: R,
    line: Vec<u8>,
    line_position: usize,
    /// Stream offset of the start of `line`.
    stream_position: usize,
    /// Raw length of `line`, terminator included.
    line_len: usize,
}

impl<R: LineRead> RequestParser<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            line: Vec::with_capacity(256),
            line_position: 0,
            stream_position: 0,
            line_len: 0,
        }
    }

    pub fn into_inner(self) -> R {
        self.stream
    }

    fn error(&self, reason: &str) -> RequestParserError {
        RequestParserError::Syntax {
            position: self.stream_position + self.line_position,
            reason: reason.to_string(),
        }
    }

    /// Read the next line without its terminator. Returns false at a clean
    /// end of stream.
    fn read_line(&mut self) -> Result<bool> {
        self.stream_position += self.line_len;
        self.line.clear();
        self.line_position = 0;
        let n = self
            .stream
            .read_line_limited(&mut self.line, MAX_LINE as u64 + 2)?;
        self.line_len = n;
        if n == 0 {
            return Ok(false);
        }
        if self.line.last() != Some(&b'\n') {
            self.line_position = self.line.len();
            return if n > MAX_LINE {
                Err(self.error("line too long"))
            } else {
                Err(self.error("unexpected end of input"))
            };
        }
        self.line.pop();
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }
        Ok(true)
    }

    fn peek(&self) -> Option<u8> {
        self.line.get(self.line_position).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let curr = self.peek();
        if curr.is_some() {
            self.line_position += 1;
        }
        curr
    }

    fn expect(&mut self, b: u8) -> Result<()> {
        if self.peek() == Some(b) {
            self.next();
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", b as char)))
        }
    }

    fn expects(&mut self, bs: &[u8]) -> Result<()> {
        for b in bs {
            self.expect(*b)?;
        }
        Ok(())
    }

    fn one<F>(&mut self, predicate: &F) -> Result<u8>
    where
        F: Fn(u8) -> bool,
    {
        match self.peek() {
            Some(peek) if predicate(peek) => {
                self.next();
                Ok(peek)
            }
            _ => Err(self.error("unexpected character")),
        }
    }

    fn star<F>(&mut self, predicate: &F) -> &[u8]
    where
        F: Fn(u8) -> bool,
    {
        let start = self.line_position;
        while let Some(peek) = self.peek() {
            if !predicate(peek) {
                break;
            }
            self.line_position += 1;
        }
        &self.line[start..self.line_position]
    }

    fn plus<F>(&mut self, predicate: &F) -> Result<String>
    where
        F: Fn(u8) -> bool,
    {
        let start = self.line_position;
        self.one(predicate)?;
        self.star(predicate);
        Ok(String::from_utf8_lossy(&self.line[start..self.line_position]).into_owned())
    }

    fn rest(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.line[self.line_position..]).into_owned();
        self.line_position = self.line.len();
        rest
    }

    fn end(&self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(_) => Err(self.error("unexpected character")),
        }
    }

    fn version(&mut self) -> Result<Version> {
        self.expects(b"HTTP/1.")?;
        match self.one(&one_of(&b"01"[..]))? {
            b'0' => Ok(Version::Http10),
            _ => Ok(Version::Http11),
        }
    }

    fn request_line(&mut self) -> Result<(String, String, Version)> {
        let method = self.plus(&token())?;
        self.plus(&whitespace())?;
        let target = self.plus(&visible())?;
        self.plus(&whitespace())?;
        let version = self.version()?;
        self.end()?;
        Ok((method, target, version))
    }

    fn header(&mut self) -> Result<(Header, String)> {
        let name = self.plus(&token())?;
        self.expect(b':')?;
        self.star(&whitespace());
        let value = self.rest();
        Ok((Header::from(name), value.trim_end().to_string()))
    }

    fn headers(&mut self) -> Result<Headers> {
        let mut headers = Headers::new();
        loop {
            if !self.read_line()? {
                return Err(self.error("unexpected end of input"));
            }
            if self.line.is_empty() {
                return Ok(headers);
            }
            if whitespace()(self.line[0]) {
                // Obsolete line folding continues the previous value.
                let continuation = self.rest();
                match headers.last_mut() {
                    Some(value) => {
                        value.push(' ');
                        value.push_str(continuation.trim());
                        continue;
                    }
                    None => return Err(self.error("unexpected continuation line")),
                }
            }
            if headers.len() == MAX_HEADERS {
                return Err(self.error("too many headers"));
            }
            let (name, value) = self.header()?;
            headers.push(name, value);
        }
    }

    /// Parse the next request head in the stream. Returns `None` when the
    /// peer closed the stream before sending anything.
    pub fn parse(&mut self) -> Result<Option<RequestHead>> {
        if !self.read_line()? {
            return Ok(None);
        }
        let (method, target, version) = self.request_line()?;
        let headers = self.headers()?;
        Ok(Some(RequestHead {
            method,
            target,
            version,
            headers,
        }))
    }
}

#[derive(Debug, Error)]
pub enum RequestParserError {
    #[error("error parsing request at position {position}: {reason}")]
    Syntax { position: usize, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RequestParserError>;

#[cfg(test)]
mod test {
    use super::*;

    fn make_request(
        method: &str,
        target: &str,
        version: Version,
        headers: &[(&str, &str)],
    ) -> RequestHead {
        let mut h = Headers::new();
        for (name, value) in headers {
            h.push(Header::new(name), value.to_string());
        }
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            version,
            headers: h,
        }
    }

    fn test_parser(bytes: &[u8], expected: &RequestHead) {
        let mut parser = RequestParser::new(bytes);
        let actual = parser.parse().unwrap().unwrap();
        assert_eq!(&actual, expected);
    }

    fn test_parser_error(bytes: &[u8], expected: &str) {
        let mut parser = RequestParser::new(bytes);
        match parser.parse() {
            Ok(_) => panic!("should have errored"),
            Err(actual) => assert_eq!(actual.to_string(), expected),
        }
    }

    #[test]
    fn test_parser_get() {
        test_parser(
            b"GET /path%20x?p1=v1&p2=v2#fragment HTTP/1.1\r\nHost: localhost\r\n\r\n",
            &make_request(
                "GET",
                "/path%20x?p1=v1&p2=v2#fragment",
                Version::Http11,
                &[("host", "localhost")],
            ),
        )
    }

    #[test]
    fn test_parser_leaves_body() {
        let bytes = b"POST / HTTP/1.0\r\nContent-Length: 3\r\n\r\nfoo";
        let mut parser = RequestParser::new(&bytes[..]);
        let head = parser.parse().unwrap().unwrap();
        assert_eq!(head.version, Version::Http10);
        assert_eq!(head.headers.get("content-length"), Some("3"));
        assert_eq!(parser.into_inner(), b"foo");
    }

    #[test]
    fn test_parser_bare_lf_and_folding() {
        test_parser(
            b"OPTIONS * HTTP/1.1\nX-Long: one\n  two\nX-Empty:\n\n",
            &make_request(
                "OPTIONS",
                "*",
                Version::Http11,
                &[("x-long", "one two"), ("x-empty", "")],
            ),
        )
    }

    #[test]
    fn test_parser_eof() {
        let mut parser = RequestParser::new(&b""[..]);
        assert!(parser.parse().unwrap().is_none());
    }

    #[test]
    fn test_parser_nonsense() {
        test_parser_error(
            b"FOO\r\n\r\n",
            "error parsing request at position 3: unexpected character",
        );
    }

    #[test]
    fn test_parser_bad_version() {
        test_parser_error(
            b"GET / HTTP/2.0\r\n\r\n",
            "error parsing request at position 11: expected '1'",
        );
    }

    #[test]
    fn test_parser_truncated_headers() {
        test_parser_error(
            b"GET / HTTP/1.1\r\nHost: localhost\r\n",
            "error parsing request at position 33: unexpected end of input",
        );
    }

    #[test]
    fn test_parser_bad_header() {
        test_parser_error(
            b"GET / HTTP/1.1\r\nHost localhost\r\n\r\n",
            "error parsing request at position 20: expected ':'",
        );
    }
}
