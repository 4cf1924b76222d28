//! HTTP request head, parser and body decoding.
use std::fmt;

pub use header::*;

pub mod chunked;
pub mod header;
pub mod parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request line and headers of one HTTP request. The body stays on the
/// connection.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: String,
    /// Raw request target as sent (origin-form, absolute-form or `*`).
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body.
    Empty,
    Length(u64),
    Chunked,
}

impl RequestHead {
    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.is("transfer-encoding", "chunked")
    }

    pub fn expects_continue(&self) -> bool {
        self.headers.is("expect", "100-continue")
    }

    /// Body framing; `None` if `Content-Length` is not a valid number.
    pub fn framing(&self) -> Option<BodyFraming> {
        if self.is_chunked() {
            return Some(BodyFraming::Chunked);
        }
        match self.headers.get("content-length") {
            Some(length) => length.trim().parse().ok().map(BodyFraming::Length),
            None => Some(BodyFraming::Empty),
        }
    }

    /// Whether the client allows the connection to stay open after the
    /// response to this request.
    pub fn keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn head(version: Version, headers: &[(&str, &str)]) -> RequestHead {
        let mut h = Headers::new();
        for (name, value) in headers {
            h.push(Header::new(name), value.to_string());
        }
        RequestHead {
            method: "POST".to_string(),
            target: "/".to_string(),
            version,
            headers: h,
        }
    }

    #[test]
    fn test_framing() {
        assert_eq!(head(Version::Http11, &[]).framing(), Some(BodyFraming::Empty));
        assert_eq!(
            head(Version::Http11, &[("Content-Length", "12")]).framing(),
            Some(BodyFraming::Length(12))
        );
        assert_eq!(
            head(Version::Http11, &[("Content-Length", "5"), ("Transfer-Encoding", "Chunked")])
                .framing(),
            Some(BodyFraming::Chunked)
        );
        assert_eq!(head(Version::Http11, &[("Content-Length", "x")]).framing(), None);
    }

    #[test]
    fn test_keep_alive() {
        assert!(head(Version::Http11, &[]).keep_alive());
        assert!(!head(Version::Http11, &[("Connection", "close")]).keep_alive());
        assert!(!head(Version::Http10, &[]).keep_alive());
        assert!(head(Version::Http10, &[("Connection", "Keep-Alive")]).keep_alive());
    }
}
