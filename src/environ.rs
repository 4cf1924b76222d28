//! The per-request context handed to applications.
//!
//! An [`Environ`] holds the CGI-style variables of one request
//! (`REQUEST_METHOD`, `PATH_INFO`, `HTTP_*`, ...), the request body stream
//! and a few typed flags describing the server.
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::io::prelude::*;
use std::net::SocketAddr;

use crate::request::{RequestHead, Version};
use crate::shutdown::ShutdownHandle;
use crate::VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlScheme {
    Http,
    Https,
}

impl UrlScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for UrlScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of the client end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    /// A Unix domain socket peer, which has no usable address.
    Local,
}

impl PeerAddr {
    pub fn host(&self) -> String {
        match self {
            Self::Inet(addr) => addr.ip().to_string(),
            Self::Local => "<local>".to_string(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Inet(addr) => addr.port(),
            Self::Local => 0,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{}", addr),
            Self::Local => f.write_str("<local>"),
        }
    }
}

/// Fixed facts about the serving server, shared by every request.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub port: String,
    /// Protocol version the server answers with.
    pub protocol: Version,
    pub url_scheme: UrlScheme,
    pub multithread: bool,
    pub multiprocess: bool,
}

impl ServerInfo {
    pub fn software() -> String {
        format!("devserve/{}", VERSION)
    }
}

/// Facts about one accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: PeerAddr,
    /// Client certificate in PEM form, for TLS connections that presented one.
    pub peer_cert: Option<String>,
}

impl ConnectionInfo {
    pub fn new(peer: PeerAddr) -> Self {
        Self {
            peer,
            peer_cert: None,
        }
    }
}

/// Request context: environment variables, body stream and server flags.
pub struct Environ<'a> {
    vars: BTreeMap<String, String>,
    pub url_scheme: UrlScheme,
    pub multithread: bool,
    pub multiprocess: bool,
    /// Always false, the server keeps running between requests.
    pub run_once: bool,
    /// The body stream signals its own end (chunked requests) and may be
    /// read to exhaustion even without `CONTENT_LENGTH`.
    pub input_terminated: bool,
    input: Box<dyn Read + 'a>,
    shutdown: ShutdownHandle,
}

impl<'a> Environ<'a> {
    pub fn from_request(
        head: &RequestHead,
        server: &ServerInfo,
        conn: &ConnectionInfo,
        input: Box<dyn Read + 'a>,
        shutdown: ShutdownHandle,
    ) -> Self {
        let target = split_target(&head.target);
        let mut vars = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            vars.insert(key.to_string(), value);
        };
        set("SERVER_SOFTWARE", ServerInfo::software());
        set("REQUEST_METHOD", head.method.clone());
        set("SCRIPT_NAME", String::new());
        set("PATH_INFO", decode_path(&target.path));
        set("QUERY_STRING", target.query.to_string());
        set("REQUEST_URI", head.target.clone());
        set("RAW_URI", head.target.clone());
        set("REMOTE_ADDR", conn.peer.host());
        set("REMOTE_PORT", conn.peer.port().to_string());
        set("SERVER_NAME", server.name.clone());
        set("SERVER_PORT", server.port.clone());
        set("SERVER_PROTOCOL", head.version.to_string());

        for (name, value) in head.headers.iter() {
            let key = name.environ_key();
            let value = value.replace("\r\n", "");
            match vars.entry(key) {
                btree_map::Entry::Occupied(mut entry) if entry.key().starts_with("HTTP_") => {
                    let joined = format!("{},{}", entry.get(), value);
                    entry.insert(joined);
                }
                btree_map::Entry::Occupied(mut entry) => {
                    entry.insert(value);
                }
                btree_map::Entry::Vacant(entry) => {
                    entry.insert(value);
                }
            }
        }
        if let Some(authority) = target.authority {
            vars.insert("HTTP_HOST".to_string(), authority.to_string());
        }
        if let Some(cert) = &conn.peer_cert {
            vars.insert("SSL_CLIENT_CERT".to_string(), cert.clone());
        }

        Self {
            vars,
            url_scheme: server.url_scheme,
            multithread: server.multithread,
            multiprocess: server.multiprocess,
            run_once: false,
            input_terminated: head.is_chunked(),
            input,
            shutdown,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Set or replace a variable, for applications wrapping other
    /// applications.
    pub fn insert(&mut self, key: &str, value: &str) -> Option<String> {
        self.vars.insert(key.to_string(), value.to_string())
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn method(&self) -> &str {
        self.get("REQUEST_METHOD").unwrap_or_default()
    }

    pub fn path_info(&self) -> &str {
        self.get("PATH_INFO").unwrap_or_default()
    }

    pub fn query_string(&self) -> &str {
        self.get("QUERY_STRING").unwrap_or_default()
    }

    /// The request body. It yields exactly the body bytes and then end of
    /// stream, whatever the framing.
    pub fn input(&mut self) -> &mut (dyn Read + 'a) {
        &mut *self.input
    }

    /// Read the whole request body.
    pub fn read_body(&mut self) -> io::Result<Vec<u8>> {
        let mut body = vec![];
        self.input.read_to_end(&mut body)?;
        Ok(body)
    }

    /// Ask the server to stop once this request has been answered.
    pub fn shutdown_server(&self) {
        self.shutdown.request();
    }

    pub fn shutdown_handle(&self) -> &ShutdownHandle {
        &self.shutdown
    }
}

impl fmt::Debug for Environ<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environ")
            .field("vars", &self.vars)
            .field("url_scheme", &self.url_scheme)
            .field("multithread", &self.multithread)
            .field("multiprocess", &self.multiprocess)
            .field("input_terminated", &self.input_terminated)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq)]
struct Target<'t> {
    /// Authority of an absolute-form target.
    authority: Option<&'t str>,
    path: String,
    query: &'t str,
}

fn has_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().map_or(false, |c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn split_target(target: &str) -> Target<'_> {
    let target = target.split('#').next().unwrap_or_default();
    let (before, query) = target.split_once('?').unwrap_or((target, ""));
    if let Some((scheme, rest)) = before.split_once("://") {
        if has_scheme(scheme) {
            let (authority, path) = match rest.find('/') {
                Some(i) => rest.split_at(i),
                None => (rest, ""),
            };
            if !authority.is_empty() {
                return Target {
                    authority: Some(authority),
                    path: path.to_string(),
                    query,
                };
            }
        }
    }
    // A `//`-prefixed origin-form target keeps its first segment as path.
    Target {
        authority: None,
        path: before.to_string(),
        query,
    }
}

fn decode_path(path: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(path.as_bytes())).into_owned()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::{Header, Headers};

    fn head(target: &str, headers: &[(&str, &str)]) -> RequestHead {
        let mut h = Headers::new();
        for (name, value) in headers {
            h.push(Header::new(name), value.to_string());
        }
        RequestHead {
            method: "GET".to_string(),
            target: target.to_string(),
            version: Version::Http11,
            headers: h,
        }
    }

    fn server() -> ServerInfo {
        ServerInfo {
            name: "127.0.0.1".to_string(),
            port: "5000".to_string(),
            protocol: Version::Http11,
            url_scheme: UrlScheme::Http,
            multithread: true,
            multiprocess: false,
        }
    }

    fn environ<'a>(head: &RequestHead, input: &'a [u8]) -> Environ<'a> {
        let conn = ConnectionInfo::new(PeerAddr::Inet("10.0.0.7:41234".parse().unwrap()));
        Environ::from_request(head, &server(), &conn, Box::new(input), ShutdownHandle::new())
    }

    #[test]
    fn test_basic_vars() {
        let head = head("/caf%C3%A9/x?a=1&b=%20", &[("Host", "localhost:5000")]);
        let env = environ(&head, b"");
        assert_eq!(env.method(), "GET");
        assert_eq!(env.path_info(), "/café/x");
        assert_eq!(env.query_string(), "a=1&b=%20");
        assert_eq!(env.get("SCRIPT_NAME"), Some(""));
        assert_eq!(env.get("REQUEST_URI"), Some("/caf%C3%A9/x?a=1&b=%20"));
        assert_eq!(env.get("RAW_URI"), env.get("REQUEST_URI"));
        assert_eq!(env.get("REMOTE_ADDR"), Some("10.0.0.7"));
        assert_eq!(env.get("REMOTE_PORT"), Some("41234"));
        assert_eq!(env.get("SERVER_NAME"), Some("127.0.0.1"));
        assert_eq!(env.get("SERVER_PORT"), Some("5000"));
        assert_eq!(env.get("SERVER_PROTOCOL"), Some("HTTP/1.1"));
        assert_eq!(env.get("HTTP_HOST"), Some("localhost:5000"));
        assert!(env.get("SERVER_SOFTWARE").unwrap().starts_with("devserve/"));
        assert!(env.multithread);
        assert!(!env.run_once);
        assert!(!env.input_terminated);
    }

    #[test]
    fn test_headers_joined_and_content_unprefixed() {
        let head = head(
            "/",
            &[
                ("Accept", "text/html"),
                ("Content-Type", "text/plain"),
                ("Content-Length", "3"),
                ("X-Forwarded-For", "a"),
                ("accept", "*/*"),
            ],
        );
        let env = environ(&head, b"abc");
        assert_eq!(env.get("HTTP_ACCEPT"), Some("text/html,*/*"));
        assert_eq!(env.get("CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(env.get("CONTENT_LENGTH"), Some("3"));
        assert_eq!(env.get("HTTP_X_FORWARDED_FOR"), Some("a"));
        assert_eq!(env.get("HTTP_CONTENT_TYPE"), None);
    }

    #[test]
    fn test_absolute_target_overrides_host() {
        let head = head("http://example.com:8080/a/b?x=y", &[("Host", "other")]);
        let env = environ(&head, b"");
        assert_eq!(env.get("HTTP_HOST"), Some("example.com:8080"));
        assert_eq!(env.path_info(), "/a/b");
        assert_eq!(env.query_string(), "x=y");
    }

    #[test]
    fn test_double_slash_keeps_first_segment() {
        let head = head("//static/app.js", &[]);
        let env = environ(&head, b"");
        assert_eq!(env.path_info(), "//static/app.js");
        assert_eq!(env.get("HTTP_HOST"), None);
    }

    #[test]
    fn test_chunked_marks_input_terminated() {
        let head = head("/", &[("Transfer-Encoding", "chunked")]);
        let env = environ(&head, b"");
        assert!(env.input_terminated);
        assert_eq!(env.get("HTTP_TRANSFER_ENCODING"), Some("chunked"));
    }

    #[test]
    fn test_local_peer_and_cert() {
        let head = head("/", &[]);
        let conn = ConnectionInfo {
            peer: PeerAddr::Local,
            peer_cert: Some("-----BEGIN CERTIFICATE-----\n".to_string()),
        };
        let env = Environ::from_request(
            &head,
            &server(),
            &conn,
            Box::new(io::empty()),
            ShutdownHandle::new(),
        );
        assert_eq!(env.get("REMOTE_ADDR"), Some("<local>"));
        assert_eq!(env.get("REMOTE_PORT"), Some("0"));
        assert!(env.get("SSL_CLIENT_CERT").is_some());
    }

    #[test]
    fn test_body_and_shutdown() {
        let head = head("/", &[]);
        let mut env = environ(&head, b"payload");
        assert_eq!(env.read_body().unwrap(), b"payload");
        assert!(!env.shutdown_handle().is_requested());
        env.shutdown_server();
        assert!(env.shutdown_handle().is_requested());
    }

    #[test]
    fn test_split_target() {
        assert_eq!(
            split_target("*"),
            Target {
                authority: None,
                path: "*".to_string(),
                query: ""
            }
        );
        assert_eq!(split_target("/a?b#frag").query, "b");
        assert_eq!(split_target("https://h").authority, Some("h"));
        assert_eq!(split_target("https://h").path, "");
        assert_eq!(split_target("/x?next=http://y").path, "/x");
    }
}
