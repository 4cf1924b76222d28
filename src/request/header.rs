use std::fmt;
use std::hash;

/// A header name, compared and hashed case-insensitively.
#[derive(Debug, Clone)]
pub struct Header(String);

impl Header {
    pub fn new(s: &str) -> Self {
        Self(s.to_string())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
    /// Environ key for this header: upper-cased with `-` replaced by `_`,
    /// prefixed with `HTTP_` except for `Content-Type` and `Content-Length`.
    pub fn environ_key(&self) -> String {
        let key = self.0.to_uppercase().replace('-', "_");
        match &key[..] {
            "CONTENT_TYPE" | "CONTENT_LENGTH" => key,
            _ => format!("HTTP_{}", key),
        }
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Header {}

impl hash::Hash for Header {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.0.to_ascii_lowercase().hash(state);
    }
}

impl From<String> for Header {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<Header> for String {
    fn from(s: Header) -> Self {
        s.0
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request headers in arrival order. Lookups are case-insensitive and
/// repeated headers are kept as separate entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(Header, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&mut self, name: Header, value: String) {
        self.entries.push((name, value));
    }
    pub(crate) fn last_mut(&mut self) -> Option<&mut String> {
        self.entries.last_mut().map(|(_, v)| v)
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&Header, &str)> {
        self.entries.iter().map(|(h, v)| (h, v.as_str()))
    }
    /// First value of the named header.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = Header::new(name);
        self.entries
            .iter()
            .find(|(h, _)| *h == name)
            .map(|(_, v)| v.as_str())
    }
    /// All values of the named header joined with `,`.
    pub fn get_joined(&self, name: &str) -> Option<String> {
        let name = Header::new(name);
        let values: Vec<&str> = self
            .entries
            .iter()
            .filter(|(h, _)| *h == name)
            .map(|(_, v)| v.as_str())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(","))
        }
    }
    /// True if the named header is present and, once trimmed, equals `value`
    /// ignoring ASCII case.
    pub fn is(&self, name: &str, value: &str) -> bool {
        self.get(name)
            .map_or(false, |v| v.trim().eq_ignore_ascii_case(value))
    }
    /// True if any comma-separated token of the named header equals `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        let name = Header::new(name);
        self.entries
            .iter()
            .filter(|(h, _)| *h == name)
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.push(Header::new(name), value.to_string());
        }
        headers
    }

    #[test]
    fn test_header_case_insensitive() {
        assert_eq!(Header::new("Content-Length"), Header::new("content-length"));
        let h = headers(&[("X-Thing", "a")]);
        assert_eq!(h.get("x-thing"), Some("a"));
    }

    #[test]
    fn test_joined_values() {
        let h = headers(&[("Accept", "text/html"), ("Host", "x"), ("accept", "*/*")]);
        assert_eq!(h.get_joined("ACCEPT").unwrap(), "text/html,*/*");
        assert_eq!(h.get_joined("missing"), None);
    }

    #[test]
    fn test_environ_key() {
        assert_eq!(Header::new("X-Forwarded-For").environ_key(), "HTTP_X_FORWARDED_FOR");
        assert_eq!(Header::new("content-type").environ_key(), "CONTENT_TYPE");
        assert_eq!(Header::new("Content-Length").environ_key(), "CONTENT_LENGTH");
    }

    #[test]
    fn test_tokens() {
        let h = headers(&[("Connection", "Keep-Alive, Upgrade"), ("Expect", " 100-Continue ")]);
        assert!(h.has_token("connection", "keep-alive"));
        assert!(!h.has_token("connection", "close"));
        assert!(h.is("expect", "100-continue"));
    }
}
