//! The application contract.
//!
//! An [`Application`] is called once per request with the request
//! [`Environ`] and a [`StartResponse`]. It must start the response before
//! any body bytes are produced, then either write the body through the
//! returned [`BodyWriter`](crate::response::BodyWriter), return it as a
//! [`Body`], or both.
use std::error::Error;
use std::fmt;

use crate::environ::Environ;
use crate::response::StartResponse;

/// Any error an application may raise.
pub type AppError = Box<dyn Error + Send + Sync>;

pub type BodyChunk = Result<Vec<u8>, AppError>;

/// A finite, non-restartable sequence of body chunks.
pub struct Body {
    chunks: Box<dyn Iterator<Item = BodyChunk>>,
}

impl Body {
    pub fn empty() -> Self {
        Self::from_chunks(std::iter::empty())
    }

    /// Body made of the given chunks, produced lazily.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: 'static,
    {
        Self::from_results(chunks.into_iter().map(Ok))
    }

    /// Body whose production may fail part way.
    pub fn from_results<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = BodyChunk>,
        I::IntoIter: 'static,
    {
        Self {
            chunks: Box::new(chunks.into_iter()),
        }
    }
}

impl Iterator for Body {
    type Item = BodyChunk;

    fn next(&mut self) -> Option<BodyChunk> {
        self.chunks.next()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Body")
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_chunks(std::iter::once(bytes))
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        bytes.to_vec().into()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        s.into_bytes().into()
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        s.as_bytes().into()
    }
}

/// Entry point bridging the server to request handling logic.
///
/// The server shares one application between all its workers, so it must
/// tolerate concurrent calls in threaded mode.
pub trait Application: Send + Sync {
    fn call(
        &self,
        environ: &mut Environ<'_>,
        start_response: &mut StartResponse<'_>,
    ) -> Result<Body, AppError>;
}

impl<F> Application for F
where
    F: Fn(&mut Environ<'_>, &mut StartResponse<'_>) -> Result<Body, AppError> + Send + Sync,
{
    fn call(
        &self,
        environ: &mut Environ<'_>,
        start_response: &mut StartResponse<'_>,
    ) -> Result<Body, AppError> {
        (self)(environ, start_response)
    }
}

/// Pin down the signature of a closure used as an application, so its
/// argument types need no annotations.
///
/// ```
/// use devserve::handler::{from_fn, Application};
///
/// let app = from_fn(|_environ, start_response| {
///     start_response.start("204 No Content", vec![])?;
///     Ok(devserve::handler::Body::empty())
/// });
/// fn assert_app(_: &impl Application) {}
/// assert_app(&app);
/// ```
pub fn from_fn<F>(f: F) -> F
where
    F: Fn(&mut Environ<'_>, &mut StartResponse<'_>) -> Result<Body, AppError> + Send + Sync,
{
    f
}

/// Which application a request is dispatched to: the user's, or the
/// built-in error page used once the user's has failed.
#[derive(Clone, Copy)]
pub enum Dispatch<'a> {
    Application(&'a dyn Application),
    InternalError,
}

impl Dispatch<'_> {
    pub fn call(
        &self,
        environ: &mut Environ<'_>,
        start_response: &mut StartResponse<'_>,
    ) -> Result<Body, AppError> {
        match self {
            Self::Application(app) => app.call(environ, start_response),
            Self::InternalError => internal_server_error(environ, start_response),
        }
    }
}

impl fmt::Debug for Dispatch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application(_) => f.write_str("Application"),
            Self::InternalError => f.write_str("InternalError"),
        }
    }
}

const INTERNAL_SERVER_ERROR_PAGE: &str = "<!doctype html>\n\
<html lang=en>\n\
<title>500 Internal Server Error</title>\n\
<h1>Internal Server Error</h1>\n\
<p>The server encountered an internal error and was unable to complete your request. \
Either the server is overloaded or there is an error in the application.</p>\n";

/// Generic 500 response.
pub fn internal_server_error(
    _environ: &mut Environ<'_>,
    start_response: &mut StartResponse<'_>,
) -> Result<Body, AppError> {
    let page = INTERNAL_SERVER_ERROR_PAGE.as_bytes();
    start_response.start(
        "500 Internal Server Error",
        vec![
            ("Content-Type".to_string(), "text/html; charset=utf-8".to_string()),
            ("Content-Length".to_string(), page.len().to_string()),
        ],
    )?;
    Ok(page.into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_body_conversions() {
        let chunks: Vec<Vec<u8>> = Body::from("hi").map(|c| c.unwrap()).collect();
        assert_eq!(chunks, vec![b"hi".to_vec()]);
        assert_eq!(Body::empty().count(), 0);
        let parts = Body::from_chunks(vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(parts.count(), 2);
    }

    #[test]
    fn test_body_results_keep_errors() {
        let mut body = Body::from_results(vec![Ok(b"a".to_vec()), Err("broken".into())]);
        assert!(body.next().unwrap().is_ok());
        assert_eq!(body.next().unwrap().unwrap_err().to_string(), "broken");
        assert!(body.next().is_none());
    }

    #[test]
    fn test_error_page_is_complete_html() {
        assert!(INTERNAL_SERVER_ERROR_PAGE.starts_with("<!doctype html>"));
        assert!(INTERNAL_SERVER_ERROR_PAGE.contains("<title>500 Internal Server Error</title>"));
    }
}
