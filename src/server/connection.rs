//! Per-connection request handling.
//!
//! A connection is served request by request: parse the request head, build
//! the [`Environ`], run the application, stream its response, then either
//! wait for the next request on the same connection or close it.
use std::any::Any;
use std::error::Error;
use std::io;
use std::io::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use log::*;

use crate::environ::{ConnectionInfo, Environ, ServerInfo};
use crate::handler::{AppError, Application, Dispatch};
use crate::io::SharedStream;
use crate::request::chunked::ChunkedReader;
use crate::request::parser::{RequestParser, RequestParserError};
use crate::request::{BodyFraming, RequestHead, Version};
use crate::response::StartResponse;
use crate::server::listener::Incoming;
use crate::shutdown::ShutdownHandle;

/// Read-only state shared by every connection of a server.
#[derive(Debug, Clone)]
pub struct ServerContext {
    pub info: ServerInfo,
    pub shutdown: ShutdownHandle,
    /// Let application errors escape instead of answering with an error page.
    pub passthrough_errors: bool,
    /// Read and write timeout of accepted sockets.
    pub timeout: Option<Duration>,
}

/// Serve an accepted connection until it is closed: finish the TLS
/// handshake if needed, then serve requests on it.
///
/// Only application errors in passthrough mode are returned; everything else
/// is logged and ends the connection.
pub fn handle_connection(
    incoming: Incoming,
    app: &dyn Application,
    ctx: &ServerContext,
) -> Result<(), AppError> {
    let peer = incoming.peer;
    if let Err(err) = incoming.prepare(ctx.timeout) {
        warn!("{}: could not configure socket: {}", peer, err);
        return Ok(());
    }
    let mut stream = match incoming.establish() {
        Ok(stream) => stream,
        Err(err) => {
            warn!("{}: TLS handshake failed: {}", peer, err);
            return Ok(());
        }
    };
    let conn = ConnectionInfo {
        peer,
        peer_cert: stream.peer_certificate(),
    };
    let result = serve_stream(&mut stream, &conn, app, ctx);
    stream.close();
    debug!("{}: connection closed", peer);
    result
}

/// Serve HTTP requests over a generic stream until the connection should
/// close.
///
/// # Example
/// ```
/// use devserve::environ::{ConnectionInfo, PeerAddr, ServerInfo, UrlScheme};
/// use devserve::handler::from_fn;
/// use devserve::io::ReadWriteAdapter;
/// use devserve::request::Version;
/// use devserve::server::connection::{serve_stream, ServerContext};
/// use devserve::shutdown::ShutdownHandle;
///
/// let app = from_fn(|_environ, start_response| {
///     start_response.start("200 OK", vec![("Content-Length".into(), "6".into())])?;
///     Ok("Hello!".into())
/// });
/// let ctx = ServerContext {
///     info: ServerInfo {
///         name: "localhost".to_string(),
///         port: "80".to_string(),
///         protocol: Version::Http10,
///         url_scheme: UrlScheme::Http,
///         multithread: false,
///         multiprocess: false,
///     },
///     shutdown: ShutdownHandle::new(),
///     passthrough_errors: false,
///     timeout: None,
/// };
///
/// let read_buf = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let mut write_buf = vec![];
/// let stream = ReadWriteAdapter::new(&read_buf[..], &mut write_buf);
/// serve_stream(stream, &ConnectionInfo::new(PeerAddr::Local), &app, &ctx).unwrap();
///
/// let response = String::from_utf8(write_buf).unwrap();
/// assert!(response.starts_with("HTTP/1.0 200 OK\r\nContent-Length: 6\r\n"));
/// assert!(response.ends_with("\r\n\r\nHello!"));
/// ```
pub fn serve_stream<S: Read + Write>(
    stream: S,
    conn: &ConnectionInfo,
    app: &dyn Application,
    ctx: &ServerContext,
) -> Result<(), AppError> {
    let stream = SharedStream::new(stream);
    loop {
        trace!("{}: reading request", conn.peer);
        let head = match RequestParser::new(stream.clone()).parse() {
            Ok(Some(head)) => head,
            Ok(None) => {
                trace!("{}: closed by peer", conn.peer);
                break;
            }
            Err(RequestParserError::Io(err)) if is_dropped_io(&err) => {
                connection_dropped(conn, &err);
                break;
            }
            Err(err) => {
                debug!("{}: dropping connection, {}", conn.peer, err);
                break;
            }
        };
        trace!("{}: {:?}", conn.peer, head);
        let keep_alive = handle_request(&stream, &head, conn, app, ctx)?;
        if ctx.shutdown.is_requested() {
            ctx.shutdown.initiate_if_requested();
            break;
        }
        if !keep_alive {
            break;
        }
    }
    Ok(())
}

/// Answer one request. Returns whether the connection may be reused.
fn handle_request<'s, S: Read + Write + 's>(
    stream: &SharedStream<S>,
    head: &RequestHead,
    conn: &ConnectionInfo,
    app: &dyn Application,
    ctx: &ServerContext,
) -> Result<bool, AppError> {
    let start = Instant::now();
    let mut keep_alive = ctx.info.protocol == Version::Http11 && head.keep_alive();
    let framing = match head.framing() {
        Some(framing) => framing,
        None => {
            debug!("{}: invalid Content-Length, dropping connection", conn.peer);
            return Ok(false);
        }
    };

    if head.expects_continue() {
        let mut writer = stream.clone();
        let interim = format!("{} 100 Continue\r\n\r\n", ctx.info.protocol);
        if let Err(err) = writer.write_all(interim.as_bytes()).and_then(|_| writer.flush()) {
            connection_dropped(conn, &err);
            return Ok(false);
        }
    }

    let input: Box<dyn Read + 's> = match framing {
        BodyFraming::Empty => Box::new(io::empty()),
        BodyFraming::Length(length) => Box::new(stream.clone().take(length)),
        BodyFraming::Chunked => Box::new(ChunkedReader::new(stream.clone())),
    };
    let mut environ = Environ::from_request(head, &ctx.info, conn, input, ctx.shutdown.clone());
    let mut writer = stream.clone();
    let mut response = StartResponse::new(&mut writer, ctx.info.protocol, head.is_head());

    let catch_panics = !ctx.passthrough_errors;
    match run_application(Dispatch::Application(app), &mut environ, &mut response, catch_panics) {
        Ok(()) => (),
        Err(err) if is_connection_dropped(err.as_ref()) => {
            connection_dropped(conn, err.as_ref());
            keep_alive = false;
        }
        Err(err) if ctx.passthrough_errors => return Err(err),
        Err(err) => {
            response.rollback();
            if let Err(fallback) =
                run_application(Dispatch::InternalError, &mut environ, &mut response, true)
            {
                debug!("{}: error page not sent: {}", conn.peer, fallback);
            }
            error!(
                "Error on request {} {}:\n{}",
                head.method,
                head.target,
                error_chain(err.as_ref())
            );
            keep_alive = false;
        }
    }
    keep_alive = keep_alive && !response.close_connection();

    info!(
        "{:?} - {}ms - {} \"{} {} {}\" -> {} ({} bytes)",
        thread::current().id(),
        start.elapsed().as_millis(),
        conn.peer,
        head.method,
        head.target,
        head.version,
        response
            .status_code()
            .map_or_else(|| "-".to_string(), |code| code.to_string()),
        response.bytes_written(),
    );

    if keep_alive {
        // The next request starts where this body ends.
        match io::copy(environ.input(), &mut io::sink()) {
            Ok(0) => (),
            Ok(n) => trace!("{}: discarded {} unread body bytes", conn.peer, n),
            Err(err) => {
                debug!("{}: could not skip request body: {}", conn.peer, err);
                keep_alive = false;
            }
        }
    }
    Ok(keep_alive)
}

/// Run an application and stream its response.
fn run_application(
    dispatch: Dispatch<'_>,
    environ: &mut Environ<'_>,
    response: &mut StartResponse<'_>,
    catch_panics: bool,
) -> Result<(), AppError> {
    let mut execute = || -> Result<(), AppError> {
        let body = dispatch.call(environ, response)?;
        for chunk in body {
            response.write_body(&chunk?)?;
        }
        if !response.headers_sent() {
            response.write_body(b"")?;
        }
        Ok(())
    };
    if !catch_panics {
        return execute();
    }
    panic::catch_unwind(AssertUnwindSafe(execute)).unwrap_or_else(|payload| Err(panic_error(payload)))
}

fn panic_error(payload: Box<dyn Any + Send>) -> AppError {
    let message = match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    };
    format!("application panicked: {}", message).into()
}

fn is_dropped_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::UnexpectedEof
    )
}

/// True if the error, or an error it was caused by, means the peer went
/// away or timed out.
pub fn is_connection_dropped(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if err.downcast_ref::<io::Error>().map_or(false, is_dropped_io) {
            return true;
        }
        current = err.source();
    }
    false
}

fn connection_dropped(conn: &ConnectionInfo, err: &(dyn Error + 'static)) {
    warn!("{}: connection dropped: {}", conn.peer, err);
}

fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        text.push_str(&format!("\n  caused by: {}", cause));
        current = cause.source();
    }
    text
}
