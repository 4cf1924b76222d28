//! HTTP Server components.
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::*;
use thiserror::Error;

use crate::address::{self, BindAddress};
use crate::environ::{ServerInfo, UrlScheme};
use crate::handler::{AppError, Application};
use crate::request::Version;
use crate::runner::Runner;
use crate::shutdown::ShutdownHandle;
use crate::tls::{TlsConfig, TlsError};

pub mod connection;
pub mod listener;

pub use connection::{handle_connection, serve_stream, ServerContext};
pub use listener::{Incoming, Listener, Stream};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("could not bind {address}: {source}")]
    Bind { address: String, source: io::Error },
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("application error: {0}")]
    Application(#[source] AppError),
}

/// How accepted connections are handled, chosen once per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// One connection at a time on the serving thread.
    Sequential,
    /// A new thread per connection.
    Threaded,
    /// A new process per connection, at most `max_children` at once.
    Forking { max_children: usize },
}

impl Concurrency {
    /// Protocol version answered in this mode. Only concurrent servers keep
    /// connections alive, so a sequential server never blocks on an idle
    /// client.
    pub fn protocol(&self) -> Version {
        match self {
            Self::Sequential => Version::Http10,
            _ => Version::Http11,
        }
    }
}

/// Server startup parameters.
///
/// # Example
/// ```
/// use devserve::server::{Concurrency, ServerConfig};
///
/// let config = ServerConfig::new("127.0.0.1", 0).threaded(true);
/// assert_eq!(config.concurrency().unwrap(), Concurrency::Threaded);
/// assert!(config.processes(4).concurrency().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub threaded: bool,
    pub processes: usize,
    pub tls: Option<TlsConfig>,
    pub passthrough_errors: bool,
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// Already listening descriptor to adopt instead of binding.
    pub inherited_fd: Option<i32>,
}

impl ServerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            threaded: false,
            processes: 1,
            tls: None,
            passthrough_errors: false,
            timeout: None,
            poll_interval: Duration::from_millis(500),
            inherited_fd: None,
        }
    }

    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    pub fn processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn passthrough_errors(mut self, passthrough_errors: bool) -> Self {
        self.passthrough_errors = passthrough_errors;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn inherited_fd(mut self, fd: Option<i32>) -> Self {
        self.inherited_fd = fd;
        self
    }

    /// Resolve the concurrency mode. Threads and processes are exclusive,
    /// and processes need fork support.
    pub fn concurrency(&self) -> Result<Concurrency, ServerError> {
        if self.threaded && self.processes > 1 {
            return Err(ServerError::Config(
                "cannot have a multi-thread and multi-process server".to_string(),
            ));
        }
        if self.processes > 1 {
            if cfg!(unix) {
                return Ok(Concurrency::Forking {
                    max_children: self.processes,
                });
            }
            return Err(ServerError::Config(
                "your platform does not support forking".to_string(),
            ));
        }
        if self.threaded {
            Ok(Concurrency::Threaded)
        } else {
            Ok(Concurrency::Sequential)
        }
    }
}

/// A bound HTTP server running one application.
pub struct Server {
    listener: Listener,
    runner: Runner,
    app: Arc<dyn Application>,
    context: Arc<ServerContext>,
    concurrency: Concurrency,
    address: BindAddress,
    poll_interval: Duration,
}

impl Server {
    /// Validate the configuration, prepare TLS, then bind (or adopt) and
    /// listen. Configuration and certificate errors are reported before any
    /// socket is opened.
    pub fn start<A: Application + 'static>(config: ServerConfig, app: A) -> Result<Self, ServerError> {
        let concurrency = config.concurrency()?;
        let runner = Runner::new(concurrency)?;
        let (family, address) = address::resolve(&config.host, config.port);
        let tls = match config.tls {
            Some(tls) => Some(tls.into_context()?),
            None => None,
        };
        let url_scheme = if tls.is_some() {
            UrlScheme::Https
        } else {
            UrlScheme::Http
        };
        let listener = match config.inherited_fd {
            Some(fd) => Listener::from_fd(fd, family, tls)?,
            None => Listener::bind(&address, tls)?,
        };
        let address = listener.local_addr()?;
        let (name, port) = match &address {
            BindAddress::Inet(addr) => (addr.ip().to_string(), addr.port().to_string()),
            BindAddress::Unix(path) => (path.display().to_string(), String::new()),
            BindAddress::Unresolved(host, port) => (host.clone(), port.to_string()),
        };
        debug!("listening on {}", address);

        let context = ServerContext {
            info: ServerInfo {
                name,
                port,
                protocol: concurrency.protocol(),
                url_scheme,
                multithread: concurrency == Concurrency::Threaded,
                multiprocess: matches!(concurrency, Concurrency::Forking { .. }),
            },
            shutdown: ShutdownHandle::new(),
            passthrough_errors: config.passthrough_errors,
            timeout: config.timeout,
        };
        Ok(Self {
            listener,
            runner,
            app: Arc::new(app),
            context: Arc::new(context),
            concurrency,
            address,
            poll_interval: config.poll_interval,
        })
    }

    /// The bound address; with port 0 this carries the port actually used.
    pub fn local_addr(&self) -> &BindAddress {
        &self.address
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn url_scheme(&self) -> UrlScheme {
        self.context.info.url_scheme
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.context.shutdown.clone()
    }

    /// Stop the accept loop at its next poll.
    pub fn shutdown(&self) {
        self.context.shutdown.stop();
    }

    /// Accept and serve connections until shut down.
    ///
    /// In sequential mode an application error let through by
    /// `passthrough_errors` ends serving and is returned.
    pub fn serve_forever(&mut self) -> Result<(), ServerError> {
        self.listener.set_nonblocking(true)?;
        let result = self.accept_loop();
        self.context.shutdown.reset();
        if let Err(err) = self.listener.set_nonblocking(false) {
            debug!("could not reset listener to blocking: {}", err);
        }
        result
    }

    fn accept_loop(&mut self) -> Result<(), ServerError> {
        while !self.context.shutdown.is_stopping() {
            self.runner.collect();
            match self.listener.accept() {
                Ok(incoming) => {
                    debug!("accepted connection from {}", incoming.peer);
                    self.process(incoming)?;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.poll_interval);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
                Err(err) => {
                    error!("error accepting connection: {}", err);
                    thread::sleep(self.poll_interval);
                }
            }
        }
        info!("server on {} stopped", self.address);
        Ok(())
    }

    fn process(&mut self, incoming: Incoming) -> Result<(), ServerError> {
        let app = Arc::clone(&self.app);
        let context = Arc::clone(&self.context);
        self.runner
            .run(move || handle_connection(incoming, app.as_ref(), &context))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_concurrency_is_exclusive() {
        let config = ServerConfig::new("127.0.0.1", 0);
        assert_eq!(config.concurrency().unwrap(), Concurrency::Sequential);
        assert_eq!(config.clone().threaded(true).concurrency().unwrap(), Concurrency::Threaded);
        assert!(matches!(
            config.clone().threaded(true).processes(2).concurrency(),
            Err(ServerError::Config(_))
        ));
        if cfg!(unix) {
            assert_eq!(
                config.processes(3).concurrency().unwrap(),
                Concurrency::Forking { max_children: 3 }
            );
        }
    }

    #[test]
    fn test_protocol_per_mode() {
        assert_eq!(Concurrency::Sequential.protocol(), Version::Http10);
        assert_eq!(Concurrency::Threaded.protocol(), Version::Http11);
        assert_eq!(Concurrency::Forking { max_children: 2 }.protocol(), Version::Http11);
    }

    #[test]
    fn test_config_error_before_bind() {
        let app = crate::handler::from_fn(|_, _| Ok(crate::handler::Body::empty()));
        let config = ServerConfig::new("127.0.0.1", 0).threaded(true).processes(2);
        assert!(matches!(Server::start(config, app), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_start_reports_bound_port() {
        let app = crate::handler::from_fn(|_, _| Ok(crate::handler::Body::empty()));
        let server = Server::start(ServerConfig::new("127.0.0.1", 0), app).unwrap();
        match server.local_addr() {
            BindAddress::Inet(addr) => assert_ne!(addr.port(), 0),
            other => panic!("unexpected address {}", other),
        }
        assert_eq!(server.url_scheme(), UrlScheme::Http);
        assert_eq!(server.context.info.protocol, Version::Http10);
    }

    #[test]
    fn test_shutdown_before_serving_returns() {
        let app = crate::handler::from_fn(|_, _| Ok(crate::handler::Body::empty()));
        let config = ServerConfig::new("127.0.0.1", 0).poll_interval(Duration::from_millis(10));
        let mut server = Server::start(config, app).unwrap();
        server.shutdown();
        assert!(server.serve_forever().is_ok());
    }
}
