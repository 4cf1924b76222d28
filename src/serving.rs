//! One-call server startup and listening socket hand-off.
use std::env;
use std::time::Duration;

use log::*;

use crate::address::{self, BindAddress};
use crate::environ::UrlScheme;
use crate::handler::Application;
use crate::server::{Listener, Server, ServerConfig, ServerError};
use crate::tls::TlsConfig;

/// Environment variable carrying the number of an inherited, already
/// listening socket descriptor.
pub const SERVER_FD_ENV: &str = "DEVSERVE_SERVER_FD";

/// Worker process bound used by [`RunOptions::forking`].
pub const DEFAULT_MAX_CHILDREN: usize = 40;

/// Options for [`run_simple`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub threaded: bool,
    pub processes: usize,
    pub tls: Option<TlsConfig>,
    pub passthrough_errors: bool,
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            threaded: false,
            processes: 1,
            tls: None,
            passthrough_errors: false,
            timeout: None,
        }
    }
}

impl RunOptions {
    /// Handle connections in worker processes, with the default bound.
    pub fn forking() -> Self {
        Self {
            processes: DEFAULT_MAX_CHILDREN,
            ..Self::default()
        }
    }

    fn into_config(self, host: &str, port: u16) -> ServerConfig {
        let mut config = ServerConfig::new(host, port)
            .threaded(self.threaded)
            .processes(self.processes)
            .passthrough_errors(self.passthrough_errors)
            .timeout(self.timeout)
            .inherited_fd(inherited_fd());
        config.tls = self.tls;
        config
    }
}

/// Start a server for `app` and serve until it is shut down.
///
/// If a listening socket was handed over through [`SERVER_FD_ENV`] it is
/// adopted instead of binding, and the startup banner is left to whoever
/// bound it.
pub fn run_simple<A: Application + 'static>(
    host: &str,
    port: u16,
    app: A,
    options: RunOptions,
) -> Result<(), ServerError> {
    let config = options.into_config(host, port);
    let inherited = config.inherited_fd.is_some();
    let mut server = Server::start(config, app)?;
    if !inherited {
        log_startup(server.local_addr(), server.url_scheme());
    }
    server.serve_forever()
}

fn log_startup(address: &BindAddress, scheme: UrlScheme) {
    info!("{}", startup_message(address, scheme));
}

fn startup_message(address: &BindAddress, scheme: UrlScheme) -> String {
    match address {
        BindAddress::Unix(path) => format!(" * Running on unix socket {}", path.display()),
        BindAddress::Inet(addr) => {
            let host = match addr.ip() {
                ip if ip.is_unspecified() => "localhost".to_string(),
                ip if ip.is_ipv6() => format!("[{}]", ip),
                ip => ip.to_string(),
            };
            format!(
                " * Running on {}://{}:{}/ (Press CTRL+C to quit)",
                scheme,
                host,
                addr.port()
            )
        }
        BindAddress::Unresolved(host, port) => {
            format!(" * Running on {}://{}:{}/ (Press CTRL+C to quit)", scheme, host, port)
        }
    }
}

/// Descriptor number from [`SERVER_FD_ENV`], if set and valid.
pub fn inherited_fd() -> Option<i32> {
    let value = env::var(SERVER_FD_ENV).ok()?;
    match value.parse() {
        Ok(fd) => Some(fd),
        Err(_) => {
            warn!("ignoring invalid {}={:?}", SERVER_FD_ENV, value);
            None
        }
    }
}

/// Bind and listen on `host` and `port` now, and export the descriptor
/// through [`SERVER_FD_ENV`] so that processes started from this one keep
/// serving on the same socket without dropping queued connections.
///
/// `scheme` is the scheme the adopting server will serve, used for the
/// startup banner.
#[cfg(unix)]
pub fn reserve_listener(host: &str, port: u16, scheme: UrlScheme) -> Result<i32, ServerError> {
    let (fd, bound) = bind_inheritable(host, port)?;
    env::set_var(SERVER_FD_ENV, fd.to_string());
    log_startup(&bound, scheme);
    Ok(fd)
}

#[cfg(not(unix))]
pub fn reserve_listener(_host: &str, _port: u16, _scheme: UrlScheme) -> Result<i32, ServerError> {
    Err(ServerError::Config(
        "inherited sockets are not supported on this platform".to_string(),
    ))
}

/// Bind a listener whose descriptor survives `exec`.
#[cfg(unix)]
fn bind_inheritable(host: &str, port: u16) -> Result<(i32, BindAddress), ServerError> {
    let (_, address) = address::resolve(host, port);
    let listener = Listener::bind(&address, None)?;
    listener.set_inheritable()?;
    let bound = listener.local_addr()?;
    Ok((listener.into_raw_fd(), bound))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_run_options() {
        let options = RunOptions::forking();
        assert_eq!(options.processes, DEFAULT_MAX_CHILDREN);
        assert!(!options.threaded);
        let config = RunOptions::default().into_config("localhost", 5000);
        assert_eq!(config.processes, 1);
        assert_eq!(config.port, 5000);
    }

    #[test]
    fn test_startup_message_uses_scheme() {
        let address = BindAddress::Inet("0.0.0.0:8443".parse().unwrap());
        assert_eq!(
            startup_message(&address, UrlScheme::Https),
            " * Running on https://localhost:8443/ (Press CTRL+C to quit)"
        );
        let address = BindAddress::Inet("[::1]:80".parse().unwrap());
        assert!(startup_message(&address, UrlScheme::Http).contains("http://[::1]:80/"));
    }

    #[cfg(unix)]
    #[test]
    fn test_reserve_then_adopt() {
        let (fd, bound) = bind_inheritable("127.0.0.1", 0).unwrap();

        let app = crate::handler::from_fn(|_, _| Ok(crate::handler::Body::empty()));
        let server = Server::start(ServerConfig::new("127.0.0.1", 0).inherited_fd(Some(fd)), app).unwrap();
        assert_eq!(server.local_addr(), &bound);
        match server.local_addr() {
            BindAddress::Inet(addr) => assert_ne!(addr.port(), 0),
            other => panic!("unexpected address {}", other),
        }
    }
}
