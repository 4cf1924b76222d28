//! A development HTTP/1.x server for synchronous applications.
//! * Sequential, [threaded and forking](crate::server::Concurrency) connection handling
//! * A callable [application contract](crate::handler::Application) with a CGI-style
//!   [environ](crate::environ::Environ) and a [`start_response`](crate::response::StartResponse)
//! * Keep-alive, `Expect: 100-continue` and [chunked request bodies](crate::request::chunked::ChunkedReader)
//! * [TLS](crate::tls) from PEM files or an ad-hoc self-signed certificate
//! * Cooperative [shutdown](crate::shutdown) from inside a request
//! * [Listening socket hand-off](crate::serving::reserve_listener) and a restarting
//!   [supervisor](crate::supervisor)
//!
//! # Example
//! ```
//! use std::io::prelude::*;
//! use std::net::TcpStream;
//! use std::thread;
//! use std::time::Duration;
//!
//! use devserve::address::BindAddress;
//! use devserve::prelude::*;
//!
//! let app = from_fn(|environ, start_response| {
//!     let greeting = format!("Hello from {}!", environ.path_info());
//!     start_response.start(
//!         "200 OK",
//!         vec![("Content-Length".into(), greeting.len().to_string())],
//!     )?;
//!     Ok(greeting.into())
//! });
//! let config = ServerConfig::new("127.0.0.1", 0).poll_interval(Duration::from_millis(10));
//! let mut server = Server::start(config, app).unwrap();
//! let addr = match server.local_addr() {
//!     BindAddress::Inet(addr) => *addr,
//!     other => panic!("unexpected address {}", other),
//! };
//! let shutdown = server.shutdown_handle();
//!
//! let client = thread::spawn(move || {
//!     let mut stream = TcpStream::connect(addr).unwrap();
//!     stream.write_all(b"GET /world HTTP/1.0\r\n\r\n").unwrap();
//!     let mut response = String::new();
//!     stream.read_to_string(&mut response).unwrap();
//!     shutdown.stop();
//!     response
//! });
//! server.serve_forever().unwrap();
//!
//! let response = client.join().unwrap();
//! assert!(response.starts_with("HTTP/1.0 200 OK\r\n"));
//! assert!(response.ends_with("Hello from /world!"));
//! ```
pub mod address;
pub mod collab;
pub mod environ;
pub mod handler;
pub mod io;
pub mod prelude;
pub mod request;
pub mod response;
pub mod runner;
pub mod server;
pub mod serving;
pub mod shutdown;
pub mod supervisor;
pub mod tls;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
