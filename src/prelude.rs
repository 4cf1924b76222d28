pub use crate::environ::Environ;
pub use crate::handler::{from_fn, AppError, Application, Body};
pub use crate::response::{HeaderList, StartResponse};
pub use crate::server::{Concurrency, Server, ServerConfig, ServerError};
pub use crate::serving::{run_simple, RunOptions};
pub use crate::shutdown::ShutdownHandle;
pub use crate::tls::TlsConfig;
