use std::path::PathBuf;
use std::process;

use log::*;
use structopt::StructOpt;

use devserve::environ::UrlScheme;
use devserve::prelude::*;
use devserve::serving::reserve_listener;
use devserve::shutdown::is_running_from_supervisor;
use devserve::supervisor::supervise;

fn echo(environ: &mut Environ<'_>, start_response: &mut StartResponse<'_>) -> Result<Body, AppError> {
    if environ.path_info() == "/shutdown" {
        environ.shutdown_server();
        let body = "Shutting down.\n";
        start_response.start(
            "200 OK",
            vec![
                ("Content-Type".into(), "text/plain".into()),
                ("Content-Length".into(), body.len().to_string()),
            ],
        )?;
        return Ok(body.into());
    }
    if environ.path_info() == "/error" {
        return Err("requested failure".into());
    }

    let input = environ.read_body()?;
    let report = serde_json::json!({
        "environ": environ.vars(),
        "url_scheme": environ.url_scheme.as_str(),
        "multithread": environ.multithread,
        "multiprocess": environ.multiprocess,
        "input": String::from_utf8_lossy(&input),
    });
    let mut body = serde_json::to_vec_pretty(&report)?;
    body.push(b'\n');
    start_response.start(
        "200 OK",
        vec![
            ("Content-Type".into(), "application/json".into()),
            ("Content-Length".into(), body.len().to_string()),
        ],
    )?;
    Ok(body.into())
}

fn setup_logging(verbosity: usize) {
    stderrlog::new()
        .module(module_path!())
        .module("devserve")
        .verbosity(verbosity + 2)
        .timestamp(stderrlog::Timestamp::Millisecond)
        .init()
        .unwrap();
}

#[derive(Debug, StructOpt)]
#[structopt(name = "devserver", about = "Development server echoing the request environ.")]
struct Opt {
    /// host:port, or unix://path
    #[structopt(short, long, default_value = "127.0.0.1:5000")]
    bind: String,
    #[structopt(long)]
    threaded: bool,
    #[structopt(long, default_value = "1")]
    processes: usize,
    /// Serve HTTPS with a throwaway certificate
    #[structopt(long, conflicts_with = "cert")]
    adhoc: bool,
    #[structopt(long, parse(from_os_str))]
    cert: Option<PathBuf>,
    #[structopt(long, parse(from_os_str), requires = "cert")]
    key: Option<PathBuf>,
    #[structopt(long)]
    passthrough_errors: bool,
    /// Restart the server when it exits with the restart code
    #[structopt(long)]
    supervise: bool,
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: usize,
}

impl Opt {
    fn host_port(&self) -> (String, u16) {
        if self.bind.starts_with("unix://") {
            return (self.bind.clone(), 0);
        }
        match self.bind.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => {
                    error!("invalid port in {:?}", self.bind);
                    process::exit(2);
                }
            },
            None => (self.bind.clone(), 5000),
        }
    }

    fn url_scheme(&self) -> UrlScheme {
        if self.adhoc || self.cert.is_some() {
            UrlScheme::Https
        } else {
            UrlScheme::Http
        }
    }

    fn run_options(&self) -> RunOptions {
        let tls = if self.adhoc {
            Some(TlsConfig::Adhoc)
        } else {
            self.cert
                .as_ref()
                .map(|cert| TlsConfig::files(cert.clone(), self.key.clone()))
        };
        RunOptions {
            threaded: self.threaded,
            processes: self.processes,
            tls,
            passthrough_errors: self.passthrough_errors,
            ..RunOptions::default()
        }
    }
}

fn main() {
    let opt = Opt::from_args();
    setup_logging(opt.verbose);
    let (host, port) = opt.host_port();

    let result = if opt.supervise {
        if !is_running_from_supervisor() {
            if let Err(err) = reserve_listener(&host, port, opt.url_scheme()) {
                error!("{}", err);
                process::exit(1);
            }
        }
        supervise(|| run_simple(&host, port, echo, opt.run_options()))
    } else {
        run_simple(&host, port, echo, opt.run_options()).map(|_| 0)
    };
    match result {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    }
}
