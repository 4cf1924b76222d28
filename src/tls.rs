//! TLS termination: certificate loading, ad-hoc certificate generation and
//! server-side handshakes.
use std::fs;
use std::io;
use std::io::prelude::*;
use std::io::BufReader;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, error};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    PKCS_RSA_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConnection, StreamOwned, SupportedProtocolVersion};
use tempfile::TempPath;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Organization name of every ad-hoc certificate.
pub const ADHOC_ORGANIZATION: &str = "Dummy Certificate";
/// Common name used when none is given.
pub const ADHOC_COMMON_NAME: &str = "*";
const VALIDITY_DAYS: i64 = 365;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("{}: {source}", path.display())]
    File { path: PathBuf, source: io::Error },
    #[error("no certificate found in {}", .0.display())]
    NoCertificate(PathBuf),
    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),
    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] io::Error),
}

fn file_error(path: &Path) -> impl FnOnce(io::Error) -> TlsError + '_ {
    move |source| TlsError::File {
        path: path.to_path_buf(),
        source,
    }
}

/// A PEM certificate and private key.
#[derive(Debug, Clone)]
pub struct CertificatePair {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

/// Generate a self-signed certificate for development: RSA 2048, valid for
/// one year from now, for server authentication, with a wildcard DNS
/// subject alternative name. The common name defaults to `*`.
pub fn generate_adhoc_pair(common_name: Option<&str>) -> Result<CertificatePair, TlsError> {
    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;

    let mut params = CertificateParams::new(vec!["*".to_string()])?;
    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, ADHOC_ORGANIZATION);
    name.push(DnType::CommonName, common_name.unwrap_or(ADHOC_COMMON_NAME));
    params.distinguished_name = name;

    // Certificates carry whole seconds.
    let now = OffsetDateTime::now_utc();
    let now = now.replace_nanosecond(0).unwrap_or(now);
    let not_after = now + Duration::days(VALIDITY_DAYS);
    params.not_before = now;
    params.not_after = not_after;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params.self_signed(&key_pair)?;
    Ok(CertificatePair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        not_before: now,
        not_after,
    })
}

/// Generate an ad-hoc certificate and store it as `<base>.crt` and
/// `<base>.key`. Unlike the in-memory ad-hoc context this survives restarts.
///
/// If `host` is given the common name becomes `*.<host>/CN=<host>`,
/// otherwise `cn` is used.
pub fn make_devcert(
    base_path: &Path,
    host: Option<&str>,
    cn: Option<&str>,
) -> Result<(PathBuf, PathBuf), TlsError> {
    let host_cn = host.map(|host| format!("*.{0}/CN={0}", host));
    let pair = generate_adhoc_pair(host_cn.as_deref().or(cn))?;

    let cert_file = with_suffix(base_path, ".crt");
    let key_file = with_suffix(base_path, ".key");
    fs::write(&cert_file, &pair.cert_pem).map_err(file_error(&cert_file))?;
    fs::write(&key_file, &pair.key_pem).map_err(file_error(&key_file))?;
    debug!("wrote development certificate {}", cert_file.display());
    Ok((cert_file, key_file))
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

/// TLS protocol version to restrict a context to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProtocol {
    Tls12,
    Tls13,
}

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

impl TlsProtocol {
    fn versions(&self) -> &'static [&'static SupportedProtocolVersion] {
        match self {
            Self::Tls12 => TLS12_ONLY,
            Self::Tls13 => TLS13_ONLY,
        }
    }
}

/// Temporary certificate files of an ad-hoc context, removed when the last
/// context referring to them is dropped.
#[derive(Debug)]
struct AdhocFiles {
    _cert: TempPath,
    _key: TempPath,
}

/// A server-side TLS configuration, cheap to clone and shared read-only by
/// all workers.
#[derive(Debug, Clone)]
pub struct TlsContext {
    config: Arc<rustls::ServerConfig>,
    _adhoc: Option<Arc<AdhocFiles>>,
}

pub type TlsStream = StreamOwned<ServerConnection, TcpStream>;

impl TlsContext {
    /// Use a ready-made rustls configuration.
    pub fn from_config(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            config,
            _adhoc: None,
        }
    }

    pub fn config(&self) -> &Arc<rustls::ServerConfig> {
        &self.config
    }

    /// Perform the server side of the handshake on a freshly accepted
    /// connection.
    pub fn accept(&self, mut tcp: TcpStream) -> Result<TlsStream, TlsError> {
        let mut conn = ServerConnection::new(Arc::clone(&self.config))?;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)?;
        }
        debug!(
            "TLS handshake complete ({:?})",
            conn.protocol_version()
        );
        Ok(StreamOwned::new(conn, tcp))
    }
}

/// Load a context from a PEM certificate chain and private key. Without
/// `key_file` the key is read from `cert_file`. Without `protocol` the
/// default set of TLS versions is negotiated.
pub fn load_context(
    cert_file: &Path,
    key_file: Option<&Path>,
    protocol: Option<TlsProtocol>,
) -> Result<TlsContext, TlsError> {
    let certs = read_certs(cert_file)?;
    let key = read_key(key_file.unwrap_or(cert_file))?;
    let builder = match protocol {
        None => rustls::ServerConfig::builder(),
        Some(protocol) => rustls::ServerConfig::builder_with_protocol_versions(protocol.versions()),
    };
    let config = builder
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsContext::from_config(Arc::new(config)))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = fs::File::open(path).map_err(file_error(path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(file_error(path))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = fs::File::open(path).map_err(file_error(path))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(file_error(path))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Generate an ad-hoc certificate, write it to temporary files and load a
/// context from them. The files live as long as the context.
pub fn generate_adhoc_context() -> Result<TlsContext, TlsError> {
    let pair = generate_adhoc_pair(None)?;
    let cert = write_temp(".crt", &pair.cert_pem)?;
    let key = write_temp(".key", &pair.key_pem)?;
    let mut context = load_context(&cert, Some(&key), None)?;
    context._adhoc = Some(Arc::new(AdhocFiles {
        _cert: cert,
        _key: key,
    }));
    Ok(context)
}

fn write_temp(suffix: &str, contents: &str) -> Result<TempPath, TlsError> {
    let mut file = tempfile::Builder::new()
        .prefix("devserve-")
        .suffix(suffix)
        .tempfile()?;
    file.write_all(contents.as_bytes())?;
    Ok(file.into_temp_path())
}

/// How a server obtains its TLS context.
#[derive(Debug, Clone)]
pub enum TlsConfig {
    /// Generate a throwaway self-signed certificate at startup.
    Adhoc,
    Files {
        cert: PathBuf,
        key: Option<PathBuf>,
        protocol: Option<TlsProtocol>,
    },
    Context(TlsContext),
}

impl TlsConfig {
    pub fn files(cert: impl Into<PathBuf>, key: Option<PathBuf>) -> Self {
        Self::Files {
            cert: cert.into(),
            key,
            protocol: None,
        }
    }

    pub fn into_context(self) -> Result<TlsContext, TlsError> {
        match self {
            Self::Adhoc => generate_adhoc_context(),
            Self::Files {
                cert,
                key,
                protocol,
            } => load_context(&cert, key.as_deref(), protocol),
            Self::Context(context) => Ok(context),
        }
    }
}

/// The peer's certificate in PEM form, if the client presented one.
///
/// A connection still handshaking has no certificate yet; that case is
/// logged and treated as no certificate.
pub fn peer_certificate_pem(conn: &ServerConnection) -> Option<String> {
    if conn.is_handshaking() {
        error!("cannot fetch TLS peer certificate info, handshake not finished");
        return None;
    }
    conn.peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| der_to_pem(cert.as_ref()))
}

fn der_to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

#[cfg(test)]
mod test {
    use super::*;
    use x509_parser::prelude::*;

    fn parse(pem_text: &str) -> Vec<u8> {
        let (_, pem) = parse_x509_pem(pem_text.as_bytes()).unwrap();
        pem.contents
    }

    #[test]
    fn test_adhoc_pair_defaults() {
        let pair = generate_adhoc_pair(None).unwrap();
        let der = parse(&pair.cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();

        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "*");
        let org = cert.subject().iter_organization().next().unwrap();
        assert_eq!(org.as_str().unwrap(), ADHOC_ORGANIZATION);

        let validity = cert.validity();
        let seconds = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert_eq!(seconds, 365 * 24 * 60 * 60);

        assert_eq!(cert.subject(), cert.issuer());
        assert!(cert.verify_signature(None).is_ok());

        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.server_auth);
        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName("*"))));
    }

    #[test]
    fn test_adhoc_pair_common_name() {
        let pair = generate_adhoc_pair(Some("dev.local")).unwrap();
        let der = parse(&pair.cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "dev.local");
        assert!(pair.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_make_devcert_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("dev");
        let (cert, key) = make_devcert(&base, Some("example.test"), None).unwrap();
        assert_eq!(cert, dir.path().join("dev.crt"));
        assert_eq!(key, dir.path().join("dev.key"));

        let der = parse(&fs::read_to_string(&cert).unwrap());
        let (_, parsed) = X509Certificate::from_der(&der).unwrap();
        let cn = parsed.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "*.example.test/CN=example.test");

        assert!(load_context(&cert, Some(&key), None).is_ok());
        assert!(load_context(&cert, Some(&key), Some(TlsProtocol::Tls13)).is_ok());
        assert!(load_context(&cert, Some(&key), Some(TlsProtocol::Tls12)).is_ok());
    }

    #[test]
    fn test_protocol_versions() {
        assert_eq!(TlsProtocol::Tls12.versions().len(), 1);
        assert_eq!(TlsProtocol::Tls12.versions()[0].version, rustls::ProtocolVersion::TLSv1_2);
        assert_eq!(TlsProtocol::Tls13.versions().len(), 1);
        assert_eq!(TlsProtocol::Tls13.versions()[0].version, rustls::ProtocolVersion::TLSv1_3);
    }

    #[test]
    fn test_load_bundled_key() {
        let dir = tempfile::tempdir().unwrap();
        let pair = generate_adhoc_pair(None).unwrap();
        let bundle = dir.path().join("bundle.pem");
        fs::write(&bundle, format!("{}{}", pair.cert_pem, pair.key_pem)).unwrap();
        assert!(load_context(&bundle, None, None).is_ok());
    }

    #[test]
    fn test_load_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let pair = generate_adhoc_pair(None).unwrap();
        let cert = dir.path().join("only.crt");
        fs::write(&cert, &pair.cert_pem).unwrap();
        match load_context(&cert, None, None) {
            Err(TlsError::NoPrivateKey(path)) => assert_eq!(path, cert),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_adhoc_context_removes_files_on_drop() {
        let context = generate_adhoc_context().unwrap();
        let files = context._adhoc.clone().unwrap();
        let cert_path = files._cert.to_path_buf();
        assert!(cert_path.exists());
        drop(files);
        drop(context);
        assert!(!cert_path.exists());
    }

    #[test]
    fn test_der_to_pem_roundtrips_through_parser() {
        let pair = generate_adhoc_pair(None).unwrap();
        let der = parse(&pair.cert_pem);
        assert_eq!(parse(&der_to_pem(&der)), der);
    }
}
