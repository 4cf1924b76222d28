//! Service registration and lookup.
use std::collections::HashMap;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::RwLock;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use super::CollabError;

/// A TCP health check, serialized the way service catalogs expect it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "TCP")]
    pub tcp: String,
    #[serde(rename = "Interval")]
    pub interval: String,
    #[serde(rename = "Timeout")]
    pub timeout: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    pub deregister_critical_service_after: String,
    #[serde(skip)]
    probe_timeout: Duration,
}

impl HealthCheck {
    /// Check that `host:port` accepts connections every `interval`.
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use devserve::collab::HealthCheck;
    ///
    /// let secs = Duration::from_secs;
    /// let check = HealthCheck::tcp("10.0.0.1", 8866, secs(5), secs(30), secs(30));
    /// assert_eq!(check.tcp, "10.0.0.1:8866");
    /// assert_eq!(check.interval, "5s");
    /// ```
    pub fn tcp(
        host: &str,
        port: u16,
        interval: Duration,
        timeout: Duration,
        deregister_after: Duration,
    ) -> Self {
        Self {
            tcp: format!("{}:{}", host, port),
            interval: format_duration(interval),
            timeout: format_duration(timeout),
            deregister_critical_service_after: format_duration(deregister_after),
            probe_timeout: timeout,
        }
    }

    /// Run the check once.
    pub fn probe(&self) -> io::Result<()> {
        let timeout = if self.probe_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            self.probe_timeout
        };
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address to check");
        for addr in self.tcp.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(_) => return Ok(()),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRecord {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub check: Option<HealthCheck>,
}

impl ServiceRecord {
    /// The `host:port` form of the service address.
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

pub trait ServiceRegistry {
    /// Register a service under `name`, replacing any previous registration.
    fn register(
        &self,
        name: &str,
        host: &str,
        port: u16,
        check: Option<HealthCheck>,
    ) -> Result<(), CollabError>;

    /// Look a service up, returning its record and `host:port` address.
    fn lookup(&self, name: &str) -> Result<Option<(ServiceRecord, String)>, CollabError>;
}

/// A registry kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    services: RwLock<HashMap<String, ServiceRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deregister(&self, name: &str) -> Option<ServiceRecord> {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        services.remove(name)
    }
}

impl ServiceRegistry for MemoryRegistry {
    fn register(
        &self,
        name: &str,
        host: &str,
        port: u16,
        check: Option<HealthCheck>,
    ) -> Result<(), CollabError> {
        let record = ServiceRecord {
            id: name.to_string(),
            service: name.to_string(),
            address: host.to_string(),
            port,
            tags: vec![],
            check,
        };
        debug!("registered service {} at {}", name, record.host_port());
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        services.insert(name.to_string(), record);
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Option<(ServiceRecord, String)>, CollabError> {
        let services = self.services.read().unwrap_or_else(|e| e.into_inner());
        Ok(services.get(name).map(|record| {
            let address = record.host_port();
            (record.clone(), address)
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_register_and_lookup() {
        let registry = MemoryRegistry::new();
        assert!(registry.lookup("seq").unwrap().is_none());

        let secs = Duration::from_secs;
        let check = HealthCheck::tcp("10.60.0.221", 8866, secs(5), secs(30), secs(30));
        registry.register("seq", "10.60.0.221", 8866, Some(check)).unwrap();
        let (record, address) = registry.lookup("seq").unwrap().unwrap();
        assert_eq!(address, "10.60.0.221:8866");
        assert_eq!(record.service, "seq");
        assert_eq!(record.check.unwrap().deregister_critical_service_after, "30s");

        assert!(registry.deregister("seq").is_some());
        assert!(registry.lookup("seq").unwrap().is_none());
    }

    #[test]
    fn test_record_json() {
        let check = HealthCheck::tcp(
            "localhost",
            80,
            Duration::from_millis(1500),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        let record = ServiceRecord {
            id: "web".to_string(),
            service: "web".to_string(),
            address: "localhost".to_string(),
            port: 80,
            tags: vec!["dev".to_string()],
            check: Some(check),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["ID"], "web");
        assert_eq!(value["Port"], 80);
        assert_eq!(value["Check"]["TCP"], "localhost:80");
        assert_eq!(value["Check"]["Interval"], "1500ms");
        assert_eq!(value["Check"]["DeregisterCriticalServiceAfter"], "60s");
    }

    #[test]
    fn test_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let secs = Duration::from_secs;
        let check = HealthCheck::tcp("127.0.0.1", port, secs(5), secs(1), secs(30));
        assert!(check.probe().is_ok());
        drop(listener);
        assert!(check.probe().is_err());
    }
}
