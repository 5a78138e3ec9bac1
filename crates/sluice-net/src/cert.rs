//! Certificate selection by SNI server name.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{debug, warn};

/// The hook a TLS layer calls during each handshake to pick a certificate.
pub trait CertificateSelector: Send + Sync {
    type Certificate;

    /// Certificate for `server_name` (the SNI value, if the client sent one).
    fn select(&self, server_name: Option<&str>) -> Option<Self::Certificate>;
}

/// Certificates keyed by lower-cased server name, with `""` as the default.
///
/// Backed by a sharded concurrent map, so lookups for unrelated names never
/// wait on each other and each update is atomic for its key.
pub struct ServerNameSelector<C> {
    certs: DashMap<String, C>,
}

impl<C> fmt::Debug for ServerNameSelector<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.certs.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("ServerNameSelector")
            .field("server_names", &names)
            .finish()
    }
}

impl<C> Default for ServerNameSelector<C> {
    fn default() -> Self {
        Self {
            certs: DashMap::new(),
        }
    }
}

impl<C: Clone> ServerNameSelector<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact match on the normalised name, then the default, then nothing.
    pub fn get_certificate(&self, server_name: Option<&str>) -> Option<C> {
        let key = normalize(server_name);
        if let Some(cert) = self.certs.get(&key) {
            return Some(cert.value().clone());
        }
        self.certs.get("").map(|cert| cert.value().clone())
    }

    /// Insert or replace the certificate for `server_name`; `None` or `""`
    /// sets the default. Returns the certificate it replaced.
    pub fn set_certificate(&self, server_name: Option<&str>, cert: C) -> Option<C> {
        self.certs.insert(normalize(server_name), cert)
    }

    pub fn remove_certificate(&self, server_name: Option<&str>) -> Option<C> {
        self.certs
            .remove(&normalize(server_name))
            .map(|(_, cert)| cert)
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

fn normalize(server_name: Option<&str>) -> String {
    server_name.unwrap_or_default().to_lowercase()
}

impl<C: Clone + Send + Sync> CertificateSelector for ServerNameSelector<C> {
    type Certificate = C;

    fn select(&self, server_name: Option<&str>) -> Option<C> {
        self.get_certificate(server_name)
    }
}

impl ResolvesServerCert for ServerNameSelector<Arc<CertifiedKey>> {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name();
        let key = self.get_certificate(sni);
        match (&key, sni) {
            (Some(_), _) => debug!(sni = sni.unwrap_or_default(), "selected certificate"),
            (None, Some(sni)) => warn!(sni = %sni, "no certificate for server name"),
            (None, None) => warn!("no default certificate for client without SNI"),
        }
        key
    }
}
