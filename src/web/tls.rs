//! TLS plumbing for the public server: per-SNI server configs resolved
//! against the zone store and certificate manager, a per-process SNI cache
//! fingerprinted by certificate expiry, and a cluster-wide session ticket
//! store so worker processes share resumption state.

use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::StoresServerSessions;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::acme::{CertData, CertManager};
use crate::config::Config;
use crate::error::{DnsError, Result};
use crate::store::KeyStore;
use crate::zone::{RecordType, ZoneStore};

/// Ticket lifetime at creation, and the shorter refresh applied on resume
const TICKET_TTL: Duration = Duration::from_secs(30 * 60);
const RESUME_TTL: Duration = Duration::from_secs(5 * 60);

/// Session tickets shared across worker processes through the key store.
/// `rustls` drives this through a synchronous trait; reads bridge onto the
/// runtime, writes replicate in the background.
pub struct ClusterSessionStore<S: KeyStore> {
    store: S,
    handle: tokio::runtime::Handle,
}

impl<S: KeyStore> ClusterSessionStore<S> {
    pub fn new(store: S, handle: tokio::runtime::Handle) -> Self {
        Self { store, handle }
    }

    fn ticket_key(id: &[u8]) -> String {
        format!("d:tls:{}", hex::encode(id))
    }
}

impl<S: KeyStore> std::fmt::Debug for ClusterSessionStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClusterSessionStore")
    }
}

impl<S: KeyStore + Clone + 'static> StoresServerSessions for ClusterSessionStore<S> {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        let store = self.store.clone();
        let ticket_key = Self::ticket_key(&key);
        self.handle.spawn(async move {
            if let Err(err) = store.set(&ticket_key, &value, Some(TICKET_TTL)).await {
                tracing::debug!("session ticket write failed: {}", err);
            }
        });
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let ticket_key = Self::ticket_key(key);
        let store = self.store.clone();
        let handle = self.handle.clone();
        tokio::task::block_in_place(move || {
            handle.block_on(async move {
                let value = store.get(&ticket_key).await.ok().flatten();
                if value.is_some() {
                    let _ = store.expire(&ticket_key, RESUME_TTL).await;
                }
                value
            })
        })
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        // tickets stay shared between workers; resumption refreshes the TTL
        self.get(key)
    }

    fn can_cache(&self) -> bool {
        true
    }
}

struct SniEntry {
    fingerprint: i64,
    config: Arc<ServerConfig>,
}

/// Resolves an SNI name to a rustls config, caching per process
pub struct TlsManager<S: KeyStore> {
    zones: Arc<ZoneStore<S>>,
    certs: Arc<CertManager<S>>,
    provider: Arc<CryptoProvider>,
    session_store: Arc<ClusterSessionStore<S>>,
    default_config: Arc<ServerConfig>,
    sni_cache: RwLock<HashMap<String, SniEntry>>,
}

impl<S: KeyStore + Clone + 'static> TlsManager<S> {
    pub fn new(
        store: S,
        zones: Arc<ZoneStore<S>>,
        certs: Arc<CertManager<S>>,
        config: &Config,
    ) -> Result<Self> {
        let provider = Arc::new(provider_with_ciphers(
            config.public.https.ciphers.as_deref(),
        ));
        let session_store = Arc::new(ClusterSessionStore::new(
            store,
            tokio::runtime::Handle::current(),
        ));

        let default_config = match (&config.public.https.cert, &config.public.https.key) {
            (Some(cert_path), Some(key_path)) => {
                let cert_pem = std::fs::read_to_string(cert_path)?;
                let key_pem = std::fs::read_to_string(key_path)?;
                build_config(&provider, &session_store, &cert_pem, &key_pem)?
            }
            _ => self_signed_config(&provider, &session_store)?,
        };

        Ok(Self {
            zones,
            certs,
            provider,
            session_store,
            default_config,
            sni_cache: RwLock::new(HashMap::new()),
        })
    }

    /// The fallback config served to unknown names
    pub fn default_config(&self) -> Arc<ServerConfig> {
        self.default_config.clone()
    }

    /// Config for an SNI servername: names without a URL record or without
    /// an obtainable certificate fall back to the default context. Cached
    /// entries are reused while the certificate expiry fingerprint holds.
    pub async fn config_for(&self, server_name: Option<&str>) -> Arc<ServerConfig> {
        let Some(name) = server_name.map(str::to_lowercase) else {
            return self.default_config();
        };

        let routed = match self.zones.resolve(&name, RecordType::URL, true).await {
            Ok(records) => !records.is_empty(),
            Err(err) => {
                tracing::warn!("URL lookup for SNI {} failed: {}", name, err);
                false
            }
        };
        if !routed {
            return self.default_config();
        }

        let cert = match self.certs.load_certificate(&name).await {
            Ok(Some(cert)) => cert,
            Ok(None) => return self.default_config(),
            Err(err) => {
                tracing::warn!("certificate load for SNI {} failed: {}", name, err);
                return self.default_config();
            }
        };

        let fingerprint = cert.expires_millis();
        {
            let cache = self.sni_cache.read().await;
            if let Some(entry) = cache.get(&name) {
                if entry.fingerprint == fingerprint {
                    return entry.config.clone();
                }
            }
        }

        match self.build_for_cert(&cert) {
            Ok(config) => {
                self.sni_cache.write().await.insert(
                    name,
                    SniEntry {
                        fingerprint,
                        config: config.clone(),
                    },
                );
                config
            }
            Err(err) => {
                tracing::warn!("building TLS context for {} failed: {}", name, err);
                self.default_config()
            }
        }
    }

    fn build_for_cert(&self, cert: &CertData) -> Result<Arc<ServerConfig>> {
        build_config(&self.provider, &self.session_store, &cert.chain, &cert.key)
    }
}

/// The ring provider, optionally narrowed to the operator's cipher list
fn provider_with_ciphers(ciphers: Option<&str>) -> CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(list) = ciphers {
        let wanted: Vec<String> = list
            .split([':', ','])
            .map(|name| name.trim().to_uppercase().replace('-', "_"))
            .filter(|name| !name.is_empty())
            .collect();
        if !wanted.is_empty() {
            let filtered: Vec<_> = provider
                .cipher_suites
                .iter()
                .copied()
                .filter(|suite| {
                    let name = format!("{:?}", suite.suite());
                    wanted.iter().any(|want| name.contains(want))
                })
                .collect();
            if filtered.is_empty() {
                tracing::warn!("cipher list matched nothing, keeping defaults");
            } else {
                provider.cipher_suites = filtered;
            }
        }
    }
    provider
}

fn build_config<S: KeyStore + Clone + 'static>(
    provider: &Arc<CryptoProvider>,
    sessions: &Arc<ClusterSessionStore<S>>,
    cert_pem: &str,
    key_pem: &str,
) -> Result<Arc<ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| DnsError::tls(format!("bad certificate chain: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| DnsError::tls(format!("bad private key: {}", e)))?
        .ok_or_else(|| DnsError::tls("no private key in PEM"))?;

    finish_config(provider, sessions, certs, key)
}

fn self_signed_config<S: KeyStore + Clone + 'static>(
    provider: &Arc<CryptoProvider>,
    sessions: &Arc<ClusterSessionStore<S>>,
) -> Result<Arc<ServerConfig>> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| DnsError::tls(e.to_string()))?;
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| DnsError::tls(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| DnsError::tls(e.to_string()))?;

    let certs = vec![cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    finish_config(provider, sessions, certs, key)
}

fn finish_config<S: KeyStore + Clone + 'static>(
    provider: &Arc<CryptoProvider>,
    sessions: &Arc<ClusterSessionStore<S>>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| DnsError::tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| DnsError::tls(e.to_string()))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config.session_storage = sessions.clone();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_key_format() {
        let key = ClusterSessionStore::<Arc<crate::store::MemoryStore>>::ticket_key(&[0xab, 0xcd]);
        assert_eq!(key, "d:tls:abcd");
    }

    #[test]
    fn test_provider_cipher_filter() {
        let provider = provider_with_ciphers(Some("TLS13_AES_128_GCM_SHA256"));
        assert_eq!(provider.cipher_suites.len(), 1);

        // an unmatched list keeps the defaults rather than an empty set
        let fallback = provider_with_ciphers(Some("NOT_A_SUITE"));
        assert!(!fallback.cipher_suites.is_empty());

        let unfiltered = provider_with_ciphers(None);
        assert!(unfiltered.cipher_suites.len() >= fallback.cipher_suites.len());
    }
}
