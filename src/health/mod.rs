//! Background health checker. Worker loops pop due targets from the shared
//! sorted-set queue (one worker per target per cycle, across processes),
//! probe the configured endpoint and persist the outcome, but only when
//! the status actually transitions.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::HealthSettings;
use crate::error::{DnsError, Result};
use crate::store::KeyStore;
use crate::zone::name::record_key;
use crate::zone::record::parse_id;
use crate::zone::{HEALTH_QUEUE_KEY, HEALTH_RESULTS_KEY, HealthState, RecordValue};

/// Pause between sweeps, and the longer pause after a sweep error
const SWEEP_PAUSE: Duration = Duration::from_secs(10);
const ERROR_PAUSE: Duration = Duration::from_secs(30);

/// Certificate checks are intentionally skipped: a probe asks "is the
/// endpoint alive", not "is its certificate in order".
mod danger {
    use rustls::DigitallySignedStruct;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};

    #[derive(Debug)]
    pub struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

/// Health checker over a shared key store
pub struct HealthChecker<S: KeyStore> {
    store: S,
    config: HealthSettings,
    http: reqwest::Client,
    tls: tokio_rustls::TlsConnector,
}

impl<S: KeyStore + 'static> HealthChecker<S> {
    pub fn new(store: S, config: HealthSettings) -> Result<Self> {
        let timeout = Duration::from_secs(config.ttl.max(1));
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .map_err(|e| DnsError::external(format!("probe client: {}", e)))?;

        let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| DnsError::tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoVerification))
        .with_no_client_auth();
        let tls = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

        Ok(Self {
            store,
            config,
            http,
            tls,
        })
    }

    /// Spawn the configured number of worker loops
    pub fn spawn(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|worker| {
                let this = self.clone();
                tokio::spawn(async move { this.run_loop(worker).await })
            })
            .collect()
    }

    async fn run_loop(self: Arc<Self>, worker: usize) {
        tracing::info!("health worker {} started", worker);
        loop {
            match self.clone().sweep().await {
                Ok(checked) => {
                    if checked > 0 {
                        tracing::debug!("health worker {} probed {} targets", worker, checked);
                    }
                    tokio::time::sleep(SWEEP_PAUSE).await;
                }
                Err(err) => {
                    tracing::warn!("health worker {} sweep failed: {}", worker, err);
                    tokio::time::sleep(ERROR_PAUSE).await;
                }
            }
        }
    }

    /// Drain everything currently due, probing with bounded concurrency
    async fn sweep(self: Arc<Self>) -> Result<usize> {
        let delay_ms = (self.config.delay.max(1) * 1000) as i64;
        let semaphore = Arc::new(Semaphore::new(self.config.handlers.max(1)));
        let mut tasks = JoinSet::new();
        let mut checked = 0usize;

        loop {
            let now = jiff::Timestamp::now().as_millisecond();
            let Some(member) = self
                .store
                .pop_due(HEALTH_QUEUE_KEY, now, now + delay_ms)
                .await?
            else {
                break;
            };
            checked += 1;

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let this = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(err) = this.check_member(&member).await {
                    tracing::debug!("health check for {} failed: {}", member, err);
                }
            });
        }

        while tasks.join_next().await.is_some() {}
        Ok(checked)
    }

    /// Probe one queue member and persist the outcome on transition
    pub async fn check_member(&self, member: &str) -> Result<()> {
        let Some((_zone, id)) = member.split_once(':') else {
            self.drop_member(member).await?;
            return Ok(());
        };
        let Some((rev_name, rtype, hid)) = parse_id(id) else {
            self.drop_member(member).await?;
            return Ok(());
        };

        let key = record_key(&rev_name, &rtype.to_string());
        let Some(raw) = self.store.hget(&key, &hid).await? else {
            self.drop_member(member).await?;
            return Ok(());
        };
        let uri = serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|json| RecordValue::from_json(rtype, &json))
            .and_then(|value| value.health_check_uri().map(str::to_string));
        let Some(uri) = uri else {
            self.drop_member(member).await?;
            return Ok(());
        };

        let state = self.probe(&uri).await;
        self.persist(member, state).await
    }

    /// Remove a queue member whose record no longer warrants checking
    async fn drop_member(&self, member: &str) -> Result<()> {
        self.store.zrem(HEALTH_QUEUE_KEY, member).await?;
        self.store.hdel(HEALTH_RESULTS_KEY, member).await?;
        Ok(())
    }

    async fn persist(&self, member: &str, state: HealthState) -> Result<()> {
        let previous = self
            .store
            .hget(HEALTH_RESULTS_KEY, member)
            .await?
            .and_then(|raw| serde_json::from_str::<HealthState>(&raw).ok());

        if previous.as_ref().map(|p| p.status) == Some(state.status) {
            tracing::trace!("health status for {} unchanged ({})", member, state.status);
            return Ok(());
        }

        tracing::info!(
            "health status for {} transitioned to {}{}",
            member,
            state.status,
            state
                .error
                .as_deref()
                .map(|e| format!(" ({})", e))
                .unwrap_or_default()
        );
        self.store
            .hset(
                HEALTH_RESULTS_KEY,
                member,
                &serde_json::to_string(&state)?,
            )
            .await?;
        Ok(())
    }

    /// Run a single probe against a health check URI
    pub async fn probe(&self, uri: &str) -> HealthState {
        let timeout = Duration::from_secs(self.config.ttl.max(1));
        let result = tokio::time::timeout(timeout, self.probe_inner(uri)).await;
        match result {
            Ok(state) => state,
            Err(_) => HealthState {
                status: false,
                error: Some("timeout".to_string()),
                code: None,
            },
        }
    }

    async fn probe_inner(&self, uri: &str) -> HealthState {
        let Some((scheme, rest)) = uri.split_once("://") else {
            return HealthState {
                status: false,
                error: Some(format!("unsupported health check URI: {}", uri)),
                code: None,
            };
        };

        match scheme {
            "tcp" | "tcps" => self.probe_tcp(scheme, rest).await,
            "http" | "https" => self.probe_http(uri).await,
            other => HealthState {
                status: false,
                error: Some(format!("unsupported health check scheme: {}", other)),
                code: None,
            },
        }
    }

    async fn probe_tcp(&self, scheme: &str, rest: &str) -> HealthState {
        let target = rest.split('/').next().unwrap_or(rest);
        let stream = match TcpStream::connect(target).await {
            Ok(stream) => stream,
            Err(err) => {
                return HealthState {
                    status: false,
                    error: Some(err.to_string()),
                    code: None,
                };
            }
        };

        if scheme == "tcps" {
            let host = target.rsplit_once(':').map(|(h, _)| h).unwrap_or(target);
            let server_name = match rustls::pki_types::ServerName::try_from(host.to_string()) {
                Ok(name) => name,
                Err(err) => {
                    return HealthState {
                        status: false,
                        error: Some(err.to_string()),
                        code: None,
                    };
                }
            };
            if let Err(err) = self.tls.connect(server_name, stream).await {
                return HealthState {
                    status: false,
                    error: Some(err.to_string()),
                    code: None,
                };
            }
        }

        HealthState {
            status: true,
            error: None,
            code: None,
        }
    }

    async fn probe_http(&self, uri: &str) -> HealthState {
        match self.http.get(uri).send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                HealthState {
                    status: (200..300).contains(&code),
                    error: None,
                    code: Some(code),
                }
            }
            Err(err) => HealthState {
                status: false,
                error: Some(err.to_string()),
                code: err.status().map(|s| s.as_u16()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyStore, MemoryStore};
    use crate::zone::{ZoneStore, health_member};
    use serde_json::json;

    fn checker(store: Arc<MemoryStore>) -> HealthChecker<Arc<MemoryStore>> {
        let config = HealthSettings {
            enabled: true,
            workers: 1,
            handlers: 2,
            ttl: 2,
            delay: 60,
        };
        HealthChecker::new(store, config).unwrap()
    }

    #[tokio::test]
    async fn test_probe_closed_tcp_port() {
        let store = Arc::new(MemoryStore::new());
        let state = checker(store).probe("tcp://127.0.0.1:1").await;
        assert!(!state.status);
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn test_probe_open_tcp_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let store = Arc::new(MemoryStore::new());
        let state = checker(store).probe(&format!("tcp://{}", addr)).await;
        assert!(state.status);
    }

    #[tokio::test]
    async fn test_check_member_marks_closed_port_down() {
        let store = Arc::new(MemoryStore::new());
        let zones = ZoneStore::new(store.clone());
        let id = zones
            .add(
                "example.com",
                "",
                crate::zone::RecordType::A,
                &json!(["127.0.0.1", "tcp://127.0.0.1:1"]),
                None,
            )
            .await
            .unwrap()
            .unwrap();

        let member = health_member("com.example", &id);
        checker(store.clone()).check_member(&member).await.unwrap();

        let records = zones
            .resolve("example.com", crate::zone::RecordType::A, false)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].health.as_ref().map(|h| h.status), Some(false));
    }

    #[tokio::test]
    async fn test_stale_member_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        store
            .zadd(HEALTH_QUEUE_KEY, "com.example:bogus-id", 0)
            .await
            .unwrap();

        checker(store.clone())
            .check_member("com.example:bogus-id")
            .await
            .unwrap();

        let due = store
            .pop_due(HEALTH_QUEUE_KEY, i64::MAX, i64::MAX)
            .await
            .unwrap();
        assert_eq!(due, None);
    }
}
