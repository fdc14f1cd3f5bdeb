//! Certificate manager. Issues and caches TLS certificates through ACME
//! dns-01, publishing challenges into our own zones and verifying them
//! against our own nameservers. Certificate material and the ACME account
//! live in the key store; issuance is serialized per domain set with a
//! store-backed lock and failed attempts leave a cooldown key behind.

use futures::StreamExt;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use md5::{Digest, Md5};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::challenge::Dns01Publisher;
use super::lock::StoreLock;
use crate::config::Config;
use crate::error::{DnsError, Result};
use crate::resolver::{CachedResolver, ResolveOpts};
use crate::store::KeyStore;
use crate::zone::ZoneStore;
use crate::zone::name::normalize_domain;

/// Certificates are renewed once less than this much validity remains
const RENEW_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);

/// Lock lease and wait window for one issuance
const LOCK_LEASE: Duration = Duration::from_secs(180);
const LOCK_WAIT: Duration = Duration::from_secs(180);

/// Back-off after a failed issuance
const FAILURE_COOLDOWN: Duration = Duration::from_secs(3600);

/// Issued certificate material and metadata
#[derive(Debug, Clone)]
pub struct CertData {
    /// Private key PEM
    pub key: String,
    /// Leaf certificate PEM
    pub cert: String,
    /// Full chain PEM
    pub chain: String,
    /// Not-before, ISO timestamp
    pub valid_from: String,
    /// Not-after, ISO timestamp
    pub expires: String,
    /// Subject alternative names
    pub dns_names: Vec<String>,
    pub issuer: String,
}

impl CertData {
    /// Expiry as epoch milliseconds; 0 when unparseable
    pub fn expires_millis(&self) -> i64 {
        self.expires
            .parse::<jiff::Timestamp>()
            .map(|ts| ts.as_millisecond())
            .unwrap_or(0)
    }
}

/// ACME-backed certificate manager
pub struct CertManager<S: KeyStore> {
    store: S,
    zones: Arc<ZoneStore<S>>,
    resolver: Arc<CachedResolver<S>>,
    publisher: Dns01Publisher<S>,
    lock: StoreLock<S>,
    config: Arc<Config>,
    account: OnceCell<Account>,
}

impl<S: KeyStore + Clone + 'static> CertManager<S> {
    pub fn new(
        store: S,
        zones: Arc<ZoneStore<S>>,
        resolver: Arc<CachedResolver<S>>,
        config: Arc<Config>,
    ) -> Self {
        let ns_ips = config.ns.iter().map(|ns| ns.ip).collect();
        Self {
            publisher: Dns01Publisher::new(zones.clone(), ns_ips),
            lock: StoreLock::new(store.clone()),
            store,
            zones,
            resolver,
            config,
            account: OnceCell::new(),
        }
    }

    /// Fetch (or issue) a certificate covering `domains`. Inadmissible
    /// names are silently dropped; a cached certificate is returned while
    /// it has more than the renewal window left. Below the window the
    /// cached certificate is returned immediately and renewal continues in
    /// the background.
    pub async fn get_certificate(self: &Arc<Self>, domains: &[String], force: bool) -> Result<CertData> {
        let admissible = self.admissible_domains(domains).await?;
        if admissible.is_empty() {
            return Err(DnsError::acme("No valid domain names provided"));
        }

        let hash = cache_hash(&admissible);
        let storage_key = format!("d:acme:keys:{}", hash);
        let now = jiff::Timestamp::now().as_millisecond();

        if !force {
            if let Some(cached) = self.load_cached(&storage_key).await? {
                let expires = cached.expires_millis();
                if expires > now + RENEW_WINDOW.as_millis() as i64 {
                    return Ok(cached);
                }
                if expires > now {
                    let this = self.clone();
                    let renew_domains = admissible.clone();
                    let renew_hash = hash.clone();
                    tokio::spawn(async move {
                        if let Err(err) = this.issue_locked(&renew_domains, &renew_hash, false).await
                        {
                            tracing::warn!("background renewal failed: {}", err);
                        }
                    });
                    return Ok(cached);
                }
            }
        }

        self.issue_locked(&admissible, &hash, force).await
    }

    /// Certificate pair to serve for an SNI name: the apex and its
    /// wildcard for apex requests, the parent and its wildcard otherwise.
    /// Returns `None` when the name maps to no served zone or issuance is
    /// not possible right now.
    pub async fn load_certificate(self: &Arc<Self>, domain: &str) -> Result<Option<CertData>> {
        let Some(norm) = normalize_domain(domain) else {
            return Ok(None);
        };
        let Some(zone) = self.zones.resolve_zone(&norm).await? else {
            return Ok(None);
        };
        let base = if norm == zone {
            norm
        } else {
            match norm.split_once('.') {
                Some((_, parent)) => parent.to_string(),
                None => norm,
            }
        };
        let domains = vec![base.clone(), format!("*.{}", base)];
        match self.get_certificate(&domains, false).await {
            Ok(cert) => Ok(Some(cert)),
            Err(err) => {
                tracing::warn!("no certificate for {}: {}", domain, err);
                Ok(None)
            }
        }
    }

    /// Drop domains we are not authoritative for. A name is admissible
    /// when it maps to a stored zone whose public NS delegation points at
    /// our configured nameservers (a subset match, with at least one).
    async fn admissible_domains(&self, domains: &[String]) -> Result<Vec<String>> {
        let mut admissible = BTreeSet::new();
        for domain in domains {
            let Some(norm) = normalize_domain(domain) else {
                tracing::debug!("dropping malformed domain {}", domain);
                continue;
            };
            let base = norm.trim_start_matches("*.").to_string();
            let Some(zone) = self.zones.resolve_zone(&base).await? else {
                tracing::debug!("dropping {}: no matching zone", norm);
                continue;
            };
            if !self.check_ns_status(&zone).await {
                tracing::debug!("dropping {}: NS delegation mismatch for {}", norm, zone);
                continue;
            }
            admissible.insert(norm);
        }
        Ok(admissible.into_iter().collect())
    }

    /// Whether the public NS delegation of a zone matches our configured
    /// nameserver set: at least one of ours, and no foreign entries.
    async fn check_ns_status(&self, zone: &str) -> bool {
        let configured: BTreeSet<String> = self
            .config
            .ns
            .iter()
            .filter_map(|ns| normalize_domain(&ns.domain))
            .collect();

        let delegated = match self
            .resolver
            .resolve(
                zone,
                hickory_resolver::proto::rr::RecordType::NS,
                &ResolveOpts::default(),
            )
            .await
        {
            Ok(names) => names,
            Err(err) => {
                tracing::debug!("NS lookup for {} failed: {}", zone, err);
                return false;
            }
        };

        let delegated: BTreeSet<String> = delegated
            .iter()
            .filter_map(|name| normalize_domain(name))
            .collect();
        !delegated.is_empty() && delegated.is_subset(&configured)
    }

    /// Issue under the per-domain-set lock, with cooldown and stored-cert
    /// fallback on failure.
    async fn issue_locked(
        self: &Arc<Self>,
        domains: &[String],
        hash: &str,
        force: bool,
    ) -> Result<CertData> {
        let storage_key = format!("d:acme:keys:{}", hash);
        let cooldown_key = format!("{}:lock", storage_key);

        let Some(handle) = self
            .lock
            .acquire(&format!("acme:{}", hash), LOCK_LEASE, LOCK_WAIT)
            .await?
        else {
            // someone else spent the whole window issuing; serve their result
            if let Some(cached) = self.load_cached(&storage_key).await? {
                return Ok(cached);
            }
            return Err(DnsError::timeout(format!(
                "certificate issuance for {:?} is locked",
                domains
            )));
        };

        let result = self
            .issue_inner(domains, &storage_key, &cooldown_key, force)
            .await;
        self.lock.release(handle).await?;

        match result {
            Ok(cert) => Ok(cert),
            Err(err) => {
                self.store
                    .set(&cooldown_key, b"1", Some(FAILURE_COOLDOWN))
                    .await?;
                tracing::warn!("issuance for {:?} failed: {}", domains, err);
                if let Some(cached) = self.load_cached(&storage_key).await? {
                    return Ok(cached);
                }
                Err(err)
            }
        }
    }

    async fn issue_inner(
        self: &Arc<Self>,
        domains: &[String],
        storage_key: &str,
        cooldown_key: &str,
        force: bool,
    ) -> Result<CertData> {
        // the previous holder may have issued while we waited on the lock
        if !force {
            if let Some(cached) = self.load_cached(storage_key).await? {
                let now = jiff::Timestamp::now().as_millisecond();
                if cached.expires_millis() > now + RENEW_WINDOW.as_millis() as i64 {
                    return Ok(cached);
                }
            }
        }
        if self.store.exists(cooldown_key).await? {
            return Err(DnsError::acme(
                "a recent issuance failed, renewal is cooling down",
            ));
        }

        let account = self.account().await?;
        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|domain| Identifier::Dns(domain.clone()))
            .collect();
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;
        tracing::info!("ACME order for {:?}: {:?}", domains, order.state().status);

        let mut published: Vec<String> = Vec::new();
        let issue = async {
            if order.state().status == OrderStatus::Pending {
                let mut authorizations = order.authorizations();
                while let Some(result) = authorizations.next().await {
                    let mut authz = result?;
                    match authz.status {
                        AuthorizationStatus::Pending => {}
                        AuthorizationStatus::Valid => continue,
                        status => {
                            tracing::warn!("unexpected authorization status: {:?}", status);
                            continue;
                        }
                    }

                    let mut challenge = authz
                        .challenge(ChallengeType::Dns01)
                        .ok_or_else(|| DnsError::acme("no dns-01 challenge offered"))?;
                    let identifier = challenge.identifier().to_string();
                    let value = challenge.key_authorization().dns_value();

                    let (zone, prefix, host) =
                        self.publisher.challenge_location(&identifier).await?;
                    self.publisher.set(&zone, &prefix, &value).await?;
                    published.push(host.clone());

                    self.publisher.wait_propagation(&host, &value).await?;
                    challenge.set_ready().await?;
                }

                let retry = RetryPolicy::new()
                    .initial_delay(Duration::from_secs(1))
                    .backoff(1.5)
                    .timeout(Duration::from_secs(120));
                let status = order.poll_ready(&retry).await?;
                if status != OrderStatus::Ready {
                    return Err(DnsError::acme(format!("order not ready: {:?}", status)));
                }
            }

            let retry = RetryPolicy::default();
            let key_pem = order.finalize().await?;
            let chain_pem = order.poll_certificate(&retry).await?;
            parse_cert_data(key_pem, chain_pem)
        }
        .await;

        for host in published {
            if let Err(err) = self.publisher.remove(&host).await {
                tracing::debug!("challenge cleanup at {} failed: {}", host, err);
            }
        }

        let cert = issue?;
        self.persist(storage_key, &cert).await?;
        tracing::info!(
            "issued certificate for {:?}, expires {}",
            cert.dns_names,
            cert.expires
        );
        Ok(cert)
    }

    /// The per-process ACME account, loaded from the store or registered
    /// once and persisted.
    async fn account(&self) -> Result<&Account> {
        self.account
            .get_or_try_init(|| async {
                let account_key = format!("d:acme:account:{}", self.config.acme.key);
                let stored = self.store.hget(&account_key, "account").await?;

                if let Some(raw) = stored {
                    let credentials: AccountCredentials = serde_json::from_str(&raw)?;
                    let account = Account::builder()?.from_credentials(credentials).await?;
                    tracing::debug!("reusing stored ACME account {}", self.config.acme.key);
                    return Ok::<Account, DnsError>(account);
                }

                let contact = format!("mailto:{}", self.config.acme.email);
                let (account, credentials) = Account::builder()?
                    .create(
                        &NewAccount {
                            contact: &[contact.as_str()],
                            terms_of_service_agreed: true,
                            only_return_existing: false,
                        },
                        self.config.acme.directory_url.clone(),
                        None,
                    )
                    .await?;

                self.store
                    .hset_multi(
                        &account_key,
                        &[
                            ("account".to_string(), serde_json::to_string(&credentials)?),
                            ("created".to_string(), jiff::Timestamp::now().to_string()),
                        ],
                    )
                    .await?;
                tracing::info!("registered ACME account {}", self.config.acme.key);
                Ok(account)
            })
            .await
    }

    /// Cached certificate under a storage key, if complete
    async fn load_cached(&self, storage_key: &str) -> Result<Option<CertData>> {
        let fields = self.store.hget_all(storage_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let get = |name: &str| fields.get(name).cloned();
        let (Some(key), Some(cert), Some(chain), Some(valid_from), Some(expires)) = (
            get("key"),
            get("cert"),
            get("chain"),
            get("validFrom"),
            get("expires"),
        ) else {
            return Ok(None);
        };
        let dns_names = get("dnsNames")
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Ok(Some(CertData {
            key,
            cert,
            chain,
            valid_from,
            expires,
            dns_names,
            issuer: get("issuer").unwrap_or_default(),
        }))
    }

    /// Persist certificate material; the key expires with the certificate
    async fn persist(&self, storage_key: &str, cert: &CertData) -> Result<()> {
        let now = jiff::Timestamp::now();
        let fields = vec![
            ("key".to_string(), cert.key.clone()),
            ("cert".to_string(), cert.cert.clone()),
            ("chain".to_string(), cert.chain.clone()),
            ("validFrom".to_string(), cert.valid_from.clone()),
            ("expires".to_string(), cert.expires.clone()),
            (
                "dnsNames".to_string(),
                serde_json::to_string(&cert.dns_names)?,
            ),
            ("issuer".to_string(), cert.issuer.clone()),
            ("lastCheck".to_string(), now.to_string()),
            ("created".to_string(), now.to_string()),
            ("status".to_string(), "valid".to_string()),
        ];
        self.store.hset_multi(storage_key, &fields).await?;

        let remaining = cert.expires_millis() - now.as_millisecond();
        if remaining > 0 {
            self.store
                .expire(storage_key, Duration::from_millis(remaining as u64))
                .await?;
        }
        Ok(())
    }
}

/// Cache key for a sorted domain set
fn cache_hash(domains: &[String]) -> String {
    let mut hasher = Md5::new();
    hasher.update(domains.join(":").as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract metadata from the issued chain
fn parse_cert_data(key_pem: String, chain_pem: String) -> Result<CertData> {
    let blocks = pem::parse_many(chain_pem.as_bytes())
        .map_err(|e| DnsError::tls(format!("bad certificate chain: {}", e)))?;
    let leaf = blocks
        .iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .ok_or_else(|| DnsError::tls("no certificate in chain"))?;

    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.contents())
        .map_err(|e| DnsError::tls(format!("unparseable certificate: {}", e)))?;

    let valid_from = jiff::Timestamp::from_second(parsed.validity().not_before.timestamp())
        .map_err(|e| DnsError::tls(e.to_string()))?;
    let expires = jiff::Timestamp::from_second(parsed.validity().not_after.timestamp())
        .map_err(|e| DnsError::tls(e.to_string()))?;

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for name in san.value.general_names.iter() {
            if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                dns_names.push(dns.to_string());
            }
        }
    }

    Ok(CertData {
        key: key_pem,
        cert: pem::encode(leaf),
        chain: chain_pem,
        valid_from: valid_from.to_string(),
        expires: expires.to_string(),
        dns_names,
        issuer: parsed.issuer().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hash_is_order_independent_after_sort() {
        let a = vec!["a.test".to_string(), "b.test".to_string()];
        assert_eq!(cache_hash(&a), cache_hash(&a.clone()));
        // callers sort before hashing; identical sets hash identically
        let joined = cache_hash(&a);
        assert_eq!(joined.len(), 32);
    }

    #[test]
    fn test_cert_data_expiry_parse() {
        let cert = CertData {
            key: String::new(),
            cert: String::new(),
            chain: String::new(),
            valid_from: "2026-01-01T00:00:00Z".to_string(),
            expires: "2026-06-01T00:00:00Z".to_string(),
            dns_names: vec![],
            issuer: String::new(),
        };
        assert!(cert.expires_millis() > 0);

        let broken = CertData {
            expires: "garbage".to_string(),
            ..cert
        };
        assert_eq!(broken.expires_millis(), 0);
    }
}
