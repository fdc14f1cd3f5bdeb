//! dns-01 challenge publication. TXT records go through the zone store
//! like any other record, with a bounded TTL so stale challenges garbage
//! collect themselves, and propagation is verified against our own
//! nameserver IPs directly rather than whatever resolver the host uses.

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DnsError, Result};
use crate::store::KeyStore;
use crate::zone::name::normalize_domain;
use crate::zone::{RecordType, RecordValue, ZoneStore};

/// Challenge records expire on their own after an hour
const CHALLENGE_TTL: Duration = Duration::from_secs(3600);

/// Settle time advertised to the ACME client before the first check
pub const PROPAGATION_DELAY: Duration = Duration::from_millis(500);

/// Budget for a challenge to appear on every nameserver
const PROPAGATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Label prefix the CA queries for dns-01
const CHALLENGE_LABEL: &str = "_acme-challenge";

/// Publishes and verifies dns-01 TXT records through the zone store
pub struct Dns01Publisher<S: KeyStore> {
    zones: Arc<ZoneStore<S>>,
    ns_ips: Vec<IpAddr>,
}

impl<S: KeyStore> Dns01Publisher<S> {
    pub fn new(zones: Arc<ZoneStore<S>>, ns_ips: Vec<IpAddr>) -> Self {
        Self { zones, ns_ips }
    }

    /// Where the challenge for `domain` lives: the zone, the subdomain
    /// prefix to store, and the fully qualified challenge host.
    pub async fn challenge_location(&self, domain: &str) -> Result<(String, String, String)> {
        let Some(base) = normalize_domain(domain).map(|d| d.trim_start_matches("*.").to_string())
        else {
            return Err(DnsError::invalid_input(format!("bad domain: {}", domain)));
        };
        let Some(zone) = self.zones.resolve_zone(&base).await? else {
            return Err(DnsError::not_found(format!("no zone for {}", base)));
        };

        let host = format!("{}.{}", CHALLENGE_LABEL, base);
        let prefix = if base == zone {
            CHALLENGE_LABEL.to_string()
        } else {
            let relative = base
                .strip_suffix(&zone)
                .map(|s| s.trim_end_matches('.'))
                .unwrap_or_default();
            format!("{}.{}", CHALLENGE_LABEL, relative)
        };
        Ok((zone, prefix, host))
    }

    /// Publish a challenge TXT record with the bounded TTL
    pub async fn set(&self, dns_zone: &str, dns_prefix: &str, authorization: &str) -> Result<()> {
        let stored = self
            .zones
            .add(
                dns_zone,
                dns_prefix,
                RecordType::TXT,
                &json!([authorization]),
                Some(CHALLENGE_TTL),
            )
            .await?;
        if stored.is_none() {
            return Err(DnsError::acme(format!(
                "could not publish challenge under {} / {}",
                dns_zone, dns_prefix
            )));
        }
        tracing::info!("published dns-01 challenge for {}.{}", dns_prefix, dns_zone);
        Ok(())
    }

    /// First stored challenge value at a host, if any
    pub async fn get(&self, dns_host: &str) -> Result<Option<String>> {
        let records = self.zones.resolve(dns_host, RecordType::TXT, true).await?;
        Ok(records.into_iter().find_map(|record| match record.value {
            RecordValue::Txt { data } => Some(data),
            _ => None,
        }))
    }

    /// Remove every challenge record at a host
    pub async fn remove(&self, dns_host: &str) -> Result<usize> {
        let removed = self
            .zones
            .delete_by_domain(dns_host, RecordType::TXT, None)
            .await?;
        if removed > 0 {
            tracing::debug!("removed {} challenge record(s) at {}", removed, dns_host);
        }
        Ok(removed)
    }

    /// Unique set of zones a list of hosts resolves into
    pub async fn zones_for(&self, dns_hosts: &[String]) -> Result<Vec<String>> {
        let mut zones = Vec::new();
        for host in dns_hosts {
            let (zone, _, _) = self.challenge_location(host).await?;
            if !zones.contains(&zone) {
                zones.push(zone);
            }
        }
        Ok(zones)
    }

    /// Wait until every one of our nameservers serves the expected value
    /// for the challenge host. Queries go to the NS IPs directly.
    pub async fn wait_propagation(&self, dns_host: &str, expected: &str) -> Result<()> {
        tokio::time::sleep(PROPAGATION_DELAY).await;

        let start = std::time::Instant::now();
        let mut delay = Duration::from_secs(2);
        loop {
            let mut confirmed = 0usize;
            for ip in self.ns_ips.iter() {
                match query_txt(dns_host, *ip).await {
                    Ok(values) if values.iter().any(|v| v == expected) => confirmed += 1,
                    Ok(_) => {
                        tracing::trace!("challenge not yet visible on {}", ip);
                    }
                    Err(err) => {
                        tracing::trace!("challenge query on {} failed: {}", ip, err);
                    }
                }
            }
            if confirmed == self.ns_ips.len() && confirmed > 0 {
                tracing::debug!("challenge for {} visible on all nameservers", dns_host);
                return Ok(());
            }

            if start.elapsed() >= PROPAGATION_TIMEOUT {
                return Err(DnsError::timeout(format!(
                    "challenge for {} did not propagate",
                    dns_host
                )));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(10));
        }
    }
}

/// One-shot TXT query against a single nameserver
async fn query_txt(host: &str, ns: IpAddr) -> Result<Vec<String>> {
    let mut config = ResolverConfig::new();
    config.add_name_server(NameServerConfig::new(
        SocketAddr::new(ns, 53),
        Protocol::Udp,
    ));

    let mut opts = ResolverOpts::default();
    opts.timeout = Duration::from_secs(5);
    opts.attempts = 1;

    let resolver = TokioAsyncResolver::tokio(config, opts);
    let response = resolver
        .txt_lookup(format!("{}.", host))
        .await
        .map_err(|e| DnsError::external(e.to_string()))?;

    Ok(response
        .iter()
        .map(|txt| {
            txt.txt_data()
                .iter()
                .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                .collect::<String>()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn publisher() -> Dns01Publisher<Arc<MemoryStore>> {
        let store = Arc::new(MemoryStore::new());
        let zones = Arc::new(ZoneStore::new(store));
        zones
            .add("example.com", "", RecordType::A, &json!(["192.0.2.1"]), None)
            .await
            .unwrap();
        Dns01Publisher::new(zones, vec![])
    }

    #[tokio::test]
    async fn test_challenge_location_apex() {
        let publisher = publisher().await;
        let (zone, prefix, host) = publisher.challenge_location("example.com").await.unwrap();
        assert_eq!(zone, "example.com");
        assert_eq!(prefix, "_acme-challenge");
        assert_eq!(host, "_acme-challenge.example.com");
    }

    #[tokio::test]
    async fn test_challenge_location_subdomain_and_wildcard() {
        let publisher = publisher().await;
        let (zone, prefix, host) = publisher
            .challenge_location("www.example.com")
            .await
            .unwrap();
        assert_eq!(zone, "example.com");
        assert_eq!(prefix, "_acme-challenge.www");
        assert_eq!(host, "_acme-challenge.www.example.com");

        // a wildcard authorization targets its base domain
        let (_, prefix, host) = publisher
            .challenge_location("*.example.com")
            .await
            .unwrap();
        assert_eq!(prefix, "_acme-challenge");
        assert_eq!(host, "_acme-challenge.example.com");
    }

    #[tokio::test]
    async fn test_set_get_remove_roundtrip() {
        let publisher = publisher().await;
        publisher
            .set("example.com", "_acme-challenge", "token-value")
            .await
            .unwrap();

        let value = publisher
            .get("_acme-challenge.example.com")
            .await
            .unwrap();
        assert_eq!(value, Some("token-value".to_string()));

        let removed = publisher
            .remove("_acme-challenge.example.com")
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            publisher.get("_acme-challenge.example.com").await.unwrap(),
            None
        );
    }
}
