//! Cached external resolver. ANAME targets and NS status checks go through
//! here: answers are cached in the key store with a positive floor TTL, and
//! failures leave short-lived negative entries so a flapping upstream does
//! not get hammered.

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::RecordType;
use serde_json::{Value, json};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::{DnsError, Result};
use crate::store::KeyStore;
use crate::zone::name::normalize_domain;

/// Cache tuning for external lookups
#[derive(Debug, Clone)]
pub struct ResolveOpts {
    /// Floor applied to positive answers
    pub min_ttl: Duration,
    /// Key TTL of positive cache entries
    pub max_ttl: Duration,
    /// Key TTL of negative cache entries
    pub error_ttl: Duration,
}

impl Default for ResolveOpts {
    fn default() -> Self {
        Self {
            min_ttl: Duration::from_secs(10 * 60),
            max_ttl: Duration::from_secs(8 * 60 * 60),
            error_ttl: Duration::from_secs(60),
        }
    }
}

/// Resolver for names outside our own zones, write-through cached in the
/// key store under `d:cache:<target>:<TYPE>`.
pub struct CachedResolver<S: KeyStore> {
    store: S,
    resolver: TokioAsyncResolver,
}

impl<S: KeyStore> CachedResolver<S> {
    /// Build a resolver against the configured upstreams, or the library
    /// defaults when none are configured.
    pub fn new(store: S, upstreams: &[IpAddr]) -> Self {
        let config = if upstreams.is_empty() {
            ResolverConfig::default()
        } else {
            let mut config = ResolverConfig::new();
            for ip in upstreams {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(*ip, 53),
                    Protocol::Udp,
                ));
            }
            config
        };
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());
        Self { store, resolver }
    }

    /// Resolve `target` for the requested type. Cached data is returned
    /// while fresh; a cached failure is re-thrown. On miss the upstream is
    /// queried, and when that fails a stale positive answer (if any) is
    /// served in its place.
    pub async fn resolve(
        &self,
        target: &str,
        rtype: RecordType,
        opts: &ResolveOpts,
    ) -> Result<Vec<String>> {
        let Some(target) = normalize_domain(target) else {
            return Err(DnsError::invalid_input(format!(
                "unresolvable target: {}",
                target
            )));
        };
        let cache_key = format!("d:cache:{}:{}", target, rtype);
        let now = jiff::Timestamp::now().as_millisecond();

        let mut stale: Option<Vec<String>> = None;
        if let Some(raw) = self.store.get(&cache_key).await? {
            if let Ok(entry) = serde_json::from_slice::<Value>(&raw) {
                let expires = entry.get("expires").and_then(Value::as_i64).unwrap_or(0);
                let data = entry.get("data").cloned().unwrap_or(Value::Bool(false));
                let fresh = expires > now;
                match data {
                    Value::Bool(false) => {
                        if fresh {
                            let error = entry
                                .get("error")
                                .and_then(Value::as_str)
                                .unwrap_or("cached resolution failure")
                                .to_string();
                            return Err(DnsError::external(error));
                        }
                    }
                    Value::Array(items) => {
                        let values: Vec<String> = items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect();
                        if fresh {
                            return Ok(values);
                        }
                        stale = Some(values);
                    }
                    _ => {}
                }
            }
        }

        match self.query(&target, rtype).await {
            Ok(values) => {
                let entry = json!({
                    "expires": now + opts.min_ttl.as_millis() as i64,
                    "data": values,
                });
                self.store
                    .set(&cache_key, entry.to_string().as_bytes(), Some(opts.max_ttl))
                    .await?;
                Ok(values)
            }
            Err(err) => {
                let entry = json!({
                    "expires": now + opts.error_ttl.as_millis() as i64,
                    "data": false,
                    "error": err.to_string(),
                });
                self.store
                    .set(
                        &cache_key,
                        entry.to_string().as_bytes(),
                        Some(opts.error_ttl),
                    )
                    .await?;
                match stale {
                    Some(values) => {
                        tracing::debug!("serving stale answer for {} {}: {}", target, rtype, err);
                        Ok(values)
                    }
                    None => Err(err),
                }
            }
        }
    }

    async fn query(&self, target: &str, rtype: RecordType) -> Result<Vec<String>> {
        let fqdn = format!("{}.", target);
        let external = |e: hickory_resolver::error::ResolveError| DnsError::external(e.to_string());

        let values = match rtype {
            RecordType::A => self
                .resolver
                .ipv4_lookup(fqdn)
                .await
                .map_err(external)?
                .iter()
                .map(|a| a.to_string())
                .collect(),
            RecordType::AAAA => self
                .resolver
                .ipv6_lookup(fqdn)
                .await
                .map_err(external)?
                .iter()
                .map(|aaaa| aaaa.to_string())
                .collect(),
            RecordType::PTR => {
                let ip: IpAddr = target
                    .parse()
                    .map_err(|_| DnsError::invalid_input(format!("not an address: {}", target)))?;
                self.resolver
                    .reverse_lookup(ip)
                    .await
                    .map_err(external)?
                    .iter()
                    .map(|ptr| ptr.to_string().trim_end_matches('.').to_string())
                    .collect()
            }
            RecordType::NS => self
                .resolver
                .ns_lookup(fqdn)
                .await
                .map_err(external)?
                .iter()
                .map(|ns| ns.to_string().trim_end_matches('.').to_string())
                .collect(),
            RecordType::TXT => self
                .resolver
                .txt_lookup(fqdn)
                .await
                .map_err(external)?
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                        .collect::<String>()
                })
                .collect(),
            other => self
                .resolver
                .lookup(fqdn, other)
                .await
                .map_err(external)?
                .iter()
                .map(|rdata| rdata.to_string())
                .collect(),
        };
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyStore, MemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fresh_cache_hit_skips_upstream() {
        let store = Arc::new(MemoryStore::new());
        let resolver = CachedResolver::new(store.clone(), &[]);

        let now = jiff::Timestamp::now().as_millisecond();
        let entry = json!({ "expires": now + 60_000, "data": ["192.0.2.1"] });
        store
            .set(
                "d:cache:cached.example.com:A",
                entry.to_string().as_bytes(),
                None,
            )
            .await
            .unwrap();

        let values = resolver
            .resolve("cached.example.com", RecordType::A, &ResolveOpts::default())
            .await
            .unwrap();
        assert_eq!(values, vec!["192.0.2.1".to_string()]);
    }

    #[tokio::test]
    async fn test_cached_failure_rethrows() {
        let store = Arc::new(MemoryStore::new());
        let resolver = CachedResolver::new(store.clone(), &[]);

        let now = jiff::Timestamp::now().as_millisecond();
        let entry = json!({ "expires": now + 60_000, "data": false, "error": "SERVFAIL" });
        store
            .set(
                "d:cache:down.example.com:A",
                entry.to_string().as_bytes(),
                None,
            )
            .await
            .unwrap();

        let err = resolver
            .resolve("down.example.com", RecordType::A, &ResolveOpts::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SERVFAIL"));
    }
}
