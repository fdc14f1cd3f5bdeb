//! Configuration for the PendingDNS core
//!
//! Provides the TOML-backed configuration shared by every subsystem:
//! - DNS listener settings and answer TTL
//! - Public HTTP/HTTPS server settings and host IP lists
//! - Nameserver/SOA identity used for synthetic answers
//! - ACME account settings, upstream resolver and health-check tuning
//!
//! The REST API layer and the process supervisor consume the same file but
//! live outside this crate; only their keys are defined here.

use crate::error::{DnsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub dns: DnsSettings,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub public: PublicSettings,

    /// Authoritative nameservers of this deployment, in priority order.
    /// The first entry is the SOA primary.
    #[serde(default)]
    pub ns: Vec<NameServer>,

    #[serde(default)]
    pub soa: SoaSettings,

    #[serde(default)]
    pub acme: AcmeSettings,

    #[serde(default)]
    pub resolver: ResolverSettings,

    /// Chaos-class (`CH TXT`) answers. Only queries whose key has a
    /// non-empty configured value are answered; everything else is refused.
    #[serde(default)]
    pub chaos: HashMap<String, String>,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub redis: RedisSettings,
}

/// DNS listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_dns_port")]
    pub port: u16,

    /// TTL stamped on every answer
    #[serde(default = "default_dns_ttl")]
    pub ttl: u32,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_dns_port(),
            ttl: default_dns_ttl(),
        }
    }
}

/// REST API settings (the API server itself is an external collaborator)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_api_port(),
            enabled: default_true(),
            workers: default_workers(),
        }
    }
}

/// Public HTTP/HTTPS server settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PublicSettings {
    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub https: HttpsSettings,

    /// Addresses answered for A/AAAA queries on URL records and used as
    /// the connection targets for redirects/proxying.
    #[serde(default)]
    pub hosts: PublicHosts,

    #[serde(default)]
    pub errors: ErrorPages,
}

/// Plain HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
        }
    }
}

/// HTTPS listener with optional static TLS material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpsSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_https_port")]
    pub port: u16,

    /// PEM private key for the default (non-SNI) context
    #[serde(default)]
    pub key: Option<String>,

    /// PEM certificate chain for the default context
    #[serde(default)]
    pub cert: Option<String>,

    /// Unused with rustls; accepted for config compatibility
    #[serde(default, rename = "dhParam")]
    pub dh_param: Option<String>,

    /// Cipher suite names; when set, only matching suites are offered
    #[serde(default)]
    pub ciphers: Option<String>,
}

impl Default for HttpsSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_https_port(),
            key: None,
            cert: None,
            dh_param: None,
            ciphers: None,
        }
    }
}

/// Public host addresses advertised for URL records
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PublicHosts {
    #[serde(default, rename = "A")]
    pub a: Vec<String>,

    #[serde(default, rename = "AAAA")]
    pub aaaa: Vec<String>,
}

/// Static error page templates (inline HTML)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorPages {
    #[serde(default)]
    pub error404: Option<String>,

    #[serde(default)]
    pub error500: Option<String>,
}

/// One authoritative nameserver identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameServer {
    pub domain: String,
    pub ip: IpAddr,
}

/// SOA fields used for synthetic SOA answers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaSettings {
    #[serde(default = "default_soa_admin")]
    pub admin: String,

    #[serde(default = "default_soa_serial")]
    pub serial: u32,

    #[serde(default = "default_soa_refresh")]
    pub refresh: i32,

    #[serde(default = "default_soa_retry")]
    pub retry: i32,

    #[serde(default = "default_soa_expiration")]
    pub expiration: i32,

    #[serde(default = "default_soa_minimum")]
    pub minimum: u32,
}

impl Default for SoaSettings {
    fn default() -> Self {
        Self {
            admin: default_soa_admin(),
            serial: default_soa_serial(),
            refresh: default_soa_refresh(),
            retry: default_soa_retry(),
            expiration: default_soa_expiration(),
            minimum: default_soa_minimum(),
        }
    }
}

/// ACME account settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeSettings {
    /// Account key name; scopes the stored account credentials
    #[serde(default = "default_acme_key")]
    pub key: String,

    #[serde(default = "default_acme_directory", rename = "directoryUrl")]
    pub directory_url: String,

    /// Contact address registered with the CA. Must be a valid address;
    /// startup aborts with exit code 51 otherwise.
    #[serde(default)]
    pub email: String,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            key: default_acme_key(),
            directory_url: default_acme_directory(),
            email: String::new(),
        }
    }
}

/// Upstream resolver used for ANAME targets and NS status checks
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResolverSettings {
    /// Upstream nameserver IPs; system defaults when empty
    #[serde(default)]
    pub ns: Vec<IpAddr>,
}

/// Health checker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Number of polling loops per process
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Concurrent probes per sweep
    #[serde(default = "default_health_handlers")]
    pub handlers: usize,

    /// Probe timeout in seconds
    #[serde(default = "default_health_ttl")]
    pub ttl: u64,

    /// Seconds before a probed target becomes due again
    #[serde(default = "default_health_delay")]
    pub delay: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: default_workers(),
            handlers: default_health_handlers(),
            ttl: default_health_ttl(),
            delay: default_health_delay(),
        }
    }
}

/// Key store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_dns_port() -> u16 {
    53
}

fn default_dns_ttl() -> u32 {
    300
}

fn default_api_port() -> u16 {
    5080
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    1
}

fn default_health_handlers() -> usize {
    4
}

fn default_health_ttl() -> u64 {
    30
}

fn default_health_delay() -> u64 {
    60
}

fn default_soa_admin() -> String {
    "hostmaster".to_string()
}

fn default_soa_serial() -> u32 {
    1
}

fn default_soa_refresh() -> i32 {
    3600
}

fn default_soa_retry() -> i32 {
    600
}

fn default_soa_expiration() -> i32 {
    604800
}

fn default_soa_minimum() -> u32 {
    3600
}

fn default_acme_key() -> String {
    "default".to_string()
}

fn default_acme_directory() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DnsError::configuration(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| DnsError::configuration(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Validate cross-field requirements. ACME email validity is checked
    /// separately by [`Config::acme_email_valid`] so the binary can map it
    /// to its dedicated exit code.
    pub fn validate(&self) -> Result<()> {
        if self.ns.is_empty() {
            return Err(DnsError::configuration(
                "at least one nameserver must be configured under [[ns]]",
            ));
        }
        for host in self.public.hosts.a.iter() {
            host.parse::<std::net::Ipv4Addr>().map_err(|_| {
                DnsError::configuration(format!("public.hosts.A entry is not an IPv4: {}", host))
            })?;
        }
        for host in self.public.hosts.aaaa.iter() {
            host.parse::<std::net::Ipv6Addr>().map_err(|_| {
                DnsError::configuration(format!("public.hosts.AAAA entry is not an IPv6: {}", host))
            })?;
        }
        Ok(())
    }

    /// Whether the configured ACME contact address is usable
    pub fn acme_email_valid(&self) -> bool {
        if self.acme.email.is_empty() {
            return false;
        }
        let re = regex::Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("static regex");
        re.is_match(&self.acme.email)
    }

    /// Chaos answer for a query name, if the operator configured one
    pub fn chaos_value(&self, name: &str) -> Option<&str> {
        self.chaos
            .get(name)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.dns.port, 53);
        assert_eq!(config.dns.ttl, 300);
        assert_eq!(config.health.ttl, 30);
        assert!(!config.health.enabled);
        assert!(config.acme.directory_url.contains("letsencrypt"));
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [dns]
            host = "127.0.0.1"
            port = 5353
            ttl = 60

            [[ns]]
            domain = "ns01.pendingdns.com"
            ip = "1.2.3.4"

            [[ns]]
            domain = "ns02.pendingdns.com"
            ip = "5.6.7.8"

            [acme]
            email = "admin@example.com"

            [public.hosts]
            A = ["198.51.100.1"]

            [chaos]
            "version.bind" = "PendingDNS"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dns.port, 5353);
        assert_eq!(config.ns.len(), 2);
        assert_eq!(config.ns[0].domain, "ns01.pendingdns.com");
        assert!(config.acme_email_valid());
        assert_eq!(config.chaos_value("version.bind"), Some("PendingDNS"));
        assert_eq!(config.chaos_value("hostname.bind"), None);
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_email() {
        let mut config = Config::default();
        config.acme.email = "not-an-email".to_string();
        assert!(!config.acme_email_valid());
        config.acme.email = "ops@example.com".to_string();
        assert!(config.acme_email_valid());
    }
}
