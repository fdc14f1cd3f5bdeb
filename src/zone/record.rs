//! Record types, stored value tuples and external record ids.
//!
//! Values are persisted as JSON arrays whose shape depends on the record
//! type, one hash field per record keyed by a short random `hid`. The
//! external id is the URL-safe base64 of `reversed-name \x01 TYPE \x01 hid`
//! and round-trips byte-exact.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;

/// Separator between id components
const ID_SEPARATOR: char = '\x01';

/// Record types served by the zone store, including the two pseudo-types
/// (ANAME, URL) that never appear on the wire verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    A,
    AAAA,
    CNAME,
    ANAME,
    MX,
    TXT,
    CAA,
    NS,
    URL,
}

/// Sort order used by `list`
pub const LIST_ORDER: [RecordType; 9] = [
    RecordType::A,
    RecordType::AAAA,
    RecordType::ANAME,
    RecordType::CNAME,
    RecordType::MX,
    RecordType::TXT,
    RecordType::CAA,
    RecordType::URL,
    RecordType::NS,
];

impl RecordType {
    /// Position in the `list` ordering
    pub fn sort_rank(&self) -> usize {
        LIST_ORDER
            .iter()
            .position(|t| t == self)
            .unwrap_or(LIST_ORDER.len())
    }

    /// Whether values of this type may carry a health check URI
    pub fn health_checkable(&self) -> bool {
        matches!(self, RecordType::A | RecordType::AAAA)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
            RecordType::CNAME => "CNAME",
            RecordType::ANAME => "ANAME",
            RecordType::MX => "MX",
            RecordType::TXT => "TXT",
            RecordType::CAA => "CAA",
            RecordType::NS => "NS",
            RecordType::URL => "URL",
        };
        f.write_str(name)
    }
}

impl FromStr for RecordType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::AAAA),
            "CNAME" => Ok(RecordType::CNAME),
            "ANAME" => Ok(RecordType::ANAME),
            "MX" => Ok(RecordType::MX),
            "TXT" => Ok(RecordType::TXT),
            "CAA" => Ok(RecordType::CAA),
            "NS" => Ok(RecordType::NS),
            "URL" => Ok(RecordType::URL),
            _ => Err(()),
        }
    }
}

/// CAA property tags accepted by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaaTag {
    Issue,
    IssueWild,
    Iodef,
}

impl fmt::Display for CaaTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            CaaTag::Issue => "issue",
            CaaTag::IssueWild => "issuewild",
            CaaTag::Iodef => "iodef",
        };
        f.write_str(tag)
    }
}

impl FromStr for CaaTag {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "issue" => Ok(CaaTag::Issue),
            "issuewild" => Ok(CaaTag::IssueWild),
            "iodef" => Ok(CaaTag::Iodef),
            _ => Err(()),
        }
    }
}

/// Typed record value, mirroring the stored JSON tuples
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    /// A/AAAA: address plus optional health check URI
    Address {
        address: String,
        health_check: Option<String>,
    },
    /// CNAME/ANAME target; `@` denotes the zone apex
    Target { target: String },
    /// MX exchange with priority 1..=255
    Mx { exchange: String, priority: u8 },
    /// TXT payload, at most 512 bytes
    Txt { data: String },
    /// CAA property
    Caa {
        value: String,
        tag: CaaTag,
        flags: u8,
    },
    /// Delegation target
    Ns { ns: String },
    /// URL pseudo-record: redirect target, status code and proxy flag
    Url {
        url: String,
        code: u16,
        proxy: bool,
    },
}

/// Redirect status codes the URL record accepts
const REDIRECT_CODES: [u16; 5] = [301, 302, 303, 307, 308];

impl RecordValue {
    /// Parse a stored JSON tuple for the given record type
    pub fn from_json(rtype: RecordType, value: &Value) -> Option<RecordValue> {
        let parts = value.as_array()?;
        let text = |idx: usize| parts.get(idx).and_then(Value::as_str).map(str::to_string);

        match rtype {
            RecordType::A | RecordType::AAAA => Some(RecordValue::Address {
                address: text(0)?,
                health_check: parts
                    .get(1)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            }),
            RecordType::CNAME | RecordType::ANAME => Some(RecordValue::Target { target: text(0)? }),
            RecordType::MX => {
                let priority = parts.get(1).and_then(Value::as_u64)?;
                if !(1..=255).contains(&priority) {
                    return None;
                }
                Some(RecordValue::Mx {
                    exchange: text(0)?,
                    priority: priority as u8,
                })
            }
            RecordType::TXT => {
                let data = text(0)?;
                if data.len() > 512 {
                    return None;
                }
                Some(RecordValue::Txt { data })
            }
            RecordType::CAA => {
                let tag = text(1)?.parse().ok()?;
                let flags = parts.get(2).and_then(Value::as_u64).unwrap_or(0);
                Some(RecordValue::Caa {
                    value: text(0)?,
                    tag,
                    flags: flags.min(255) as u8,
                })
            }
            RecordType::NS => Some(RecordValue::Ns { ns: text(0)? }),
            RecordType::URL => {
                let code = parts.get(1).and_then(Value::as_u64).unwrap_or(301) as u16;
                if !REDIRECT_CODES.contains(&code) {
                    return None;
                }
                Some(RecordValue::Url {
                    url: text(0)?,
                    code,
                    proxy: parts.get(2).and_then(Value::as_bool).unwrap_or(false),
                })
            }
        }
    }

    /// Serialize to the stored JSON tuple
    pub fn to_json(&self) -> Value {
        match self {
            RecordValue::Address {
                address,
                health_check,
            } => match health_check {
                Some(uri) => json!([address, uri]),
                None => json!([address, null]),
            },
            RecordValue::Target { target } => json!([target]),
            RecordValue::Mx { exchange, priority } => json!([exchange, priority]),
            RecordValue::Txt { data } => json!([data]),
            RecordValue::Caa { value, tag, flags } => json!([value, tag.to_string(), flags]),
            RecordValue::Ns { ns } => json!([ns]),
            RecordValue::Url { url, code, proxy } => json!([url, code, proxy]),
        }
    }

    /// Map to the named REST shape
    pub fn format(&self) -> Value {
        match self {
            RecordValue::Address {
                address,
                health_check,
            } => json!({
                "address": address,
                "healthCheck": health_check,
            }),
            RecordValue::Target { target } => json!({ "target": target }),
            RecordValue::Mx { exchange, priority } => json!({
                "exchange": exchange,
                "priority": priority,
            }),
            RecordValue::Txt { data } => json!({ "data": data }),
            RecordValue::Caa { value, tag, flags } => json!({
                "value": value,
                "tag": tag.to_string(),
                "flags": flags,
            }),
            RecordValue::Ns { ns } => json!({ "ns": ns }),
            RecordValue::Url { url, code, proxy } => json!({
                "url": url,
                "code": code,
                "proxy": proxy,
            }),
        }
    }

    /// Health check URI, when present and non-empty
    pub fn health_check_uri(&self) -> Option<&str> {
        match self {
            RecordValue::Address {
                health_check: Some(uri),
                ..
            } if !uri.is_empty() => Some(uri),
            _ => None,
        }
    }
}

/// Last known probe outcome of a health-checked address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthState {
    pub status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
}

/// A record row as returned by the zone store
#[derive(Debug, Clone)]
pub struct ZoneRecord {
    /// A-label name the record answers for; the wildcard name when the
    /// record was matched through a wildcard
    pub name: String,
    pub rtype: RecordType,
    pub value: RecordValue,
    pub hid: String,
    pub id: String,
    /// Omitted in short mode
    pub zone: Option<String>,
    /// Omitted in short mode
    pub subdomain: Option<String>,
    pub health: Option<HealthState>,
    pub wildcard: bool,
}

impl ZoneRecord {
    /// REST shape of this record
    pub fn format(&self) -> Value {
        let mut out = json!({
            "id": self.id,
            "name": self.name,
            "type": self.rtype.to_string(),
            "value": self.value.format(),
        });
        let map = out.as_object_mut().expect("object literal");
        if let Some(zone) = &self.zone {
            map.insert("zone".into(), json!(zone));
        }
        if let Some(subdomain) = &self.subdomain {
            map.insert("subdomain".into(), json!(subdomain));
        }
        if let Some(health) = &self.health {
            map.insert("health".into(), json!(health));
        }
        out
    }
}

/// Generate a fresh record hid: short, random, URL-safe
pub fn generate_hid() -> String {
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// Build the external id for `(reversed-name, type, hid)`
pub fn build_id(reversed_name: &str, rtype: RecordType, hid: &str) -> String {
    let raw = format!(
        "{}{}{}{}{}",
        reversed_name, ID_SEPARATOR, rtype, ID_SEPARATOR, hid
    );
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Parse an external id back into `(reversed-name, type, hid)`.
/// Invalid encodings yield `None`, never an error.
pub fn parse_id(id: &str) -> Option<(String, RecordType, String)> {
    let raw = URL_SAFE_NO_PAD.decode(id.as_bytes()).ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let mut parts = raw.split(ID_SEPARATOR);
    let reversed_name = parts.next()?.to_string();
    let rtype: RecordType = parts.next()?.parse().ok()?;
    let hid = parts.next()?.to_string();
    if parts.next().is_some() || reversed_name.is_empty() || hid.is_empty() {
        return None;
    }
    Some((reversed_name, rtype, hid))
}
