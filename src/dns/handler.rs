//! Query answering. A parsed DNS message goes in, an authoritative reply
//! comes out; the zone store, external resolver and health results are the
//! only inputs. Questions are processed concurrently and their answers
//! appended into a single response in question order.

use futures::future::join_all;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CAA, CNAME, MX, NS, SOA, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType as WireType};
use rand::seq::SliceRandom;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::resolver::{CachedResolver, ResolveOpts};
use crate::store::KeyStore;
use crate::zone::name::normalize_domain;
use crate::zone::{RecordType, RecordValue, ZoneRecord, ZoneStore};

/// Maximum CNAME chase depth, inclusive
const MAX_CHASE_DEPTH: usize = 10;

/// TXT payloads at or above this size are split on the wire
const TXT_SPLIT_THRESHOLD: usize = 128;

/// Size of each TXT chunk after splitting
const TXT_CHUNK_SIZE: usize = 84;

/// Chaos-class names the operator may configure answers for
const CHAOS_NAMES: [&str; 4] = [
    "version.bind",
    "hostname.bind",
    "id.server",
    "authors.bind",
];

enum QuestionOutcome {
    Answers(Vec<Record>),
    Refused,
}

/// Pure query-to-answer function over the zone store
pub struct DnsHandler<S: KeyStore> {
    zones: Arc<ZoneStore<S>>,
    resolver: Arc<CachedResolver<S>>,
    config: Arc<Config>,
    resolve_opts: ResolveOpts,
}

impl<S: KeyStore> DnsHandler<S> {
    pub fn new(
        zones: Arc<ZoneStore<S>>,
        resolver: Arc<CachedResolver<S>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            zones,
            resolver,
            config,
            resolve_opts: ResolveOpts::default(),
        }
    }

    /// Answer a parsed request. The reply always carries QR=1 and AA=1;
    /// chaos questions without a configured value refuse the request.
    pub async fn handle(&self, request: &Message) -> Message {
        let mut response = Message::new();
        response.set_id(request.id());
        response.set_message_type(MessageType::Response);
        response.set_op_code(request.op_code());
        response.set_authoritative(true);
        response.set_recursion_desired(request.recursion_desired());
        for query in request.queries() {
            response.add_query(query.clone());
        }

        let outcomes = join_all(
            request
                .queries()
                .iter()
                .map(|query| self.answer_question(query)),
        )
        .await;

        let mut refused = false;
        for outcome in outcomes {
            match outcome {
                QuestionOutcome::Answers(records) => {
                    response.add_answers(records);
                }
                QuestionOutcome::Refused => refused = true,
            }
        }
        if refused && response.answer_count() == 0 {
            response.set_response_code(ResponseCode::Refused);
        }
        response
    }

    async fn answer_question(&self, query: &hickory_proto::op::Query) -> QuestionOutcome {
        let qname = query
            .name()
            .to_ascii()
            .trim_end_matches('.')
            .to_lowercase();
        let qtype = query.query_type();

        match query.query_class() {
            DNSClass::IN => {}
            DNSClass::CH => return self.answer_chaos(&qname, qtype),
            _ => return QuestionOutcome::Answers(Vec::new()),
        }

        let Some(owner) = to_name(&qname) else {
            return QuestionOutcome::Answers(Vec::new());
        };
        let records = self
            .resolve_question(qname, qtype, owner, 0)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!("question processing failed: {}", err);
                Vec::new()
            });
        QuestionOutcome::Answers(records)
    }

    /// Chaos-class requests are answered iff the operator configured a
    /// non-empty value for the queried name.
    fn answer_chaos(&self, qname: &str, qtype: WireType) -> QuestionOutcome {
        if qtype != WireType::TXT || !CHAOS_NAMES.contains(&qname) {
            return QuestionOutcome::Refused;
        }
        let Some(value) = self.config.chaos_value(qname) else {
            return QuestionOutcome::Refused;
        };
        let Some(owner) = to_name(qname) else {
            return QuestionOutcome::Refused;
        };
        let mut record = Record::from_rdata(
            owner,
            self.config.dns.ttl,
            RData::TXT(TXT::new(vec![value.to_string()])),
        );
        record.set_dns_class(DNSClass::CH);
        QuestionOutcome::Answers(vec![record])
    }

    /// Resolve one question, possibly recursing through CNAME targets.
    fn resolve_question<'a>(
        &'a self,
        qname: String,
        qtype: WireType,
        owner: Name,
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>>> + Send + 'a>> {
        Box::pin(async move {
            // Unknown query types are ignored outright
            let Some(consult) = expand_types(qtype) else {
                return Ok(Vec::new());
            };

            let mut entries: Vec<ZoneRecord> = Vec::new();
            for rtype in consult.iter() {
                let mut found = self.zones.resolve(&qname, *rtype, false).await?;
                match rtype {
                    RecordType::A | RecordType::AAAA => {
                        found.shuffle(&mut rand::rng());
                        found = fail_open_filter(found);
                    }
                    RecordType::MX => {
                        found.sort_by_key(|entry| match &entry.value {
                            RecordValue::Mx { priority, .. } => *priority,
                            _ => u8::MAX,
                        });
                    }
                    _ => {}
                }
                entries.extend(found);
            }

            if entries.is_empty() {
                return Ok(self.synthesize(&qname, qtype, &owner));
            }

            let ttl = self.config.dns.ttl;
            let mut records = Vec::new();
            for entry in entries {
                match (&entry.rtype, &entry.value) {
                    (RecordType::A, RecordValue::Address { address, .. }) => {
                        if let Ok(ip) = address.parse::<Ipv4Addr>() {
                            records.push(Record::from_rdata(
                                owner.clone(),
                                ttl,
                                RData::A(A::from(ip)),
                            ));
                        }
                    }
                    (RecordType::AAAA, RecordValue::Address { address, .. }) => {
                        if let Ok(ip) = address.parse::<Ipv6Addr>() {
                            records.push(Record::from_rdata(
                                owner.clone(),
                                ttl,
                                RData::AAAA(AAAA::from(ip)),
                            ));
                        }
                    }
                    (RecordType::CNAME, RecordValue::Target { target }) => {
                        let target = self.expand_apex(target, &entry);
                        let Some(target_name) = to_name(&target) else {
                            continue;
                        };
                        records.push(Record::from_rdata(
                            owner.clone(),
                            ttl,
                            RData::CNAME(CNAME(target_name.clone())),
                        ));
                        if qtype != WireType::CNAME && depth < MAX_CHASE_DEPTH {
                            let chased = self
                                .resolve_question(target.clone(), qtype, target_name, depth + 1)
                                .await?;
                            records.extend(chased);
                        }
                    }
                    (RecordType::ANAME, RecordValue::Target { target }) => {
                        let target = self.expand_apex(target, &entry);
                        let lookup = match qtype {
                            WireType::A => WireType::A,
                            WireType::AAAA => WireType::AAAA,
                            _ => continue,
                        };
                        match self
                            .resolver
                            .resolve(&target, lookup, &self.resolve_opts)
                            .await
                        {
                            Ok(mut addresses) => {
                                addresses.shuffle(&mut rand::rng());
                                records.extend(address_records(&owner, ttl, qtype, &addresses));
                            }
                            Err(err) => {
                                tracing::debug!("ANAME target {} failed: {}", target, err);
                            }
                        }
                    }
                    (RecordType::URL, RecordValue::Url { .. }) => {
                        let mut hosts = match qtype {
                            WireType::A => self.config.public.hosts.a.clone(),
                            WireType::AAAA => self.config.public.hosts.aaaa.clone(),
                            _ => continue,
                        };
                        hosts.shuffle(&mut rand::rng());
                        records.extend(address_records(&owner, ttl, qtype, &hosts));
                    }
                    (RecordType::MX, RecordValue::Mx { exchange, priority }) => {
                        let exchange = normalize_domain(exchange).unwrap_or_else(|| exchange.clone());
                        let Some(exchange) = to_name(&exchange) else {
                            continue;
                        };
                        records.push(Record::from_rdata(
                            owner.clone(),
                            ttl,
                            RData::MX(MX::new(u16::from(*priority), exchange)),
                        ));
                    }
                    (RecordType::TXT, RecordValue::Txt { data }) => {
                        records.push(Record::from_rdata(
                            owner.clone(),
                            ttl,
                            RData::TXT(TXT::new(split_txt(data))),
                        ));
                    }
                    (RecordType::CAA, RecordValue::Caa { value, tag, flags }) => {
                        if let Some(rdata) = caa_rdata(value, *tag, *flags) {
                            records.push(Record::from_rdata(owner.clone(), ttl, RData::CAA(rdata)));
                        }
                    }
                    (RecordType::NS, RecordValue::Ns { ns }) => {
                        let ns = normalize_domain(ns).unwrap_or_else(|| ns.clone());
                        let Some(ns) = to_name(&ns) else {
                            continue;
                        };
                        records.push(Record::from_rdata(owner.clone(), ttl, RData::NS(NS(ns))));
                    }
                    _ => {}
                }
            }
            Ok(records)
        })
    }

    /// `@` in a CNAME/ANAME target denotes the zone apex
    fn expand_apex(&self, target: &str, entry: &ZoneRecord) -> String {
        if target == "@" {
            entry
                .zone
                .clone()
                .unwrap_or_else(|| entry.name.trim_start_matches("*.").to_string())
        } else {
            normalize_domain(target).unwrap_or_else(|| target.to_string())
        }
    }

    /// Synthetic answers for names we are authoritative for but hold no
    /// stored record of the requested type.
    fn synthesize(&self, qname: &str, qtype: WireType, owner: &Name) -> Vec<Record> {
        let ttl = self.config.dns.ttl;
        let mut records = Vec::new();
        match qtype {
            WireType::NS => {
                for ns in self.config.ns.iter() {
                    if let Some(name) = to_name(&ns.domain) {
                        records.push(Record::from_rdata(owner.clone(), ttl, RData::NS(NS(name))));
                    }
                }
            }
            WireType::A | WireType::AAAA => {
                for ns in self.config.ns.iter() {
                    if !ns.domain.eq_ignore_ascii_case(qname) {
                        continue;
                    }
                    match (qtype, ns.ip) {
                        (WireType::A, std::net::IpAddr::V4(ip)) => {
                            records.push(Record::from_rdata(
                                owner.clone(),
                                ttl,
                                RData::A(A::from(ip)),
                            ));
                        }
                        (WireType::AAAA, std::net::IpAddr::V6(ip)) => {
                            records.push(Record::from_rdata(
                                owner.clone(),
                                ttl,
                                RData::AAAA(AAAA::from(ip)),
                            ));
                        }
                        _ => {}
                    }
                }
            }
            WireType::CAA => {
                for rdata in [
                    caa_rdata("letsencrypt.org", crate::zone::CaaTag::Issue, 0),
                    caa_rdata("letsencrypt.org", crate::zone::CaaTag::IssueWild, 0),
                ]
                .into_iter()
                .flatten()
                {
                    records.push(Record::from_rdata(owner.clone(), ttl, RData::CAA(rdata)));
                }
            }
            WireType::SOA => {
                if let Some(primary) = self.config.ns.first() {
                    let Some(mname) = to_name(&primary.domain) else {
                        return records;
                    };
                    let admin = self.config.soa.admin.replace('@', ".");
                    let Some(rname) = to_name(&admin) else {
                        return records;
                    };
                    let soa = SOA::new(
                        mname,
                        rname,
                        self.config.soa.serial,
                        self.config.soa.refresh,
                        self.config.soa.retry,
                        self.config.soa.expiration,
                        self.config.soa.minimum,
                    );
                    records.push(Record::from_rdata(owner.clone(), ttl, RData::SOA(soa)));
                }
            }
            _ => {}
        }
        records
    }
}

/// Record types to consult for a query type. `None` marks an unsupported
/// query type; SOA consults nothing and is answered purely by synthesis.
fn expand_types(qtype: WireType) -> Option<Vec<RecordType>> {
    match qtype {
        WireType::ANY => Some(vec![RecordType::A, RecordType::AAAA, RecordType::CNAME]),
        WireType::A => Some(vec![
            RecordType::A,
            RecordType::CNAME,
            RecordType::ANAME,
            RecordType::URL,
        ]),
        WireType::AAAA => Some(vec![
            RecordType::AAAA,
            RecordType::CNAME,
            RecordType::ANAME,
            RecordType::URL,
        ]),
        WireType::TXT => Some(vec![RecordType::TXT, RecordType::CNAME]),
        WireType::CNAME => Some(vec![RecordType::CNAME]),
        WireType::MX => Some(vec![RecordType::MX]),
        WireType::NS => Some(vec![RecordType::NS]),
        WireType::CAA => Some(vec![RecordType::CAA]),
        WireType::SOA => Some(Vec::new()),
        _ => None,
    }
}

/// Drop unhealthy addresses unless every address is unhealthy: an
/// authoritative server must never NXDOMAIN a live record.
fn fail_open_filter(entries: Vec<ZoneRecord>) -> Vec<ZoneRecord> {
    let healthy: Vec<ZoneRecord> = entries
        .iter()
        .filter(|entry| entry.health.as_ref().map(|h| h.status) != Some(false))
        .cloned()
        .collect();
    if healthy.is_empty() { entries } else { healthy }
}

fn to_name(name: &str) -> Option<Name> {
    Name::from_ascii(format!("{}.", name.trim_end_matches('.'))).ok()
}

fn address_records(owner: &Name, ttl: u32, qtype: WireType, addresses: &[String]) -> Vec<Record> {
    let mut records = Vec::new();
    for address in addresses {
        match qtype {
            WireType::A => {
                if let Ok(ip) = address.parse::<Ipv4Addr>() {
                    records.push(Record::from_rdata(owner.clone(), ttl, RData::A(A::from(ip))));
                }
            }
            WireType::AAAA => {
                if let Ok(ip) = address.parse::<Ipv6Addr>() {
                    records.push(Record::from_rdata(
                        owner.clone(),
                        ttl,
                        RData::AAAA(AAAA::from(ip)),
                    ));
                }
            }
            _ => {}
        }
    }
    records
}

/// Split oversized TXT payloads into wire-safe chunks
fn split_txt(data: &str) -> Vec<String> {
    if data.len() < TXT_SPLIT_THRESHOLD {
        return vec![data.to_string()];
    }
    data.as_bytes()
        .chunks(TXT_CHUNK_SIZE)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

fn caa_rdata(value: &str, tag: crate::zone::CaaTag, flags: u8) -> Option<CAA> {
    let critical = flags >= 128;
    match tag {
        crate::zone::CaaTag::Issue => {
            let name = Name::from_ascii(value).ok()?;
            Some(CAA::new_issue(critical, Some(name), Vec::new()))
        }
        crate::zone::CaaTag::IssueWild => {
            let name = Name::from_ascii(value).ok()?;
            Some(CAA::new_issuewild(critical, Some(name), Vec::new()))
        }
        crate::zone::CaaTag::Iodef => {
            let url = url::Url::parse(value).ok()?;
            Some(CAA::new_iodef(critical, url))
        }
    }
}
