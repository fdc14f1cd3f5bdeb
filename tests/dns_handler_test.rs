use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType as WireType};
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;

use pendingdns::config::{Config, NameServer};
use pendingdns::resolver::CachedResolver;
use pendingdns::store::{KeyStore, MemoryStore};
use pendingdns::zone::{HEALTH_RESULTS_KEY, RecordType, ZoneStore, health_member};
use pendingdns::DnsHandler;

struct Fixture {
    store: Arc<MemoryStore>,
    zones: Arc<ZoneStore<Arc<MemoryStore>>>,
    handler: DnsHandler<Arc<MemoryStore>>,
}

fn fixture() -> Fixture {
    let mut config = Config::default();
    config.dns.ttl = 300;
    config.ns = vec![
        NameServer {
            domain: "ns01.pendingdns.com".to_string(),
            ip: "198.51.100.10".parse::<IpAddr>().unwrap(),
        },
        NameServer {
            domain: "ns02.pendingdns.com".to_string(),
            ip: "198.51.100.11".parse::<IpAddr>().unwrap(),
        },
    ];
    config.public.hosts.a = vec!["203.0.113.1".to_string(), "203.0.113.2".to_string()];
    config
        .chaos
        .insert("version.bind".to_string(), "PendingDNS test".to_string());

    let store = Arc::new(MemoryStore::new());
    let zones = Arc::new(ZoneStore::new(store.clone()));
    let resolver = Arc::new(CachedResolver::new(store.clone(), &[]));
    let handler = DnsHandler::new(zones.clone(), resolver, Arc::new(config));
    Fixture {
        store,
        zones,
        handler,
    }
}

fn query(name: &str, rtype: WireType) -> Message {
    let mut message = Message::new();
    message.set_id(0x1234);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.add_query(Query::query(
        Name::from_ascii(format!("{}.", name)).unwrap(),
        rtype,
    ));
    message
}

fn a_addresses(response: &Message) -> Vec<String> {
    response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(a.to_string()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_plain_a_answer_is_authoritative() {
    let fx = fixture();
    fx.zones
        .add("example.com", "", RecordType::A, &json!(["1.2.3.4"]), None)
        .await
        .unwrap()
        .unwrap();

    let response = fx.handler.handle(&query("example.com", WireType::A)).await;
    assert_eq!(response.id(), 0x1234);
    assert_eq!(response.message_type(), MessageType::Response);
    assert!(response.authoritative());
    assert_eq!(a_addresses(&response), vec!["1.2.3.4".to_string()]);
}

#[tokio::test]
async fn test_cname_chase_appends_target_answers() {
    let fx = fixture();
    fx.zones
        .add("example.com", "", RecordType::A, &json!(["1.2.3.4"]), None)
        .await
        .unwrap()
        .unwrap();
    fx.zones
        .add("example.com", "www", RecordType::CNAME, &json!(["@"]), None)
        .await
        .unwrap()
        .unwrap();

    let response = fx
        .handler
        .handle(&query("www.example.com", WireType::A))
        .await;

    let cnames: Vec<String> = response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::CNAME(target)) => Some(target.to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(cnames, vec!["example.com.".to_string()]);
    assert_eq!(a_addresses(&response), vec!["1.2.3.4".to_string()]);
}

#[tokio::test]
async fn test_health_fail_open_keeps_unhealthy_answer() {
    let fx = fixture();
    let id = fx
        .zones
        .add(
            "example.com",
            "",
            RecordType::A,
            &json!(["1.2.3.4", "tcp://127.0.0.1:1"]),
            None,
        )
        .await
        .unwrap()
        .unwrap();

    let member = health_member("com.example", &id);
    fx.store
        .hset(
            HEALTH_RESULTS_KEY,
            &member,
            &json!({"status": false, "error": "connect refused"}).to_string(),
        )
        .await
        .unwrap();

    // the only address is down, it is answered anyway
    let response = fx.handler.handle(&query("example.com", WireType::A)).await;
    assert_eq!(a_addresses(&response), vec!["1.2.3.4".to_string()]);
}

#[tokio::test]
async fn test_health_filter_drops_unhealthy_when_alternatives_exist() {
    let fx = fixture();
    let sick = fx
        .zones
        .add(
            "example.com",
            "",
            RecordType::A,
            &json!(["1.1.1.1", "tcp://127.0.0.1:1"]),
            None,
        )
        .await
        .unwrap()
        .unwrap();
    fx.zones
        .add(
            "example.com",
            "",
            RecordType::A,
            &json!(["2.2.2.2", "tcp://127.0.0.1:2"]),
            None,
        )
        .await
        .unwrap()
        .unwrap();

    let member = health_member("com.example", &sick);
    fx.store
        .hset(
            HEALTH_RESULTS_KEY,
            &member,
            &json!({"status": false}).to_string(),
        )
        .await
        .unwrap();

    let response = fx.handler.handle(&query("example.com", WireType::A)).await;
    assert_eq!(a_addresses(&response), vec!["2.2.2.2".to_string()]);
}

#[tokio::test]
async fn test_url_record_answers_public_hosts() {
    let fx = fixture();
    fx.zones
        .add(
            "example.com",
            "go",
            RecordType::URL,
            &json!(["https://target.example.org/", 301, false]),
            None,
        )
        .await
        .unwrap()
        .unwrap();

    let response = fx
        .handler
        .handle(&query("go.example.com", WireType::A))
        .await;
    let mut addresses = a_addresses(&response);
    addresses.sort();
    assert_eq!(
        addresses,
        vec!["203.0.113.1".to_string(), "203.0.113.2".to_string()]
    );
    // the URL record itself never appears on the wire
    assert!(
        response
            .answers()
            .iter()
            .all(|record| record.record_type() == WireType::A)
    );
}

#[tokio::test]
async fn test_aname_uses_external_resolver_cache() {
    let fx = fixture();
    fx.zones
        .add(
            "example.com",
            "",
            RecordType::ANAME,
            &json!(["origin.example.net"]),
            None,
        )
        .await
        .unwrap()
        .unwrap();

    // pre-seed the external cache so no network is touched
    let now = jiff::Timestamp::now().as_millisecond();
    fx.store
        .set(
            "d:cache:origin.example.net:A",
            json!({"expires": now + 60_000, "data": ["198.51.100.77"]})
                .to_string()
                .as_bytes(),
            None,
        )
        .await
        .unwrap();

    let response = fx.handler.handle(&query("example.com", WireType::A)).await;
    assert_eq!(a_addresses(&response), vec!["198.51.100.77".to_string()]);
}

#[tokio::test]
async fn test_mx_answers_ascending_priority() {
    let fx = fixture();
    fx.zones
        .add("example.com", "", RecordType::MX, &json!(["mx1.example.com", 10]), None)
        .await
        .unwrap()
        .unwrap();
    fx.zones
        .add("example.com", "", RecordType::MX, &json!(["mx2.example.com", 1]), None)
        .await
        .unwrap()
        .unwrap();

    let response = fx.handler.handle(&query("example.com", WireType::MX)).await;
    let priorities: Vec<u16> = response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::MX(mx)) => Some(mx.preference()),
            _ => None,
        })
        .collect();
    assert_eq!(priorities, vec![1, 10]);
}

#[tokio::test]
async fn test_txt_chunking_on_the_wire() {
    let fx = fixture();
    let long = "a".repeat(200);
    fx.zones
        .add("example.com", "big", RecordType::TXT, &json!([long]), None)
        .await
        .unwrap()
        .unwrap();

    let response = fx
        .handler
        .handle(&query("big.example.com", WireType::TXT))
        .await;
    let chunks: Vec<usize> = response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::TXT(txt)) => Some(txt.txt_data().iter().map(|c| c.len()).collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect();
    assert!(chunks.len() > 1);
    assert!(chunks.iter().all(|len| *len <= 84));
    assert_eq!(chunks.iter().sum::<usize>(), 200);
}

#[tokio::test]
async fn test_soa_synthesis_uses_primary_ns() {
    let fx = fixture();
    let response = fx
        .handler
        .handle(&query("anything.example.com", WireType::SOA))
        .await;

    let soa = response
        .answers()
        .iter()
        .find_map(|record| match record.data() {
            Some(RData::SOA(soa)) => Some(soa.clone()),
            _ => None,
        })
        .expect("synthetic SOA");
    assert_eq!(soa.mname().to_string(), "ns01.pendingdns.com.");
}

#[tokio::test]
async fn test_ns_and_caa_synthesis() {
    let fx = fixture();

    let response = fx.handler.handle(&query("example.com", WireType::NS)).await;
    assert_eq!(response.answer_count(), 2);

    let response = fx.handler.handle(&query("example.com", WireType::CAA)).await;
    let tags: Vec<String> = response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::CAA(caa)) => Some(caa.tag().as_str().to_string()),
            _ => None,
        })
        .collect();
    assert_eq!(tags.len(), 2);
    assert!(tags.contains(&"issue".to_string()));
    assert!(tags.contains(&"issuewild".to_string()));
}

#[tokio::test]
async fn test_nameserver_own_address_synthesis() {
    let fx = fixture();
    let response = fx
        .handler
        .handle(&query("ns01.pendingdns.com", WireType::A))
        .await;
    assert_eq!(a_addresses(&response), vec!["198.51.100.10".to_string()]);
}

#[tokio::test]
async fn test_chaos_answered_only_when_configured() {
    let fx = fixture();

    let mut chaos = Message::new();
    chaos.set_id(7);
    chaos.set_message_type(MessageType::Query);
    chaos.set_op_code(OpCode::Query);
    let mut question = Query::query(Name::from_ascii("version.bind.").unwrap(), WireType::TXT);
    question.set_query_class(DNSClass::CH);
    chaos.add_query(question);

    let response = fx.handler.handle(&chaos).await;
    assert_eq!(response.answer_count(), 1);

    // hostname.bind has no configured value and is refused
    let mut chaos = Message::new();
    chaos.set_id(8);
    chaos.set_message_type(MessageType::Query);
    chaos.set_op_code(OpCode::Query);
    let mut question = Query::query(Name::from_ascii("hostname.bind.").unwrap(), WireType::TXT);
    question.set_query_class(DNSClass::CH);
    chaos.add_query(question);

    let response = fx.handler.handle(&chaos).await;
    assert_eq!(response.answer_count(), 0);
    assert_eq!(response.response_code(), ResponseCode::Refused);
}

#[tokio::test]
async fn test_unknown_query_type_is_ignored() {
    let fx = fixture();
    fx.zones
        .add("example.com", "", RecordType::A, &json!(["1.2.3.4"]), None)
        .await
        .unwrap()
        .unwrap();

    let response = fx.handler.handle(&query("example.com", WireType::SRV)).await;
    assert_eq!(response.answer_count(), 0);
    assert_eq!(response.response_code(), ResponseCode::NoError);
}
