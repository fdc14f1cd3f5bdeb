use serde_json::json;
use std::sync::Arc;

use pendingdns::store::{KeyStore, MemoryStore};
use pendingdns::zone::record::{build_id, parse_id};
use pendingdns::zone::{RecordType, RecordValue, ZoneStore};

fn zones() -> ZoneStore<Arc<MemoryStore>> {
    ZoneStore::new(Arc::new(MemoryStore::new()))
}

#[test]
fn test_id_round_trip() {
    for (name, rtype, hid) in [
        ("com.example", RecordType::A, "abcd1234"),
        ("com.example.www", RecordType::URL, "ZZzz0099"),
        ("uk.co.example.test.*", RecordType::CNAME, "q"),
    ] {
        let id = build_id(name, rtype, hid);
        assert_eq!(
            parse_id(&id),
            Some((name.to_string(), rtype, hid.to_string())),
            "{} must round-trip",
            id
        );
    }
}

#[tokio::test]
async fn test_scenario_add_then_resolve() {
    let zones = zones();
    zones
        .add("example.com", "", RecordType::A, &json!(["1.2.3.4"]), None)
        .await
        .unwrap()
        .expect("record stored");

    let records = zones
        .resolve("example.com", RecordType::A, false)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].value,
        RecordValue::Address {
            address: "1.2.3.4".into(),
            health_check: None
        }
    );
}

#[tokio::test]
async fn test_scenario_wildcard_precedence() {
    let zones = zones();
    zones
        .add(
            "example.com",
            "*.test",
            RecordType::CNAME,
            &json!(["example.com"]),
            None,
        )
        .await
        .unwrap()
        .expect("wildcard stored");

    // wildcard answer, tagged with the wildcard name
    let records = zones
        .resolve("sub.test.example.com", RecordType::CNAME, false)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "*.test.example.com");
    assert!(records[0].wildcard);

    // an exact record at the same position wins over the wildcard
    zones
        .add(
            "example.com",
            "test",
            RecordType::CNAME,
            &json!(["direct.example.com"]),
            None,
        )
        .await
        .unwrap()
        .expect("exact stored");
    let records = zones
        .resolve("test.example.com", RecordType::CNAME, false)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].wildcard);
    assert_eq!(
        records[0].value,
        RecordValue::Target {
            target: "direct.example.com".into()
        }
    );
}

#[tokio::test]
async fn test_scenario_mx_ordering_in_list() {
    let zones = zones();
    zones
        .add("example.com", "", RecordType::MX, &json!(["mx1", 10]), None)
        .await
        .unwrap()
        .unwrap();
    zones
        .add("example.com", "", RecordType::MX, &json!(["mx2", 1]), None)
        .await
        .unwrap()
        .unwrap();

    let records = zones
        .resolve("example.com", RecordType::MX, false)
        .await
        .unwrap();
    let mut priorities: Vec<u8> = records
        .iter()
        .map(|record| match &record.value {
            RecordValue::Mx { priority, .. } => *priority,
            _ => unreachable!(),
        })
        .collect();
    priorities.sort();
    assert_eq!(priorities, vec![1, 10]);
}

#[tokio::test]
async fn test_zone_index_invariant_over_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let zones = ZoneStore::new(store.clone());

    let a = zones
        .add("example.com", "one", RecordType::A, &json!(["1.1.1.1"]), None)
        .await
        .unwrap()
        .unwrap();
    let b = zones
        .add("example.com", "two", RecordType::A, &json!(["2.2.2.2"]), None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(zones.list("example.com").await.unwrap().len(), 2);

    zones.delete("example.com", &a).await.unwrap();
    assert_eq!(zones.list("example.com").await.unwrap().len(), 1);

    zones.delete("example.com", &b).await.unwrap();
    assert!(zones.list("example.com").await.unwrap().is_empty());

    // nothing with fields left behind in the index
    let members = store.smembers("d:com.example:z").await.unwrap();
    assert!(members.is_empty(), "index still holds {:?}", members);
}

#[tokio::test]
async fn test_idn_zone_is_stored_as_a_label() {
    let zones = zones();
    let id = zones
        .add("münchen.example", "", RecordType::A, &json!(["1.2.3.4"]), None)
        .await
        .unwrap()
        .unwrap();

    let records = zones
        .resolve("xn--mnchen-3ya.example", RecordType::A, false)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
}

#[tokio::test]
async fn test_challenge_record_expires() {
    let zones = zones();
    zones
        .add(
            "example.com",
            "_acme-challenge",
            RecordType::TXT,
            &json!(["token"]),
            Some(std::time::Duration::from_millis(20)),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        zones
            .resolve("_acme-challenge.example.com", RecordType::TXT, true)
            .await
            .unwrap()
            .len(),
        1
    );

    tokio::time::sleep(std::time::Duration::from_millis(40)).await;
    assert!(
        zones
            .resolve("_acme-challenge.example.com", RecordType::TXT, true)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_short_mode_omits_context() {
    let zones = zones();
    zones
        .add("example.com", "www", RecordType::A, &json!(["1.2.3.4"]), None)
        .await
        .unwrap()
        .unwrap();

    let full = zones
        .resolve("www.example.com", RecordType::A, false)
        .await
        .unwrap();
    assert_eq!(full[0].zone.as_deref(), Some("example.com"));
    assert_eq!(full[0].subdomain.as_deref(), Some("www"));

    let short = zones
        .resolve("www.example.com", RecordType::A, true)
        .await
        .unwrap();
    assert!(short[0].zone.is_none());
    assert!(short[0].subdomain.is_none());
}
