//! Zone store: record lifecycle, lookup and wildcard fallback on top of
//! the key store. Source of truth for DNS answers and for ACME challenge
//! publication.

use futures::future::join_all;
use serde_json::Value;
use std::time::Duration;

use super::name::{
    join_name, normalize_domain, parse_record_key, record_key, reverse_name, subdomain_of,
    valid_wildcard_position, wildcard_candidate, zone_candidates, zone_key,
};
use super::record::{
    HealthState, RecordType, RecordValue, ZoneRecord, build_id, generate_hid, parse_id,
};
use crate::error::Result;
use crate::store::KeyStore;

/// Sorted-set of health targets, scored by next-due epoch milliseconds
pub const HEALTH_QUEUE_KEY: &str = "d:health:z";

/// Hash of last probe outcomes, keyed like the queue members
pub const HEALTH_RESULTS_KEY: &str = "d:health:r";

/// Queue/result member for a health-checked record
pub fn health_member(reversed_zone: &str, id: &str) -> String {
    format!("{}:{}", reversed_zone, id)
}

/// Redis-backed zone store. Storage errors propagate; logical failures
/// (bad domains, unknown ids) surface as `None`/`false`/empty.
pub struct ZoneStore<S: KeyStore> {
    store: S,
}

impl<S: KeyStore> ZoneStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The backing key store, shared with sibling subsystems
    pub fn backing(&self) -> &S {
        &self.store
    }

    /// List every record of a zone, sorted by type order then reversed
    /// name. Record keys whose hash has disappeared are swept from the
    /// zone index on the way through.
    pub async fn list(&self, zone: &str) -> Result<Vec<ZoneRecord>> {
        let Some(zone_norm) = normalize_domain(zone) else {
            return Ok(Vec::new());
        };
        let rev_zone = reverse_name(&zone_norm);
        let index = zone_key(&rev_zone);

        let keys = self.store.smembers(&index).await?;
        let reads = join_all(keys.iter().map(|key| self.store.hget_all(key))).await;

        let mut records = Vec::new();
        for (key, fields) in keys.iter().zip(reads) {
            let fields = fields?;
            if fields.is_empty() {
                self.store.srem(&index, key).await?;
                continue;
            }
            let Some((rev_name, type_str)) = parse_record_key(key) else {
                continue;
            };
            let Ok(rtype) = type_str.parse::<RecordType>() else {
                continue;
            };
            let name = reverse_name(&rev_name);
            let subdomain = subdomain_of(&rev_name, &rev_zone);
            for (hid, raw) in fields {
                let Ok(json) = serde_json::from_str::<Value>(&raw) else {
                    continue;
                };
                let Some(value) = RecordValue::from_json(rtype, &json) else {
                    continue;
                };
                records.push(ZoneRecord {
                    name: name.clone(),
                    rtype,
                    value,
                    id: build_id(&rev_name, rtype, &hid),
                    hid,
                    zone: Some(zone_norm.clone()),
                    subdomain: subdomain.clone(),
                    health: None,
                    wildcard: name.starts_with("*."),
                });
            }
        }

        records.sort_by(|a, b| {
            a.rtype
                .sort_rank()
                .cmp(&b.rtype.sort_rank())
                .then_with(|| reverse_name(&a.name).cmp(&reverse_name(&b.name)))
        });

        self.attach_health(&mut records, &rev_zone).await?;
        Ok(records)
    }

    /// Store a new record. Returns the new id, or `None` when the input
    /// is rejected.
    pub async fn add(
        &self,
        zone: &str,
        subdomain: &str,
        rtype: RecordType,
        value: &Value,
        expire: Option<Duration>,
    ) -> Result<Option<String>> {
        let Some(zone_norm) = normalize_domain(zone) else {
            return Ok(None);
        };
        let Some(name) = normalize_domain(&join_name(subdomain, &zone_norm)) else {
            return Ok(None);
        };
        if !valid_wildcard_position(&name) {
            return Ok(None);
        }
        let Some(value) = RecordValue::from_json(rtype, value) else {
            return Ok(None);
        };

        let rev_name = reverse_name(&name);
        let rev_zone = reverse_name(&zone_norm);
        if subdomain_of(&rev_name, &rev_zone).is_none() {
            return Ok(None);
        }

        let key = record_key(&rev_name, &rtype.to_string());
        let raw = value.to_json().to_string();

        let mut hid = generate_hid();
        let mut attempts = 0;
        while !self
            .store
            .hset_nx_indexed(&key, &hid, &raw, &zone_key(&rev_zone))
            .await?
        {
            attempts += 1;
            if attempts >= 3 {
                tracing::warn!("hid collision storm on {}", key);
                return Ok(None);
            }
            hid = generate_hid();
        }

        if let Some(ttl) = expire {
            self.store.expire(&key, ttl).await?;
        }

        let id = build_id(&rev_name, rtype, &hid);
        self.sync_health(&rev_zone, &id, rtype, &value).await?;
        tracing::debug!("stored {} {} as {}", name, rtype, id);
        Ok(Some(id))
    }

    /// Update a record in place. When the normalized name or the type
    /// changed the record is deleted and re-added (the id changes);
    /// otherwise the value is overwritten at the same hid.
    pub async fn update(
        &self,
        zone: &str,
        id: &str,
        subdomain: &str,
        rtype: RecordType,
        value: &Value,
    ) -> Result<Option<String>> {
        let Some((old_rev, old_type, hid)) = parse_id(id) else {
            return Ok(None);
        };
        let Some(zone_norm) = normalize_domain(zone) else {
            return Ok(None);
        };
        let Some(name) = normalize_domain(&join_name(subdomain, &zone_norm)) else {
            return Ok(None);
        };
        if !valid_wildcard_position(&name) {
            return Ok(None);
        }
        let rev_name = reverse_name(&name);

        if rev_name != old_rev || rtype != old_type {
            self.delete(zone, id).await?;
            return self.add(zone, subdomain, rtype, value, None).await;
        }

        let Some(parsed) = RecordValue::from_json(rtype, value) else {
            return Ok(None);
        };
        let key = record_key(&rev_name, &rtype.to_string());
        self.store
            .hset(&key, &hid, &parsed.to_json().to_string())
            .await?;

        let rev_zone = reverse_name(&zone_norm);
        self.sync_health(&rev_zone, id, rtype, &parsed).await?;
        Ok(Some(id.to_string()))
    }

    /// Delete a record by id. Returns true iff the stored field existed.
    pub async fn delete(&self, zone: &str, id: &str) -> Result<bool> {
        let Some((rev_name, rtype, hid)) = parse_id(id) else {
            return Ok(false);
        };
        let Some(zone_norm) = normalize_domain(zone) else {
            return Ok(false);
        };
        let rev_zone = reverse_name(&zone_norm);
        let key = record_key(&rev_name, &rtype.to_string());

        let existed = self.store.hdel(&key, &hid).await?;
        if !self.store.exists(&key).await? {
            self.store.srem(&zone_key(&rev_zone), &key).await?;
        }

        let member = health_member(&rev_zone, id);
        self.store.zrem(HEALTH_QUEUE_KEY, &member).await?;
        self.store.hdel(HEALTH_RESULTS_KEY, &member).await?;
        Ok(existed)
    }

    /// Delete every record at an exact name and type, optionally only
    /// those whose stored value equals `value_match`. Returns the number
    /// of fields that existed and were removed.
    pub async fn delete_by_domain(
        &self,
        domain: &str,
        rtype: RecordType,
        value_match: Option<&Value>,
    ) -> Result<usize> {
        let Some(name) = normalize_domain(domain) else {
            return Ok(0);
        };
        let rev_name = reverse_name(&name);
        let key = record_key(&rev_name, &rtype.to_string());

        let fields = self.store.hget_all(&key).await?;
        if fields.is_empty() {
            return Ok(0);
        }

        let rev_zone = self
            .resolve_zone(&name)
            .await?
            .map(|zone| reverse_name(&zone));

        let mut count = 0;
        for (hid, raw) in fields {
            let matches = match value_match {
                Some(want) => serde_json::from_str::<Value>(&raw)
                    .map(|have| have == *want)
                    .unwrap_or(false),
                None => true,
            };
            if !matches {
                continue;
            }
            if self.store.hdel(&key, &hid).await? {
                count += 1;
            }
            if let Some(rev_zone) = &rev_zone {
                let member = health_member(rev_zone, &build_id(&rev_name, rtype, &hid));
                self.store.zrem(HEALTH_QUEUE_KEY, &member).await?;
                self.store.hdel(HEALTH_RESULTS_KEY, &member).await?;
            }
        }

        if count > 0 && !self.store.exists(&key).await? {
            if let Some(rev_zone) = &rev_zone {
                self.store.srem(&zone_key(rev_zone), &key).await?;
            }
        }
        Ok(count)
    }

    /// Look a name and type up: exact match first, then the wildcard
    /// candidate. Wildcard hits are tagged with the wildcard name that
    /// matched. In short mode the zone/subdomain context is omitted.
    pub async fn resolve(
        &self,
        domain: &str,
        rtype: RecordType,
        short: bool,
    ) -> Result<Vec<ZoneRecord>> {
        let Some(name) = normalize_domain(domain) else {
            return Ok(Vec::new());
        };
        let rev_name = reverse_name(&name);
        let type_str = rtype.to_string();

        let mut matched_rev = rev_name.clone();
        let mut wildcard = false;
        let mut fields = self.store.hget_all(&record_key(&rev_name, &type_str)).await?;
        if fields.is_empty() {
            if let Some(candidate) = wildcard_candidate(&rev_name) {
                let fallback = self.store.hget_all(&record_key(&candidate, &type_str)).await?;
                if !fallback.is_empty() {
                    fields = fallback;
                    matched_rev = candidate;
                    wildcard = true;
                }
            }
        }
        if fields.is_empty() {
            return Ok(Vec::new());
        }

        let matched_name = reverse_name(&matched_rev);
        let mut records = Vec::new();
        for (hid, raw) in fields {
            let Ok(json) = serde_json::from_str::<Value>(&raw) else {
                continue;
            };
            let Some(value) = RecordValue::from_json(rtype, &json) else {
                continue;
            };
            records.push(ZoneRecord {
                name: matched_name.clone(),
                rtype,
                value,
                id: build_id(&matched_rev, rtype, &hid),
                hid,
                zone: None,
                subdomain: None,
                health: None,
                wildcard,
            });
        }

        let wants_health = rtype.health_checkable()
            && records
                .iter()
                .any(|record| record.value.health_check_uri().is_some());
        if !short || wants_health {
            if let Some(zone) = self.resolve_zone(&matched_name).await? {
                let rev_zone = reverse_name(&zone);
                if !short {
                    for record in records.iter_mut() {
                        record.zone = Some(zone.clone());
                        record.subdomain = subdomain_of(&matched_rev, &rev_zone);
                    }
                }
                if wants_health {
                    self.attach_health(&mut records, &rev_zone).await?;
                }
            }
        }
        Ok(records)
    }

    /// Longest stored zone a name belongs to. Candidates never descend
    /// into the public suffix (see `zone_candidates`).
    pub async fn resolve_zone(&self, name: &str) -> Result<Option<String>> {
        let Some(norm) = normalize_domain(name) else {
            return Ok(None);
        };
        for candidate in zone_candidates(&norm) {
            if self
                .store
                .exists(&zone_key(&reverse_name(&candidate)))
                .await?
            {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Queue or clear the health entry for a record, matching its value
    async fn sync_health(
        &self,
        reversed_zone: &str,
        id: &str,
        rtype: RecordType,
        value: &RecordValue,
    ) -> Result<()> {
        let member = health_member(reversed_zone, id);
        if rtype.health_checkable() && value.health_check_uri().is_some() {
            let now = jiff::Timestamp::now().as_millisecond();
            self.store.zadd(HEALTH_QUEUE_KEY, &member, now).await?;
        } else {
            self.store.zrem(HEALTH_QUEUE_KEY, &member).await?;
            self.store.hdel(HEALTH_RESULTS_KEY, &member).await?;
        }
        Ok(())
    }

    /// Fill in the last probe outcome for health-checked addresses
    async fn attach_health(&self, records: &mut [ZoneRecord], reversed_zone: &str) -> Result<()> {
        for record in records.iter_mut() {
            if !record.rtype.health_checkable() || record.value.health_check_uri().is_none() {
                continue;
            }
            let member = health_member(reversed_zone, &record.id);
            if let Some(raw) = self.store.hget(HEALTH_RESULTS_KEY, &member).await? {
                record.health = serde_json::from_str::<HealthState>(&raw).ok();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn zone_store() -> ZoneStore<Arc<MemoryStore>> {
        ZoneStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_add_and_resolve_exact() {
        let zones = zone_store();
        let id = zones
            .add("example.com", "", RecordType::A, &json!(["1.2.3.4"]), None)
            .await
            .unwrap()
            .expect("id");

        let records = zones
            .resolve("example.com", RecordType::A, false)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(
            records[0].value,
            RecordValue::Address {
                address: "1.2.3.4".into(),
                health_check: None
            }
        );
        assert_eq!(records[0].zone.as_deref(), Some("example.com"));
        assert_eq!(records[0].subdomain.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_wildcard_precedence() {
        let zones = zone_store();
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
            .expect("wildcard id");

        // wildcard matches one label
        let records = zones
            .resolve("sub.test.example.com", RecordType::CNAME, false)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].wildcard);
        assert_eq!(records[0].name, "*.test.example.com");

        // exact record shadows the wildcard
        zones
            .add(
                "example.com",
                "other.test",
                RecordType::CNAME,
                &json!(["exact.example.com"]),
                None,
            )
            .await
            .unwrap()
            .expect("exact id");
        let records = zones
            .resolve("other.test.example.com", RecordType::CNAME, false)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].wildcard);
        assert_eq!(
            records[0].value,
            RecordValue::Target {
                target: "exact.example.com".into()
            }
        );
    }

    #[tokio::test]
    async fn test_update_same_name_keeps_id() {
        let zones = zone_store();
        let id = zones
            .add("example.com", "www", RecordType::A, &json!(["1.1.1.1"]), None)
            .await
            .unwrap()
            .unwrap();

        let updated = zones
            .update("example.com", &id, "www", RecordType::A, &json!(["2.2.2.2"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated, id);

        let records = zones
            .resolve("www.example.com", RecordType::A, true)
            .await
            .unwrap();
        assert_eq!(
            records[0].value,
            RecordValue::Address {
                address: "2.2.2.2".into(),
                health_check: None
            }
        );
    }

    #[tokio::test]
    async fn test_update_name_change_changes_id() {
        let zones = zone_store();
        let id = zones
            .add("example.com", "www", RecordType::A, &json!(["1.1.1.1"]), None)
            .await
            .unwrap()
            .unwrap();

        let new_id = zones
            .update("example.com", &id, "web", RecordType::A, &json!(["1.1.1.1"]))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(new_id, id);

        assert!(
            zones
                .resolve("www.example.com", RecordType::A, true)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            zones
                .resolve("web.example.com", RecordType::A, true)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_delete_sweeps_zone_index() {
        let zones = zone_store();
        let id = zones
            .add("example.com", "www", RecordType::A, &json!(["1.1.1.1"]), None)
            .await
            .unwrap()
            .unwrap();

        assert!(zones.delete("example.com", &id).await.unwrap());
        assert!(!zones.delete("example.com", &id).await.unwrap());
        assert!(zones.list("example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_order() {
        let zones = zone_store();
        zones
            .add("example.com", "", RecordType::MX, &json!(["mx1", 10]), None)
            .await
            .unwrap();
        zones
            .add("example.com", "", RecordType::A, &json!(["1.2.3.4"]), None)
            .await
            .unwrap();
        zones
            .add("example.com", "", RecordType::NS, &json!(["ns1.example.com"]), None)
            .await
            .unwrap();

        let records = zones.list("example.com").await.unwrap();
        let types: Vec<RecordType> = records.iter().map(|r| r.rtype).collect();
        assert_eq!(types, vec![RecordType::A, RecordType::MX, RecordType::NS]);
    }

    #[tokio::test]
    async fn test_delete_by_domain_with_value_match() {
        let zones = zone_store();
        zones
            .add("example.com", "txt", RecordType::TXT, &json!(["keep"]), None)
            .await
            .unwrap();
        zones
            .add("example.com", "txt", RecordType::TXT, &json!(["drop"]), None)
            .await
            .unwrap();

        let removed = zones
            .delete_by_domain("txt.example.com", RecordType::TXT, Some(&json!(["drop"])))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let records = zones
            .resolve("txt.example.com", RecordType::TXT, true)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, RecordValue::Txt { data: "keep".into() });
    }

    #[tokio::test]
    async fn test_resolve_zone_longest_suffix() {
        let zones = zone_store();
        zones
            .add("example.com", "", RecordType::A, &json!(["1.2.3.4"]), None)
            .await
            .unwrap();
        zones
            .add("sub.example.com", "", RecordType::A, &json!(["5.6.7.8"]), None)
            .await
            .unwrap();

        assert_eq!(
            zones.resolve_zone("a.sub.example.com").await.unwrap(),
            Some("sub.example.com".to_string())
        );
        assert_eq!(
            zones.resolve_zone("www.example.com").await.unwrap(),
            Some("example.com".to_string())
        );
        assert_eq!(zones.resolve_zone("www.unknown.org").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_health_queue_lifecycle() {
        let zones = zone_store();
        let id = zones
            .add(
                "example.com",
                "",
                RecordType::A,
                &json!(["1.2.3.4", "tcp://1.2.3.4:80"]),
                None,
            )
            .await
            .unwrap()
            .unwrap();

        let store = zones.backing();
        let member = health_member("com.example", &id);
        let due = store.pop_due(HEALTH_QUEUE_KEY, i64::MAX, i64::MAX).await.unwrap();
        assert_eq!(due, Some(member.clone()));

        // clearing the URI drops the queue entry
        zones
            .update("example.com", &id, "", RecordType::A, &json!(["1.2.3.4"]))
            .await
            .unwrap()
            .unwrap();
        let due = store.pop_due(HEALTH_QUEUE_KEY, i64::MAX, i64::MAX).await.unwrap();
        assert_eq!(due, None);
    }
}
