//! Geo-scoped answer cache
//!
//! A bounded map from `qname|qtype|client-scope` to a pre-built reply
//! message. Scoping the key by client IP keeps geo-selected answers from
//! leaking between clients in different locations. Eviction is
//! deliberately naive: when the map is full, whatever entry the iterator
//! yields first is dropped. The pipeline clones on store and on hit, so
//! cached packets are never mutated in place.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::dns::protocol::{DnsPacket, QueryType};

struct CacheEntry {
    packet: DnsPacket,
    expires_at: Instant,
}

/// Thread-safe bounded TTL cache for reply messages.
pub struct AnswerCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    capacity: usize,
}

/// Compose the cache key for a question and client scope. An unknown
/// client IP scopes to the empty string.
pub fn cache_key(qname: &str, qtype: QueryType, client_ip: Option<IpAddr>) -> String {
    let scope = client_ip.map(|ip| ip.to_string()).unwrap_or_default();
    format!("{}|{}|{}", qname.to_lowercase(), qtype.to_num(), scope)
}

impl AnswerCache {
    pub fn new(capacity: usize) -> AnswerCache {
        AnswerCache {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
            capacity,
        }
    }

    /// Insert a reply with a lifetime of `ttl_secs`. A TTL of zero or
    /// less produces an entry that is already expired.
    pub fn set(&self, key: &str, packet: DnsPacket, ttl_secs: i64) {
        let mut entries = self.entries.write();

        if entries.len() >= self.capacity {
            if let Some(victim) = entries.keys().next().cloned() {
                entries.remove(&victim);
            }
            if self.capacity == 0 {
                return;
            }
        }

        let now = Instant::now();
        let expires_at = if ttl_secs > 0 {
            now + Duration::from_secs(ttl_secs as u64)
        } else {
            now
        };

        entries.insert(key.to_string(), CacheEntry { packet, expires_at });
    }

    /// Fetch a live entry, removing it when expired.
    pub fn get(&self, key: &str) -> Option<DnsPacket> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if Instant::now() < entry.expires_at => {
                    return Some(entry.packet.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: upgrade to a write lock and drop it.
        self.entries.write().remove(key);
        None
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::{DnsQuestion, DnsRecord, RData};
    use std::thread::sleep;

    fn reply(id: u16) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = id;
        packet.header.response = true;
        packet
            .questions
            .push(DnsQuestion::new("svc.geodns.test.".to_string(), QueryType::A));
        packet.answers.push(DnsRecord::new(
            "svc.geodns.test",
            QueryType::A,
            60,
            RData::A("198.51.100.13".parse().unwrap()),
        ));
        packet
    }

    #[test]
    fn test_set_and_get() {
        let cache = AnswerCache::new(16);
        let key = cache_key("SVC.geodns.test.", QueryType::A, Some("8.8.8.8".parse().unwrap()));
        assert_eq!(key, "svc.geodns.test.|1|8.8.8.8");

        cache.set(&key, reply(111), 60);
        let hit = cache.get(&key).expect("expected hit");
        assert_eq!(hit.header.id, 111);
        assert_eq!(hit.answers.len(), 1);
    }

    #[test]
    fn test_scope_separates_clients() {
        let cache = AnswerCache::new(16);
        let us = cache_key("svc.geodns.test.", QueryType::A, Some("8.8.8.8".parse().unwrap()));
        let none = cache_key("svc.geodns.test.", QueryType::A, None);

        cache.set(&us, reply(1), 60);
        assert_eq!(cache.get(&us).map(|p| p.header.id), Some(1));
        assert!(cache.get(&none).is_none());
    }

    #[test]
    fn test_expiry() {
        let cache = AnswerCache::new(16);
        cache.set("k", reply(1), 0);
        sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());

        cache.set("neg", reply(2), -30);
        sleep(Duration::from_millis(5));
        assert!(cache.get("neg").is_none());
        // Expired entries are removed by the failed lookup.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_zero() {
        let cache = AnswerCache::new(0);
        cache.set("k", reply(1), 60);
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_eviction_bounds_size() {
        let cache = AnswerCache::new(4);
        for i in 0..32 {
            cache.set(&format!("key-{}", i), reply(i as u16), 60);
        }
        assert!(cache.len() <= 4);
    }
}
