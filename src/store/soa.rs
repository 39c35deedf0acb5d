//! SOA serial maintenance
//!
//! A zone's SOA rdata is seven whitespace-separated tokens:
//! `primary-ns hostmaster serial refresh retry expire minimum`.
//! Bumping increments the serial token; an unparsable serial is replaced
//! by the current unix timestamp. Serial maintenance is observability for
//! zone consumers, not a correctness gate, so every failure here is
//! swallowed after a debug log line.

use chrono::Utc;

use super::{RData, RRSet, Store, Zone};

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

fn bumped_soa_text(data: &str) -> Option<String> {
    let mut parts: Vec<String> = data.split_whitespace().map(str::to_string).collect();
    if parts.len() < 7 {
        return None;
    }
    parts[2] = match parts[2].parse::<i64>() {
        Ok(n) => (n + 1).to_string(),
        Err(_) => unix_now().to_string(),
    };
    Some(parts.join(" "))
}

/// Increment the zone's SOA serial, if the zone has a well-formed SOA.
pub fn bump_soa_serial(store: &Store, zone_id: i64) {
    let soa = match store.rrset_by_type(zone_id, "SOA") {
        Ok(Some(soa)) => soa,
        Ok(None) => return,
        Err(e) => {
            log::debug!("soa bump: lookup failed for zone {}: {}", zone_id, e);
            return;
        }
    };
    bump_existing(store, &soa);
}

/// Like [`bump_soa_serial`], but synthesizes a default SOA when the zone
/// has none and `auto` is set.
pub fn bump_soa_serial_auto(store: &Store, zone: &Zone, auto: bool) {
    let soa = match store.rrset_by_type(zone.id, "SOA") {
        Ok(Some(soa)) if !soa.records.is_empty() => soa,
        Ok(_) => {
            if auto {
                create_default_soa(store, zone);
            }
            return;
        }
        Err(e) => {
            log::debug!("soa bump: lookup failed for zone {}: {}", zone.name, e);
            return;
        }
    };
    bump_existing(store, &soa);
}

fn bump_existing(store: &Store, soa: &RRSet) {
    let first = match soa.records.first() {
        Some(rec) => rec,
        None => return,
    };
    let new_data = match bumped_soa_text(&first.data) {
        Some(data) => data,
        None => return,
    };
    if let Err(e) = store.update_rdata_text(first.id, &new_data) {
        log::debug!("soa bump: write failed for rrset {}: {}", soa.id, e);
    }
}

fn create_default_soa(store: &Store, zone: &Zone) {
    let origin = format!("{}.", zone.name.trim_end_matches('.').to_lowercase());
    let data = format!(
        "ns1.{origin} hostmaster.{origin} {} 7200 3600 1209600 300",
        unix_now()
    );
    let set = RRSet {
        zone_id: zone.id,
        name: origin,
        rtype: "SOA".to_string(),
        ttl: 3600,
        records: vec![RData::plain(&data)],
        ..RRSet::default()
    };
    if let Err(e) = store.create_rrset(&set) {
        log::debug!("soa bump: default soa create failed for {}: {}", zone.name, e);
    }
}

/// The serial token of a zone's SOA, when present and well formed.
pub fn current_serial(store: &Store, zone_id: i64) -> Option<i64> {
    let soa = store.rrset_by_type(zone_id, "SOA").ok()??;
    let first = soa.records.first()?;
    first.data.split_whitespace().nth(2)?.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_zone_with_soa(store: &Store, serial: &str) -> Zone {
        let zone = store.create_zone("adddel.test").unwrap();
        store
            .create_rrset(&RRSet {
                zone_id: zone.id,
                name: "adddel.test.".to_string(),
                rtype: "SOA".to_string(),
                ttl: 3600,
                records: vec![RData::plain(&format!(
                    "ns1.example.com. hostmaster.example.com. {} 7200 3600 1209600 300",
                    serial
                ))],
                ..RRSet::default()
            })
            .unwrap();
        zone
    }

    #[test]
    fn test_bump_increments_serial() {
        let store = Store::open_in_memory().unwrap();
        let zone = seed_zone_with_soa(&store, "2025010101");

        bump_soa_serial(&store, zone.id);
        assert_eq!(current_serial(&store, zone.id), Some(2025010102));

        bump_soa_serial(&store, zone.id);
        assert_eq!(current_serial(&store, zone.id), Some(2025010103));
    }

    #[test]
    fn test_unparsable_serial_becomes_timestamp() {
        let store = Store::open_in_memory().unwrap();
        let zone = seed_zone_with_soa(&store, "not-a-number");

        let before = unix_now();
        bump_soa_serial(&store, zone.id);
        let serial = current_serial(&store, zone.id).unwrap();
        assert!(serial >= before);
    }

    #[test]
    fn test_short_soa_left_alone() {
        let store = Store::open_in_memory().unwrap();
        let zone = store.create_zone("short.test").unwrap();
        store
            .create_rrset(&RRSet {
                zone_id: zone.id,
                name: "short.test.".to_string(),
                rtype: "SOA".to_string(),
                ttl: 3600,
                records: vec![RData::plain("only three tokens")],
                ..RRSet::default()
            })
            .unwrap();

        bump_soa_serial(&store, zone.id);
        let soa = store.rrset_by_type(zone.id, "SOA").unwrap().unwrap();
        assert_eq!(soa.records[0].data, "only three tokens");
    }

    #[test]
    fn test_auto_creates_default_soa() {
        let store = Store::open_in_memory().unwrap();
        let zone = store.create_zone("fresh.test").unwrap();

        bump_soa_serial_auto(&store, &zone, true);

        let soa = store.rrset_by_type(zone.id, "SOA").unwrap().unwrap();
        assert_eq!(soa.name, "fresh.test.");
        assert_eq!(soa.ttl, 3600);
        let tokens: Vec<&str> = soa.records[0].data.split_whitespace().collect();
        assert_eq!(tokens.len(), 7);
        assert_eq!(tokens[0], "ns1.fresh.test.");
        assert_eq!(tokens[1], "hostmaster.fresh.test.");
        assert_eq!(tokens[3], "7200");
        assert_eq!(tokens[6], "300");
    }

    #[test]
    fn test_no_auto_no_soa() {
        let store = Store::open_in_memory().unwrap();
        let zone = store.create_zone("bare.test").unwrap();

        bump_soa_serial_auto(&store, &zone, false);
        assert!(store.rrset_by_type(zone.id, "SOA").unwrap().is_none());
    }
}
