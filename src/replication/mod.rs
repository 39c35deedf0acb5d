//! Master/slave replication
//!
//! The slave pulls; the master never pushes. On an interval the slave
//! fetches the full `{zones, templates}` snapshot from the master's
//! `/sync/export` and feeds it through its own HTTP service's
//! `/sync/import`, which lands in [`apply_snapshot`]: one transaction
//! that upserts each zone by name and replaces its rrsets wholesale,
//! dropping any locally-created rrsets in replicated zones. A failed
//! cycle leaves the previous state intact and is retried on the next
//! tick.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::dns::context::ShutdownSignal;
use crate::store::{Store, StoreError, Template, Zone};

#[derive(Debug, Display, From, Error)]
pub enum SyncError {
    Http(reqwest::Error),
    Store(StoreError),
    Json(serde_json::Error),
    #[display(fmt = "master returned status {}: {}", _0, _1)]
    #[from(ignore)]
    BadStatus(#[error(not(source))] u16, #[error(not(source))] String),
}

type Result<T> = std::result::Result<T, SyncError>;

/// The full replication document exchanged between master and slave.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub templates: Vec<Template>,
}

/// Collect every zone (rrsets and rdata preloaded) and template.
pub fn export_snapshot(store: &Store) -> Result<Snapshot> {
    let mut zones = store.zones()?;
    for zone in &mut zones {
        zone.rrsets = store.rrsets_for_zone(zone.id)?;
    }
    let templates = store.templates()?;
    Ok(Snapshot { zones, templates })
}

/// Apply a snapshot transactionally: all zones and templates land, or
/// nothing changes.
pub fn apply_snapshot(store: &Store, snapshot: &Snapshot) -> Result<()> {
    let mut tx = store.begin()?;
    let mut replaced_rrsets = 0u64;

    for zone in &snapshot.zones {
        let existing = match tx.find_zone(&zone.name)? {
            Some(existing) => existing,
            None => tx.create_zone(&zone.name)?,
        };

        replaced_rrsets += tx.delete_zone_rrsets(existing.id)?;

        for rrset in &zone.rrsets {
            // Re-keyed under the local zone; incoming identities are
            // dropped on insert.
            let mut fresh = rrset.clone();
            fresh.zone_id = existing.id;
            tx.create_rrset(&fresh)?;
        }
    }

    for tmpl in &snapshot.templates {
        let existing = match tx.find_template(&tmpl.name)? {
            Some(existing) => {
                tx.update_template_description(existing.id, &tmpl.description)?;
                existing
            }
            None => tx.create_template(&tmpl.name, &tmpl.description)?,
        };

        tx.delete_template_records(existing.id)?;
        for rec in &tmpl.records {
            tx.create_template_record(existing.id, rec)?;
        }
    }

    tx.commit()?;
    log::info!(
        "sync apply: {} zones ({} rrsets replaced), {} templates",
        snapshot.zones.len(),
        replaced_rrsets,
        snapshot.templates.len()
    );
    Ok(())
}

/// Slave-side client that pulls from the master and feeds the local
/// import endpoint.
pub struct SyncClient {
    config: Arc<Config>,
    http: reqwest::blocking::Client,
}

impl SyncClient {
    pub fn new(config: Arc<Config>) -> SyncClient {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        SyncClient { config, http }
    }

    fn sync_token(&self) -> &str {
        if self.config.replication.api_token.is_empty() {
            &self.config.api_token
        } else {
            &self.config.replication.api_token
        }
    }

    /// GET the snapshot from the master.
    pub fn fetch(&self) -> Result<Snapshot> {
        let url = format!("{}/sync/export", self.config.replication.master_url);
        let mut request = self.http.get(&url);
        let token = self.sync_token();
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SyncError::BadStatus(status.as_u16(), body));
        }
        Ok(response.json()?)
    }

    /// POST the snapshot to the local import endpoint so the slave and
    /// the management API share one apply path.
    pub fn apply_via_local_api(&self, snapshot: &Snapshot) -> Result<()> {
        let url = format!("http://{}/sync/import", self.config.rest_listen);
        let mut request = self.http.post(&url).json(snapshot);
        if !self.config.api_token.is_empty() {
            request = request.bearer_auth(&self.config.api_token);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SyncError::BadStatus(status.as_u16(), body));
        }
        Ok(())
    }

    pub fn sync_once(&self) -> Result<()> {
        let snapshot = self.fetch()?;
        log::info!(
            "sync fetch: {} zones, {} templates from {}",
            snapshot.zones.len(),
            snapshot.templates.len(),
            self.config.replication.master_url
        );
        self.apply_via_local_api(&snapshot)
    }
}

/// Sleep in short slices so shutdown is observed promptly.
fn interruptible_sleep(total: Duration, shutdown: &ShutdownSignal) {
    let slice = Duration::from_millis(200);
    let mut remaining = total;
    while remaining > Duration::ZERO && !shutdown.is_triggered() {
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

/// Run the periodic pull loop on its own thread. The first sync runs
/// after a short delay so the local HTTP service can bind.
pub fn start_periodic_sync(
    config: Arc<Config>,
    shutdown: ShutdownSignal,
) -> std::io::Result<JoinHandle<()>> {
    let interval = Duration::from_secs(config.replication.sync_interval_sec);
    thread::Builder::new()
        .name("replication-sync".to_string())
        .spawn(move || {
            let client = SyncClient::new(config);
            log::info!("replication: slave mode, syncing every {:?}", interval);

            interruptible_sleep(Duration::from_secs(2), &shutdown);
            if shutdown.is_triggered() {
                return;
            }
            if let Err(e) = client.sync_once() {
                log::warn!("replication: initial sync failed: {}", e);
            }

            loop {
                interruptible_sleep(interval, &shutdown);
                if shutdown.is_triggered() {
                    log::info!("replication: stopping sync loop");
                    return;
                }
                if let Err(e) = client.sync_once() {
                    log::warn!("replication: sync failed: {}", e);
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RData, RRSet, TemplateRecord};

    fn seed_master() -> Store {
        let store = Store::open_in_memory().unwrap();
        let zone = store.create_zone("geodns.test").unwrap();
        store
            .create_rrset(&RRSet {
                zone_id: zone.id,
                name: "svc.geodns.test.".to_string(),
                rtype: "A".to_string(),
                ttl: 60,
                records: vec![
                    RData {
                        data: "198.51.100.11".to_string(),
                        country: Some("US".to_string()),
                        ..RData::default()
                    },
                    RData::plain("198.51.100.12"),
                ],
                ..RRSet::default()
            })
            .unwrap();
        store
            .create_rrset(&RRSet {
                zone_id: zone.id,
                name: "geodns.test.".to_string(),
                rtype: "SOA".to_string(),
                ttl: 3600,
                records: vec![RData::plain(
                    "ns1.geodns.test. hostmaster.geodns.test. 7 7200 3600 1209600 300",
                )],
                ..RRSet::default()
            })
            .unwrap();
        store
    }

    /// Zone/rrset/rdata state with identity columns erased, for
    /// comparing stores.
    fn observable_state(store: &Store) -> Vec<(String, String, String, u32, Vec<RData>)> {
        let mut out = Vec::new();
        let mut zones = store.zones().unwrap();
        zones.sort_by(|a, b| a.name.cmp(&b.name));
        for zone in zones {
            let mut sets = store.rrsets_for_zone(zone.id).unwrap();
            sets.sort_by(|a, b| (a.name.clone(), a.rtype.clone()).cmp(&(b.name.clone(), b.rtype.clone())));
            for set in sets {
                let records: Vec<RData> = set
                    .records
                    .iter()
                    .map(|r| RData {
                        id: 0,
                        rrset_id: 0,
                        ..r.clone()
                    })
                    .collect();
                out.push((zone.name.clone(), set.name, set.rtype, set.ttl, records));
            }
        }
        out
    }

    #[test]
    fn test_export_wipe_apply_roundtrip() {
        let master = seed_master();
        let snapshot = export_snapshot(&master).unwrap();
        let expected = observable_state(&master);

        let slave = Store::open_in_memory().unwrap();
        apply_snapshot(&slave, &snapshot).unwrap();

        assert_eq!(observable_state(&slave), expected);
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let master = seed_master();
        let snapshot = export_snapshot(&master).unwrap();

        let slave = Store::open_in_memory().unwrap();
        apply_snapshot(&slave, &snapshot).unwrap();
        let after_first = observable_state(&slave);

        apply_snapshot(&slave, &snapshot).unwrap();
        assert_eq!(observable_state(&slave), after_first);
    }

    #[test]
    fn test_local_only_rrsets_are_replaced() {
        let master = seed_master();
        let snapshot = export_snapshot(&master).unwrap();

        let slave = Store::open_in_memory().unwrap();
        let zone = slave.create_zone("geodns.test").unwrap();
        slave
            .create_rrset(&RRSet {
                zone_id: zone.id,
                name: "local-only.geodns.test.".to_string(),
                rtype: "A".to_string(),
                ttl: 60,
                records: vec![RData::plain("10.0.0.1")],
                ..RRSet::default()
            })
            .unwrap();

        apply_snapshot(&slave, &snapshot).unwrap();

        // The zone was upserted by name and its rrsets replaced
        // wholesale, dropping the local-only one.
        assert!(slave
            .rrset(zone.id, "local-only.geodns.test.", "A")
            .unwrap()
            .is_none());
        assert!(slave
            .rrset(zone.id, "svc.geodns.test.", "A")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_templates_upsert_and_replace_records() {
        let master = Store::open_in_memory().unwrap();
        {
            let mut tx = master.begin().unwrap();
            let tmpl = tx.create_template("web-basic", "standard web records").unwrap();
            tx.create_template_record(
                tmpl.id,
                &TemplateRecord {
                    name: "www".to_string(),
                    rtype: "A".to_string(),
                    ttl: 300,
                    data: "192.0.2.80".to_string(),
                    ..TemplateRecord::default()
                },
            )
            .unwrap();
            tx.commit().unwrap();
        }

        let snapshot = export_snapshot(&master).unwrap();
        let slave = Store::open_in_memory().unwrap();

        // Pre-seed a stale version of the template.
        {
            let mut tx = slave.begin().unwrap();
            let tmpl = tx.create_template("web-basic", "old description").unwrap();
            tx.create_template_record(
                tmpl.id,
                &TemplateRecord {
                    name: "stale".to_string(),
                    rtype: "A".to_string(),
                    ttl: 300,
                    data: "203.0.113.1".to_string(),
                    ..TemplateRecord::default()
                },
            )
            .unwrap();
            tx.commit().unwrap();
        }

        apply_snapshot(&slave, &snapshot).unwrap();

        let templates = slave.templates().unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].description, "standard web records");
        assert_eq!(templates[0].records.len(), 1);
        assert_eq!(templates[0].records[0].name, "www");
    }

    #[test]
    fn test_snapshot_json_shape() {
        let master = seed_master();
        let snapshot = export_snapshot(&master).unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();

        // The wire format uses "type" for record types and omits unset
        // selector fields.
        let rrsets = json["zones"][0]["rrsets"].as_array().unwrap();
        assert!(rrsets.iter().any(|s| s["type"] == "A"));
        let a_set = rrsets.iter().find(|s| s["type"] == "A").unwrap();
        let generic = a_set["records"]
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["data"] == "198.51.100.12")
            .unwrap();
        assert!(generic.get("country").is_none());

        let reparsed: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(reparsed.zones.len(), snapshot.zones.len());
    }
}
