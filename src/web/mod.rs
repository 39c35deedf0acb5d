//! Management and replication HTTP API
//!
//! A small `tiny_http` service carrying zone/rrset CRUD for operators
//! and the two replication endpoints the serving core depends on:
//! `GET /sync/export` (consumed by slaves) and `POST /sync/import`
//! (the slave's own apply path). Everything except `/health` is guarded
//! by a bearer token when one is configured.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server};

use crate::dns::context::ServerContext;
use crate::replication::{apply_snapshot, export_snapshot, Snapshot};
use crate::store::{soa, RData, RRSet};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Start the HTTP service on `rest_listen`. Returns the join handle and
/// the bound address (useful when the port is 0).
pub fn start(context: Arc<ServerContext>) -> std::io::Result<(JoinHandle<()>, SocketAddr)> {
    let server = Server::http(&context.config.rest_listen).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::AddrInUse, e.to_string())
    })?;
    let addr = server
        .server_addr()
        .to_ip()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no ip listen address"))?;
    log::info!("api listening on {}", addr);

    let handle = Builder::new().name("api-http".to_string()).spawn(move || {
        loop {
            if context.shutdown.is_triggered() {
                return;
            }
            let request = match server.recv_timeout(POLL_INTERVAL) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("api: receive failed: {}", e);
                    continue;
                }
            };
            handle_request(&context, request);
        }
    })?;

    Ok((handle, addr))
}

fn json_response(status: u16, body: serde_json::Value) -> Response<std::io::Cursor<Vec<u8>>> {
    let header = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("static header is valid");
    Response::from_string(body.to_string())
        .with_status_code(status)
        .with_header(header)
}

fn respond(request: Request, status: u16, body: serde_json::Value) {
    let method = request.method().clone();
    let url = request.url().to_string();
    if let Err(e) = request.respond(json_response(status, body)) {
        log::info!("api: failed to respond to {} {}: {}", method, url, e);
    } else {
        log::info!("api {} {} {}", method, url, status);
    }
}

fn authorized(context: &ServerContext, request: &Request) -> bool {
    if context.config.api_token.is_empty() {
        return true;
    }
    request
        .headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case("Authorization"))
        .map(|h| {
            let value = h.value.as_str();
            value.strip_prefix("Bearer ").map(str::trim) == Some(context.config.api_token.as_str())
        })
        .unwrap_or(false)
}

fn read_body(request: &mut Request) -> Option<String> {
    let mut body = String::new();
    request.as_reader().read_to_string(&mut body).ok()?;
    Some(body)
}

fn handle_request(context: &ServerContext, mut request: Request) {
    let method = request.method().clone();
    let path = request.url().split('?').next().unwrap_or("").to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if method == Method::Get && segments == ["health"] {
        return health(context, request);
    }

    if !authorized(context, &request) {
        return respond(request, 401, json!({"error": "unauthorized"}));
    }

    match (method, segments.as_slice()) {
        (Method::Post, ["zones"]) => create_zone(context, request),
        (Method::Get, ["zones"]) => list_zones(context, request),
        (Method::Get, ["zones", id]) => {
            let id = id.parse().unwrap_or(-1);
            get_zone(context, request, id)
        }
        (Method::Delete, ["zones", id]) => {
            let id = id.parse().unwrap_or(-1);
            delete_zone(context, request, id)
        }
        (Method::Post, ["zones", id, "rrsets"]) => {
            let id = id.parse().unwrap_or(-1);
            create_rrset(context, request, id)
        }
        (Method::Get, ["zones", id, "rrsets"]) => {
            let id = id.parse().unwrap_or(-1);
            list_rrsets(context, request, id)
        }
        (Method::Put, ["zones", id, "rrsets", rid])
        | (Method::Patch, ["zones", id, "rrsets", rid]) => {
            let id = id.parse().unwrap_or(-1);
            let rid = rid.parse().unwrap_or(-1);
            update_rrset(context, request, id, rid)
        }
        (Method::Delete, ["zones", id, "rrsets", rid]) => {
            let id = id.parse().unwrap_or(-1);
            let rid = rid.parse().unwrap_or(-1);
            delete_rrset(context, request, id, rid)
        }
        (Method::Get, ["sync", "export"]) => sync_export(context, request),
        (Method::Post, ["sync", "import"]) => sync_import(context, request),
        _ => respond(request, 404, json!({"error": "not found"})),
    }
}

fn health(context: &ServerContext, request: Request) {
    match context.store.zones() {
        Ok(_) => respond(request, 200, json!({"status": "ok", "db": "ok"})),
        Err(_) => respond(
            request,
            503,
            json!({"status": "degraded", "db": "unreachable"}),
        ),
    }
}

#[derive(Deserialize)]
struct ZoneReq {
    name: String,
}

fn create_zone(context: &ServerContext, mut request: Request) {
    let parsed = read_body(&mut request)
        .and_then(|body| serde_json::from_str::<ZoneReq>(&body).ok())
        .filter(|req| !req.name.is_empty());
    let req = match parsed {
        Some(req) => req,
        None => return respond(request, 400, json!({"error": "invalid payload"})),
    };

    match context.store.create_zone(&req.name) {
        Ok(zone) => respond(request, 201, serde_json::to_value(&zone).unwrap_or_default()),
        Err(e) => respond(request, 400, json!({"error": e.to_string()})),
    }
}

fn list_zones(context: &ServerContext, request: Request) {
    match context.store.zones() {
        Ok(zones) => respond(request, 200, serde_json::to_value(&zones).unwrap_or_default()),
        Err(e) => respond(request, 500, json!({"error": e.to_string()})),
    }
}

fn get_zone(context: &ServerContext, request: Request, id: i64) {
    let zone = match context.store.zone_by_id(id) {
        Ok(Some(mut zone)) => {
            zone.rrsets = context.store.rrsets_for_zone(zone.id).unwrap_or_default();
            zone
        }
        _ => return respond(request, 404, json!({"error": "not found"})),
    };
    respond(request, 200, serde_json::to_value(&zone).unwrap_or_default())
}

fn delete_zone(context: &ServerContext, request: Request, id: i64) {
    match context.store.zone_by_id(id) {
        Ok(Some(zone)) => match context.store.delete_zone(zone.id) {
            Ok(()) => respond(request, 204, json!({})),
            Err(e) => respond(request, 500, json!({"error": e.to_string()})),
        },
        _ => respond(request, 404, json!({"error": "not found"})),
    }
}

#[derive(Deserialize)]
struct RRSetReq {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    rtype: String,
    #[serde(default)]
    ttl: u32,
    #[serde(default)]
    records: Vec<RData>,
}

/// Owner name for a zone-relative label: empty or `@` addresses the
/// apex, anything else is prefixed onto the zone.
fn owner_fqdn(name: &str, zone: &str) -> String {
    let name = name.trim_end_matches('.').to_lowercase();
    let zone = zone.trim_end_matches('.').to_lowercase();
    if name.is_empty() || name == "@" {
        format!("{}.", zone)
    } else if name == zone || name.ends_with(&format!(".{}", zone)) {
        format!("{}.", name)
    } else {
        format!("{}.{}.", name, zone)
    }
}

fn normalize_selector(value: Option<String>) -> Option<String> {
    let value = value?.trim().to_uppercase();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

impl RRSetReq {
    fn normalized_records(&self) -> Vec<RData> {
        self.records
            .iter()
            .map(|rec| RData {
                id: 0,
                rrset_id: 0,
                data: rec.data.trim().to_string(),
                country: normalize_selector(rec.country.clone()),
                continent: normalize_selector(rec.continent.clone()),
                asn: rec.asn,
                subnet: normalize_selector(rec.subnet.clone()),
            })
            .collect()
    }
}

fn create_rrset(context: &ServerContext, mut request: Request, zone_id: i64) {
    let zone = match context.store.zone_by_id(zone_id) {
        Ok(Some(zone)) => zone,
        _ => return respond(request, 404, json!({"error": "zone not found"})),
    };
    let req = match read_body(&mut request)
        .and_then(|body| serde_json::from_str::<RRSetReq>(&body).ok())
    {
        Some(req) => req,
        None => return respond(request, 400, json!({"error": "invalid payload"})),
    };

    let mut ttl = req.ttl;
    if ttl == 0 && context.config.default_ttl > 0 {
        ttl = context.config.default_ttl;
    }

    let set = RRSet {
        zone_id: zone.id,
        name: owner_fqdn(&req.name, &zone.name),
        rtype: req.rtype.to_uppercase(),
        ttl,
        records: req.normalized_records(),
        ..RRSet::default()
    };

    match context.store.create_rrset(&set) {
        Ok(created) => {
            soa::bump_soa_serial_auto(&context.store, &zone, context.config.auto_soa_on_missing);
            respond(request, 201, serde_json::to_value(&created).unwrap_or_default())
        }
        Err(e) => respond(request, 400, json!({"error": e.to_string()})),
    }
}

fn list_rrsets(context: &ServerContext, request: Request, zone_id: i64) {
    match context.store.rrsets_for_zone(zone_id) {
        Ok(sets) => respond(request, 200, serde_json::to_value(&sets).unwrap_or_default()),
        Err(e) => respond(request, 500, json!({"error": e.to_string()})),
    }
}

fn update_rrset(context: &ServerContext, mut request: Request, zone_id: i64, rrset_id: i64) {
    let zone = match context.store.zone_by_id(zone_id) {
        Ok(Some(zone)) => zone,
        _ => return respond(request, 404, json!({"error": "zone not found"})),
    };
    let existing = match context.store.rrset_by_id(zone.id, rrset_id) {
        Ok(Some(set)) => set,
        _ => return respond(request, 404, json!({"error": "rrset not found"})),
    };
    let req = match read_body(&mut request)
        .and_then(|body| serde_json::from_str::<RRSetReq>(&body).ok())
    {
        Some(req) => req,
        None => return respond(request, 400, json!({"error": "invalid payload"})),
    };

    let mut ttl = req.ttl;
    if ttl == 0 && context.config.default_ttl > 0 {
        ttl = context.config.default_ttl;
    }

    let set = RRSet {
        id: existing.id,
        zone_id: zone.id,
        name: owner_fqdn(&req.name, &zone.name),
        rtype: req.rtype.to_uppercase(),
        ttl,
        records: req.normalized_records(),
    };

    match context.store.replace_rrset(&set) {
        Ok(()) => {
            soa::bump_soa_serial_auto(&context.store, &zone, context.config.auto_soa_on_missing);
            respond(request, 200, serde_json::to_value(&set).unwrap_or_default())
        }
        Err(e) => respond(request, 500, json!({"error": e.to_string()})),
    }
}

fn delete_rrset(context: &ServerContext, request: Request, zone_id: i64, rrset_id: i64) {
    let zone = match context.store.zone_by_id(zone_id) {
        Ok(Some(zone)) => zone,
        _ => return respond(request, 404, json!({"error": "zone not found"})),
    };
    match context.store.delete_rrset(zone.id, rrset_id) {
        Ok(()) => {
            soa::bump_soa_serial(&context.store, zone.id);
            respond(request, 204, json!({}))
        }
        Err(e) => respond(request, 500, json!({"error": e.to_string()})),
    }
}

fn sync_export(context: &ServerContext, request: Request) {
    match export_snapshot(&context.store) {
        Ok(snapshot) => respond(
            request,
            200,
            serde_json::to_value(&snapshot).unwrap_or_default(),
        ),
        Err(e) => respond(request, 500, json!({"error": e.to_string()})),
    }
}

fn sync_import(context: &ServerContext, mut request: Request) {
    let snapshot = match read_body(&mut request)
        .and_then(|body| serde_json::from_str::<Snapshot>(&body).ok())
    {
        Some(snapshot) => snapshot,
        None => return respond(request, 400, json!({"error": "invalid payload"})),
    };

    match apply_snapshot(&context.store, &snapshot) {
        Ok(()) => respond(
            request,
            200,
            json!({
                "status": "ok",
                "zones": snapshot.zones.len(),
                "templates": snapshot.templates.len(),
            }),
        ),
        Err(e) => respond(request, 500, json!({"error": e.to_string()})),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::context::tests::create_test_context;

    #[test]
    fn test_owner_fqdn() {
        assert_eq!(owner_fqdn("svc", "geodns.test"), "svc.geodns.test.");
        assert_eq!(owner_fqdn("@", "geodns.test"), "geodns.test.");
        assert_eq!(owner_fqdn("", "geodns.test"), "geodns.test.");
        assert_eq!(owner_fqdn("SVC.Geodns.Test.", "geodns.test"), "svc.geodns.test.");
        assert_eq!(owner_fqdn("geodns.test", "geodns.test"), "geodns.test.");
    }

    #[test]
    fn test_normalize_selector() {
        assert_eq!(normalize_selector(Some("us".to_string())), Some("US".to_string()));
        assert_eq!(normalize_selector(Some("  ".to_string())), None);
        assert_eq!(normalize_selector(None), None);
    }

    #[test]
    fn test_http_roundtrip() {
        let mut context = create_test_context();
        context.config.api_token = "devtoken".to_string();
        context.config.rest_listen = "127.0.0.1:0".to_string();
        let shutdown = context.shutdown.clone();
        let context = Arc::new(context);

        let (handle, addr) = start(context.clone()).unwrap();
        let base = format!("http://{}", addr);
        let http = reqwest::blocking::Client::new();

        // Health is open.
        let resp = http.get(format!("{}/health", base)).send().unwrap();
        assert_eq!(resp.status().as_u16(), 200);

        // Token required elsewhere.
        let resp = http.get(format!("{}/zones", base)).send().unwrap();
        assert_eq!(resp.status().as_u16(), 401);

        // Create a zone and an rrset.
        let resp = http
            .post(format!("{}/zones", base))
            .bearer_auth("devtoken")
            .json(&json!({"name": "geodns.test"}))
            .send()
            .unwrap();
        assert_eq!(resp.status().as_u16(), 201);
        let zone: serde_json::Value = resp.json().unwrap();
        let zone_id = zone["id"].as_i64().unwrap();

        let resp = http
            .post(format!("{}/zones/{}/rrsets", base, zone_id))
            .bearer_auth("devtoken")
            .json(&json!({
                "name": "svc",
                "type": "a",
                "ttl": 60,
                "records": [
                    {"data": "198.51.100.11", "country": "us"},
                    {"data": "198.51.100.12"}
                ]
            }))
            .send()
            .unwrap();
        assert_eq!(resp.status().as_u16(), 201);
        let set: serde_json::Value = resp.json().unwrap();
        assert_eq!(set["name"], "svc.geodns.test.");
        assert_eq!(set["type"], "A");
        assert_eq!(set["records"][0]["country"], "US");

        // Export, then re-import into the same server (idempotent).
        let resp = http
            .get(format!("{}/sync/export", base))
            .bearer_auth("devtoken")
            .send()
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let snapshot: serde_json::Value = resp.json().unwrap();
        assert_eq!(snapshot["zones"][0]["name"], "geodns.test");

        let resp = http
            .post(format!("{}/sync/import", base))
            .bearer_auth("devtoken")
            .json(&snapshot)
            .send()
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: serde_json::Value = resp.json().unwrap();
        assert_eq!(body["zones"], 1);

        shutdown.trigger();
        handle.join().unwrap();
    }
}
