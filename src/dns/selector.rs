//! Geo-aware rdata selection
//!
//! Each candidate record is tested against the client exactly once, in
//! priority order: subnet, then ASN, then country, then continent, then
//! generic (no selector at all). The record lands in the bucket of the
//! first test it passes; records that pass none are discarded. The answer
//! is the highest-priority non-empty bucket. First-match-per-record keeps
//! a record tagged for one country from leaking to clients in another
//! just because nothing broader exists.

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::geo::Info;
use crate::store::RData;

/// Select the records to answer with and name the rule that chose them.
/// Rules: `none`, `generic`, `subnet`, `asn`, `country`, `continent`,
/// `all` (fail-open when nothing matched).
pub fn select_geo_records(
    records: &[RData],
    client_ip: Option<IpAddr>,
    info: &Info,
) -> (Vec<RData>, &'static str) {
    if records.is_empty() {
        return (Vec::new(), "none");
    }

    // Without a client address only untagged records are safe to serve.
    let ip = match client_ip {
        Some(ip) => ip,
        None => {
            let generic: Vec<RData> = records
                .iter()
                .filter(|r| r.is_generic())
                .cloned()
                .collect();
            if !generic.is_empty() {
                return (generic, "generic");
            }
            return (records.to_vec(), "all");
        }
    };

    let mut subnet_match = Vec::new();
    let mut asn_match = Vec::new();
    let mut country_match = Vec::new();
    let mut continent_match = Vec::new();
    let mut generic = Vec::new();

    for rec in records {
        if let Some(subnet) = rec.subnet.as_deref() {
            if let Ok(network) = subnet.parse::<IpNetwork>() {
                if network.contains(ip) {
                    subnet_match.push(rec.clone());
                    continue;
                }
            }
        }
        if let Some(asn) = rec.asn {
            if info.asn != 0 && asn == info.asn as i64 {
                asn_match.push(rec.clone());
                continue;
            }
        }
        if let Some(country) = rec.country.as_deref() {
            if !info.country.is_empty() && country.eq_ignore_ascii_case(&info.country) {
                country_match.push(rec.clone());
                continue;
            }
        }
        if let Some(continent) = rec.continent.as_deref() {
            if !info.continent.is_empty() && continent.eq_ignore_ascii_case(&info.continent) {
                continent_match.push(rec.clone());
                continue;
            }
        }
        if rec.is_generic() {
            generic.push(rec.clone());
        }
    }

    if !subnet_match.is_empty() {
        return (subnet_match, "subnet");
    }
    if !asn_match.is_empty() {
        return (asn_match, "asn");
    }
    if !country_match.is_empty() {
        return (country_match, "country");
    }
    if !continent_match.is_empty() {
        return (continent_match, "continent");
    }
    if !generic.is_empty() {
        return (generic, "generic");
    }
    (records.to_vec(), "all")
}
