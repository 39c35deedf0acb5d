//! Dynamic update processing (RFC 2136, simplified)
//!
//! The update section is applied inside a single store transaction:
//! either every operation lands or none does. Prerequisites are not
//! implemented. The record class selects the operation:
//!
//! * `ANY` + type `ANY` - delete every rrset at the owner name
//! * `ANY` + concrete type - delete that rrset
//! * `NONE` - delete the rdata whose text matches the record's
//! * `IN` - ensure the rrset exists and append the rdata
//!
//! A successful commit is followed by a best-effort SOA serial bump.

use derive_more::{Display, Error, From};

use crate::dns::context::ServerContext;
use crate::dns::protocol::{
    fqdn, DnsPacket, QueryType, ResultCode, CLASS_ANY, CLASS_NONE,
};
use crate::dns::tsig;
use crate::store::{soa, RData, RRSet, StoreError};

#[derive(Debug, Display, From, Error)]
enum UpdateError {
    Store(StoreError),
    #[display(fmt = "name outside zone: {}", _0)]
    #[from(ignore)]
    NameOutsideZone(#[error(not(source))] String),
}

/// Process an UPDATE message and build the reply. `raw` is the message
/// as received, needed for TSIG verification.
pub fn handle_update(context: &ServerContext, request: &DnsPacket, raw: &[u8]) -> DnsPacket {
    let mut reply = DnsPacket::reply_to(request);
    let cfg = &context.config.update;

    if !cfg.enabled {
        reply.header.rescode = ResultCode::REFUSED;
        return reply;
    }

    if cfg.require_tsig && request.tsig().is_none() {
        log::info!("dns update refused: unsigned, id={}", request.header.id);
        reply.header.rescode = ResultCode::NOTAUTH;
        return reply;
    }

    if !cfg.tsig_secrets.is_empty() {
        if let Err(e) = tsig::verify_request(raw, &cfg.tsig_secrets, tsig::unix_now()) {
            log::info!("dns update notauth: {} id={}", e, request.header.id);
            reply.header.rescode = ResultCode::NOTAUTH;
            return reply;
        }
    }

    // The question section carries the zone for UPDATE.
    let zone_section = match request.questions.first() {
        Some(q) => q,
        None => {
            reply.header.rescode = ResultCode::FORMERR;
            return reply;
        }
    };
    let zname = fqdn(&zone_section.name.to_lowercase());

    let zone = match context.store.find_zone(&zname) {
        Ok(Some(zone)) => zone,
        Ok(None) => {
            log::info!("dns update refused: unknown zone {}", zname);
            reply.header.rescode = ResultCode::REFUSED;
            return reply;
        }
        Err(e) => {
            log::warn!("dns update: zone lookup failed: {}", e);
            reply.header.rescode = ResultCode::REFUSED;
            return reply;
        }
    };

    match apply_updates(context, request, &zone) {
        Ok(()) => {
            soa::bump_soa_serial_auto(
                &context.store,
                &zone,
                context.config.auto_soa_on_missing,
            );
            log::info!(
                "dns update zone={} ops={} id={}",
                zone.name,
                request.authorities.len(),
                request.header.id
            );
            reply.header.rescode = ResultCode::NOERROR;
        }
        Err(e) => {
            log::warn!("dns update failed for zone {}: {}", zone.name, e);
            reply.header.rescode = ResultCode::SERVFAIL;
        }
    }
    reply
}

fn apply_updates(
    context: &ServerContext,
    request: &DnsPacket,
    zone: &crate::store::Zone,
) -> Result<(), UpdateError> {
    let default_ttl = context.config.default_ttl;
    let zone_suffix = fqdn(&zone.name.to_lowercase());

    let mut tx = context.store.begin().map_err(UpdateError::Store)?;

    for rec in &request.authorities {
        let name = fqdn(&rec.name.to_lowercase());
        let rtype = rec.rtype.name();

        if !name.ends_with(&zone_suffix) {
            return Err(UpdateError::NameOutsideZone(name));
        }

        // Delete all rrsets at the name.
        if rec.class == CLASS_ANY && rec.rtype == QueryType::Any {
            tx.delete_rrsets_at(zone.id, &name)?;
            continue;
        }

        // Delete one typed rrset.
        if rec.class == CLASS_ANY {
            tx.delete_rrset(zone.id, &name, &rtype)?;
            continue;
        }

        // Delete a specific datum; a missing rrset is a no-op.
        if rec.class == CLASS_NONE {
            let set = match tx.find_rrset(zone.id, &name, &rtype)? {
                Some(set) => set,
                None => continue,
            };
            tx.delete_rdata_matching(set.id, &rec.rdata.to_text())?;
            continue;
        }

        // Add.
        let set = match tx.find_rrset(zone.id, &name, &rtype)? {
            Some(set) => {
                if rec.ttl > 0 {
                    tx.set_rrset_ttl(set.id, rec.ttl)?;
                } else if set.ttl == 0 && default_ttl > 0 {
                    tx.set_rrset_ttl(set.id, default_ttl)?;
                }
                set
            }
            None => {
                let ttl = if rec.ttl == 0 && default_ttl > 0 {
                    default_ttl
                } else {
                    rec.ttl
                };
                tx.create_rrset(&RRSet {
                    zone_id: zone.id,
                    name: name.clone(),
                    rtype: rtype.clone(),
                    ttl,
                    records: Vec::new(),
                    ..RRSet::default()
                })?
            }
        };
        tx.create_rdata(set.id, &RData::plain(&rec.rdata.to_text()))?;
    }

    tx.commit().map_err(UpdateError::Store)
}
