//! TSIG message authentication (RFC 8945)
//!
//! Dynamic updates can be gated on a shared-secret transaction signature.
//! Verification recomputes the HMAC over the received message with the
//! TSIG RR stripped, the ARCOUNT decremented and the original message id
//! restored, followed by the TSIG variables in canonical form. The two
//! algorithms required by RFC 8945 6 are implemented: hmac-sha1 and
//! hmac-sha256. Secrets are configured as base64 keyed by key name.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use derive_more::Display;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use crate::dns::protocol::{DnsPacket, DnsRecord, QueryType, RData, TsigData, CLASS_ANY};

#[derive(Debug, Display, PartialEq, Eq)]
pub enum TsigError {
    #[display(fmt = "message is not signed")]
    Unsigned,
    #[display(fmt = "unknown key {}", _0)]
    UnknownKey(String),
    #[display(fmt = "unsupported algorithm {}", _0)]
    UnknownAlgorithm(String),
    #[display(fmt = "secret is not valid base64")]
    BadSecret,
    #[display(fmt = "signature mismatch")]
    BadSig,
    #[display(fmt = "time outside fudge window")]
    BadTime,
    #[display(fmt = "malformed tsig record")]
    FormErr,
}

impl std::error::Error for TsigError {}

type Result<T> = std::result::Result<T, TsigError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Algorithm {
    HmacSha1,
    HmacSha256,
}

impl Algorithm {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Algorithm::HmacSha1 => "hmac-sha1",
            Algorithm::HmacSha256 => "hmac-sha256",
        }
    }

    pub fn from_name(name: &str) -> Option<Algorithm> {
        match name.trim_end_matches('.').to_lowercase().as_str() {
            "hmac-sha1" => Some(Algorithm::HmacSha1),
            "hmac-sha256" => Some(Algorithm::HmacSha256),
            _ => None,
        }
    }

    fn output_size(&self) -> usize {
        match self {
            Algorithm::HmacSha1 => 20,
            Algorithm::HmacSha256 => 32,
        }
    }

    fn compute(&self, key: &[u8], chunks: &[&[u8]]) -> Vec<u8> {
        match self {
            Algorithm::HmacSha1 => {
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key size");
                for chunk in chunks {
                    mac.update(chunk);
                }
                mac.finalize().into_bytes().to_vec()
            }
            Algorithm::HmacSha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key size");
                for chunk in chunks {
                    mac.update(chunk);
                }
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Uncompressed lowercase wire form of a name, as digested.
fn name_wire(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for label in name.split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.to_lowercase().as_bytes());
    }
    out.push(0);
    out
}

/// Skip one encoded name in raw message bytes, returning the following
/// offset.
fn skip_name(raw: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        let len = *raw.get(pos).ok_or(TsigError::FormErr)?;
        if (len & 0xC0) == 0xC0 {
            return Ok(pos + 2);
        }
        pos += 1;
        if len == 0 {
            return Ok(pos);
        }
        pos += len as usize;
    }
}

/// Locate the byte offset of the final additional-section record, where
/// the TSIG RR must sit.
fn last_additional_offset(raw: &[u8]) -> Result<usize> {
    if raw.len() < 12 {
        return Err(TsigError::FormErr);
    }
    let qdcount = u16::from_be_bytes([raw[4], raw[5]]) as usize;
    let ancount = u16::from_be_bytes([raw[6], raw[7]]) as usize;
    let nscount = u16::from_be_bytes([raw[8], raw[9]]) as usize;
    let arcount = u16::from_be_bytes([raw[10], raw[11]]) as usize;
    if arcount == 0 {
        return Err(TsigError::Unsigned);
    }

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(raw, pos)?;
        pos += 4;
    }
    for _ in 0..(ancount + nscount + arcount - 1) {
        pos = skip_name(raw, pos)?;
        if pos + 10 > raw.len() {
            return Err(TsigError::FormErr);
        }
        let rdlen = u16::from_be_bytes([raw[pos + 8], raw[pos + 9]]) as usize;
        pos += 10 + rdlen;
    }
    if pos >= raw.len() {
        return Err(TsigError::FormErr);
    }
    Ok(pos)
}

fn digest_chunks(
    algorithm: Algorithm,
    key: &[u8],
    raw_up_to_tsig: &[u8],
    key_name: &str,
    tsig: &TsigData,
) -> Vec<u8> {
    // Message with original id restored and the TSIG removed from the
    // ARCOUNT (RFC 8945 4.3.2).
    let original_id = tsig.original_id.to_be_bytes();
    let arcount = u16::from_be_bytes([raw_up_to_tsig[10], raw_up_to_tsig[11]]) - 1;
    let arcount = arcount.to_be_bytes();

    // TSIG variables (RFC 8945 4.3.3): name, class ANY, TTL 0,
    // algorithm, time, fudge, error, other.
    let key_wire = name_wire(key_name);
    let algo_wire = name_wire(tsig.algorithm.as_str());
    let time = tsig.time_signed.to_be_bytes();
    let fudge = tsig.fudge.to_be_bytes();
    let error = tsig.error.to_be_bytes();
    let other_len = (tsig.other.len() as u16).to_be_bytes();

    algorithm.compute(
        key,
        &[
            &original_id,
            &raw_up_to_tsig[2..10],
            &arcount,
            &raw_up_to_tsig[12..],
            &key_wire,
            &[0x00, 0xFF, 0x00, 0x00, 0x00, 0x00],
            &algo_wire,
            &time[2..8],
            &fudge,
            &error,
            &other_len,
            &tsig.other,
        ],
    )
}

fn check_mac_size(algorithm: Algorithm, mac_len: usize) -> Result<()> {
    let full = algorithm.output_size();
    let min = 10usize.max((full + 1) / 2);
    if mac_len > full || mac_len < min {
        Err(TsigError::FormErr)
    } else {
        Ok(())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Verify the TSIG signature on a request message.
///
/// `raw` is the full message as received. `secrets` maps key names to
/// base64 secrets. `now` is the server's unix time, a parameter so the
/// fudge window is testable.
pub fn verify_request(raw: &[u8], secrets: &HashMap<String, String>, now: u64) -> Result<()> {
    let tsig_offset = last_additional_offset(raw)?;

    // Re-parse just the trailing record.
    let mut buffer = BytePacketBuffer::new();
    let take = raw.len().min(buffer.buf.len());
    buffer.buf[..take].copy_from_slice(&raw[..take]);
    buffer.seek(tsig_offset).map_err(|_| TsigError::FormErr)?;
    let record = DnsRecord::read(&mut buffer).map_err(|_| TsigError::FormErr)?;

    let tsig = match record.rdata {
        RData::Tsig(ref tsig) if record.rtype == QueryType::Tsig => tsig,
        _ => return Err(TsigError::Unsigned),
    };
    let key_name = record.name.trim_end_matches('.').to_lowercase();

    let secret_b64 = secrets
        .iter()
        .find(|(name, _)| name.trim_end_matches('.').to_lowercase() == key_name)
        .map(|(_, secret)| secret)
        .ok_or_else(|| TsigError::UnknownKey(key_name.clone()))?;
    let key = BASE64
        .decode(secret_b64.trim())
        .map_err(|_| TsigError::BadSecret)?;

    let algorithm = Algorithm::from_name(&tsig.algorithm)
        .ok_or_else(|| TsigError::UnknownAlgorithm(tsig.algorithm.clone()))?;

    check_mac_size(algorithm, tsig.mac.len())?;

    let expected = digest_chunks(algorithm, &key, &raw[..tsig_offset], &key_name, tsig);
    if !constant_time_eq(&expected[..tsig.mac.len()], &tsig.mac) {
        return Err(TsigError::BadSig);
    }

    let window_start = tsig.time_signed.saturating_sub(tsig.fudge as u64);
    let window_end = tsig.time_signed.saturating_add(tsig.fudge as u64);
    if now < window_start || now > window_end {
        return Err(TsigError::BadTime);
    }

    Ok(())
}

/// Sign a request message, returning the final wire bytes with the TSIG
/// RR appended. Used by tests and by tooling that drives updates.
pub fn sign_request(
    packet: &mut DnsPacket,
    key_name: &str,
    algorithm: Algorithm,
    secret_b64: &str,
    time_signed: u64,
    fudge: u16,
) -> Result<Vec<u8>> {
    let key = BASE64
        .decode(secret_b64.trim())
        .map_err(|_| TsigError::BadSecret)?;

    let mut buffer = VectorPacketBuffer::new();
    packet
        .write(&mut buffer, usize::MAX)
        .map_err(|_| TsigError::FormErr)?;
    let unsigned = buffer.buffer.clone();

    let key_name = key_name.trim_end_matches('.').to_lowercase();
    let mut tsig = TsigData {
        algorithm: algorithm.wire_name().to_string(),
        time_signed,
        fudge,
        mac: Vec::new(),
        original_id: packet.header.id,
        error: 0,
        other: Vec::new(),
    };

    // Digest the unsigned message as if the TSIG were already counted
    // out of it, which for signing means: as written.
    let key_wire = name_wire(&key_name);
    let algo_wire = name_wire(tsig.algorithm.as_str());
    let time = tsig.time_signed.to_be_bytes();
    let fudge_b = tsig.fudge.to_be_bytes();
    let error = tsig.error.to_be_bytes();
    let other_len = (tsig.other.len() as u16).to_be_bytes();
    tsig.mac = algorithm.compute(
        &key,
        &[
            &packet.header.id.to_be_bytes(),
            &unsigned[2..10],
            &unsigned[10..12],
            &unsigned[12..],
            &key_wire,
            &[0x00, 0xFF, 0x00, 0x00, 0x00, 0x00],
            &algo_wire,
            &time[2..8],
            &fudge_b,
            &error,
            &other_len,
            &tsig.other,
        ],
    );

    let mut record = DnsRecord::new(&key_name, QueryType::Tsig, 0, RData::Tsig(tsig));
    record.class = CLASS_ANY;

    let mut out = unsigned;
    let mut tail = VectorPacketBuffer::new();
    record.write(&mut tail).map_err(|_| TsigError::FormErr)?;
    out.extend_from_slice(&tail.buffer);

    // Account for the TSIG RR in the ARCOUNT.
    let arcount = u16::from_be_bytes([out[10], out[11]]) + 1;
    out[10..12].copy_from_slice(&arcount.to_be_bytes());

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::{DnsQuestion, Opcode};

    const KEY_NAME: &str = "update-key.";
    // "topsecret" in base64
    const SECRET: &str = "dG9wc2VjcmV0";

    fn secrets() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(KEY_NAME.to_string(), SECRET.to_string());
        map
    }

    fn update_packet() -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = 0xa2e0;
        packet.header.opcode = Opcode::Update;
        packet
            .questions
            .push(DnsQuestion::new("adddel.test".to_string(), QueryType::Soa));
        packet
    }

    #[test]
    fn test_sign_then_verify() {
        let now = 1_700_000_000;
        for algorithm in [Algorithm::HmacSha1, Algorithm::HmacSha256] {
            let mut packet = update_packet();
            let raw =
                sign_request(&mut packet, KEY_NAME, algorithm, SECRET, now, 300).unwrap();
            verify_request(&raw, &secrets(), now).unwrap();
        }
    }

    #[test]
    fn test_corrupted_message_rejected() {
        let now = 1_700_000_000;
        let mut packet = update_packet();
        let mut raw =
            sign_request(&mut packet, KEY_NAME, Algorithm::HmacSha256, SECRET, now, 300)
                .unwrap();
        // Flip a header flag bit after signing.
        raw[2] ^= 0x01;
        assert_eq!(verify_request(&raw, &secrets(), now), Err(TsigError::BadSig));
    }

    #[test]
    fn test_time_window_enforced() {
        let signed_at = 1_700_000_000;
        let mut packet = update_packet();
        let raw = sign_request(
            &mut packet,
            KEY_NAME,
            Algorithm::HmacSha256,
            SECRET,
            signed_at,
            300,
        )
        .unwrap();

        verify_request(&raw, &secrets(), signed_at + 299).unwrap();
        assert_eq!(
            verify_request(&raw, &secrets(), signed_at + 301),
            Err(TsigError::BadTime)
        );
        assert_eq!(
            verify_request(&raw, &secrets(), signed_at - 301),
            Err(TsigError::BadTime)
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let now = 1_700_000_000;
        let mut packet = update_packet();
        let raw = sign_request(
            &mut packet,
            "other-key.",
            Algorithm::HmacSha256,
            SECRET,
            now,
            300,
        )
        .unwrap();
        assert_eq!(
            verify_request(&raw, &secrets(), now),
            Err(TsigError::UnknownKey("other-key".to_string()))
        );
    }

    #[test]
    fn test_unsigned_message_rejected() {
        let mut packet = update_packet();
        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer, 0xFFFF).unwrap();
        assert_eq!(
            verify_request(&buffer.buffer, &secrets(), 0),
            Err(TsigError::Unsigned)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = 1_700_000_000;
        let mut packet = update_packet();
        let raw = sign_request(
            &mut packet,
            KEY_NAME,
            Algorithm::HmacSha256,
            "d3JvbmdzZWNyZXQ=", // "wrongsecret"
            now,
            300,
        )
        .unwrap();
        assert_eq!(verify_request(&raw, &secrets(), now), Err(TsigError::BadSig));
    }
}
