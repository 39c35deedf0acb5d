//! GeoIP lookup providers
//!
//! The server resolves a client address to `{country, continent, asn}`
//! through a [`GeoProvider`]. The real implementation loads MaxMind-format
//! databases from a file or directory, sorts them into per-family
//! country/ASN slots, and swaps the whole reader set atomically on reload
//! so concurrent lookups never observe a torn state. When nothing can be
//! loaded the server falls back to [`NoopProvider`] and serves without
//! geo information.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use derive_more::{Display, Error, From};
use maxminddb::{geoip2, Reader};
use parking_lot::RwLock;
use serde::Deserialize;

#[derive(Debug, Display, From, Error)]
pub enum GeoError {
    Io(std::io::Error),
    Mmdb(maxminddb::MaxMindDBError),
    #[display(fmt = "no geoip databases loaded")]
    NoDatabases,
}

type Result<T> = std::result::Result<T, GeoError>;

/// What we know about a client address. Fields are empty/zero when the
/// databases have no answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Info {
    pub country: String,
    pub continent: String,
    pub asn: u32,
}

pub trait GeoProvider: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Info;
}

/// Provider used when GeoIP is disabled or failed to load.
pub struct NoopProvider;

impl GeoProvider for NoopProvider {
    fn lookup(&self, _ip: IpAddr) -> Info {
        Info::default()
    }
}

struct DbReader {
    reader: Reader<Vec<u8>>,
    db_type: String,
}

#[derive(Default)]
struct ReaderSet {
    country4: Option<Arc<DbReader>>,
    country6: Option<Arc<DbReader>>,
    asn4: Option<Arc<DbReader>>,
    asn6: Option<Arc<DbReader>>,
}

impl ReaderSet {
    fn is_empty(&self) -> bool {
        self.country4.is_none()
            && self.country6.is_none()
            && self.asn4.is_none()
            && self.asn6.is_none()
    }

    fn country_for(&self, ip: IpAddr) -> Option<Arc<DbReader>> {
        if ip.is_ipv6() {
            self.country6.clone().or_else(|| self.country4.clone())
        } else {
            self.country4.clone().or_else(|| self.country6.clone())
        }
    }

    fn asn_for(&self, ip: IpAddr) -> Option<Arc<DbReader>> {
        if ip.is_ipv6() {
            self.asn6.clone().or_else(|| self.asn4.clone())
        } else {
            self.asn4.clone().or_else(|| self.asn6.clone())
        }
    }
}

/// How a database file should be slotted, judged from its lowercase
/// filename and database-type metadata.
fn classify(filename: &str, db_type: &str) -> (bool, bool, bool) {
    let is_asn = db_type.contains("asn") || filename.contains("asn");
    // City databases carry country and continent, so they qualify.
    let is_country = db_type.contains("country")
        || filename.contains("country")
        || db_type.contains("city")
        || filename.contains("city");
    let is_v6 = filename.contains("ipv6")
        || filename.contains("-6")
        || filename.contains("_6")
        || filename.contains("-v6")
        || filename.ends_with("6.mmdb");
    (is_asn, is_country, is_v6)
}

/// Alternate vendor schema carrying a bare country code.
#[derive(Deserialize)]
struct CountryCodeRecord {
    country_code: Option<String>,
}

#[derive(Deserialize)]
struct AsnRecord {
    autonomous_system_number: Option<u32>,
}

/// MaxMind-backed provider with hot reload.
pub struct MmdbProvider {
    path: PathBuf,
    slots: RwLock<Arc<ReaderSet>>,
}

/// Stops the background reload/download tasks when dropped or told to.
pub struct StopHandle {
    senders: parking_lot::Mutex<Vec<Sender<()>>>,
}

impl StopHandle {
    pub fn stop(&self) {
        for tx in self.senders.lock().iter() {
            let _ = tx.send(());
        }
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MmdbProvider {
    /// Load databases from a file or directory, spawning reload and
    /// download tasks as configured. Returns an error when nothing can
    /// be loaded; the caller is expected to degrade to [`NoopProvider`].
    pub fn new_from_path(
        path: &str,
        reload: Duration,
        download_urls: Vec<String>,
        download_interval: Duration,
    ) -> Result<(Arc<MmdbProvider>, StopHandle)> {
        let provider = Arc::new(MmdbProvider {
            path: PathBuf::from(path),
            slots: RwLock::new(Arc::new(ReaderSet::default())),
        });

        // First run on an empty directory: fetch before loading.
        if download_interval > Duration::ZERO
            && !download_urls.is_empty()
            && !has_mmdb_files(&provider.path)
        {
            log::info!(
                "geoip: no databases at {}, performing initial download",
                provider.path.display()
            );
            if let Err(e) = download_files(&download_urls, &provider.path) {
                log::warn!("geoip: initial download failed: {}", e);
            }
        }

        provider.load()?;

        let mut senders = Vec::new();

        if reload > Duration::ZERO {
            log::info!("geoip: auto-reload every {:?}", reload);
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            let worker = provider.clone();
            thread::Builder::new()
                .name("geoip-reload".to_string())
                .spawn(move || loop {
                    match rx.recv_timeout(reload) {
                        Err(RecvTimeoutError::Timeout) => {
                            log::info!("geoip: reloading databases");
                            if let Err(e) = worker.load() {
                                log::warn!("geoip: reload failed: {}", e);
                            }
                        }
                        _ => return,
                    }
                })?;
        }

        if download_interval > Duration::ZERO && !download_urls.is_empty() {
            log::info!("geoip: auto-download every {:?}", download_interval);
            let (tx, rx) = mpsc::channel();
            senders.push(tx);
            let worker = provider.clone();
            thread::Builder::new()
                .name("geoip-download".to_string())
                .spawn(move || loop {
                    match rx.recv_timeout(download_interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = download_files(&download_urls, &worker.path) {
                                log::warn!("geoip: download failed: {}", e);
                            }
                            if let Err(e) = worker.load() {
                                log::warn!("geoip: reload after download failed: {}", e);
                            }
                        }
                        _ => return,
                    }
                })?;
        }

        Ok((
            provider,
            StopHandle {
                senders: parking_lot::Mutex::new(senders),
            },
        ))
    }

    /// Open all databases and publish them as one new reader set.
    fn load(&self) -> Result<()> {
        let mut set = ReaderSet::default();
        let meta = fs::metadata(&self.path)?;

        if meta.is_dir() {
            for entry in fs::read_dir(&self.path)? {
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                let name = entry.file_name().to_string_lossy().to_lowercase();
                if !name.ends_with(".mmdb") {
                    continue;
                }
                let full = entry.path();
                let reader = match Reader::open_readfile(&full) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("geoip: failed to open {}: {}", full.display(), e);
                        continue;
                    }
                };
                let db_type = reader.metadata.database_type.to_lowercase();
                let (is_asn, is_country, is_v6) = classify(&name, &db_type);
                let reader = Arc::new(DbReader { reader, db_type });

                if is_asn {
                    let slot = if is_v6 { &mut set.asn6 } else { &mut set.asn4 };
                    *slot = Some(reader);
                    log::info!("geoip: loaded asn db {} (v6={})", full.display(), is_v6);
                } else if is_country {
                    let slot = if is_v6 {
                        &mut set.country6
                    } else {
                        &mut set.country4
                    };
                    *slot = Some(reader);
                    log::info!("geoip: loaded country db {} (v6={})", full.display(), is_v6);
                } else {
                    log::warn!(
                        "geoip: skipping {} with unknown purpose (type {})",
                        full.display(),
                        reader.db_type
                    );
                }
            }

            // A dual-stack database covers the missing family.
            if set.country4.is_none() {
                set.country4 = set.country6.clone();
            }
            if set.country6.is_none() {
                set.country6 = set.country4.clone();
            }
            if set.asn4.is_none() {
                set.asn4 = set.asn6.clone();
            }
            if set.asn6.is_none() {
                set.asn6 = set.asn4.clone();
            }

            if set.is_empty() {
                return Err(GeoError::NoDatabases);
            }
        } else {
            let reader = Reader::open_readfile(&self.path)?;
            let db_type = reader.metadata.database_type.to_lowercase();
            let reader = Arc::new(DbReader { reader, db_type });
            log::info!(
                "geoip: loaded {} for both families (type {})",
                self.path.display(),
                reader.db_type
            );
            set.country4 = Some(reader.clone());
            set.country6 = Some(reader);
        }

        *self.slots.write() = Arc::new(set);
        Ok(())
    }
}

impl GeoProvider for MmdbProvider {
    fn lookup(&self, ip: IpAddr) -> Info {
        let set = self.slots.read().clone();
        let mut info = Info::default();

        if let Some(db) = set.country_for(ip) {
            if db.db_type.contains("city") {
                if let Ok(rec) = db.reader.lookup::<geoip2::City>(ip) {
                    info.country = rec
                        .country
                        .and_then(|c| c.iso_code)
                        .unwrap_or_default()
                        .to_string();
                    info.continent = rec
                        .continent
                        .and_then(|c| c.code)
                        .unwrap_or_default()
                        .to_string();
                }
            } else if let Ok(rec) = db.reader.lookup::<geoip2::Country>(ip) {
                info.country = rec
                    .country
                    .and_then(|c| c.iso_code)
                    .unwrap_or_default()
                    .to_string();
                info.continent = rec
                    .continent
                    .and_then(|c| c.code)
                    .unwrap_or_default()
                    .to_string();
            }

            // Some vendors publish only a top-level country_code.
            if info.country.is_empty() {
                if let Ok(rec) = db.reader.lookup::<CountryCodeRecord>(ip) {
                    if let Some(code) = rec.country_code {
                        info.continent = continent_for_country(&code).to_string();
                        info.country = code;
                    }
                }
            }
        }

        if let Some(db) = set.asn_for(ip) {
            if let Ok(rec) = db.reader.lookup::<AsnRecord>(ip) {
                info.asn = rec.autonomous_system_number.unwrap_or(0);
            }
        }

        info
    }
}

fn has_mmdb_files(path: &Path) -> bool {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    entries
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().to_lowercase().ends_with(".mmdb"))
}

/// Fetch each URL into the target directory via a temp file and atomic
/// rename, so a half-written database is never opened.
fn download_files(urls: &[String], target_dir: &Path) -> Result<()> {
    fs::create_dir_all(target_dir)?;

    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .map_err(|e| GeoError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

    let mut downloaded = 0;
    let mut failed = 0;

    for url in urls {
        let mut filename = url
            .rsplit('/')
            .next()
            .unwrap_or("geoip")
            .to_string();
        if !filename.to_lowercase().ends_with(".mmdb") {
            filename.push_str(".mmdb");
        }
        let target = target_dir.join(&filename);
        let tmp = target_dir.join(format!("{}.tmp", filename));

        let outcome = client
            .get(url)
            .send()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .and_then(|resp| {
                if !resp.status().is_success() {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("http status {}", resp.status()),
                    ));
                }
                let body = resp
                    .bytes()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                fs::write(&tmp, &body)?;
                fs::rename(&tmp, &target)?;
                Ok(body.len())
            });

        match outcome {
            Ok(size) => {
                log::info!("geoip: downloaded {} ({} bytes)", filename, size);
                downloaded += 1;
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                log::warn!("geoip: download of {} failed: {}", url, e);
                failed += 1;
            }
        }
    }

    log::info!(
        "geoip: download finished, {} ok, {} failed",
        downloaded,
        failed
    );
    Ok(())
}

/// Continent code for an ISO 3166-1 alpha-2 country, empty when unknown.
pub fn continent_for_country(country: &str) -> &'static str {
    match country.to_uppercase().as_str() {
        // North America
        "US" | "CA" | "MX" | "GT" | "BZ" | "SV" | "HN" | "NI" | "CR" | "PA" | "CU" | "JM"
        | "HT" | "DO" | "PR" | "TT" | "BS" | "BB" | "GL" => "NA",
        // South America
        "BR" | "AR" | "CL" | "CO" | "PE" | "VE" | "EC" | "BO" | "PY" | "UY" | "GY" | "SR" => "SA",
        // Europe
        "GB" | "IE" | "FR" | "DE" | "IT" | "ES" | "PT" | "NL" | "BE" | "LU" | "CH" | "AT"
        | "DK" | "SE" | "NO" | "FI" | "IS" | "PL" | "CZ" | "SK" | "HU" | "RO" | "BG" | "GR"
        | "HR" | "SI" | "RS" | "BA" | "ME" | "MK" | "AL" | "EE" | "LV" | "LT" | "BY" | "UA"
        | "MD" | "RU" | "CY" | "MT" | "AD" | "MC" | "SM" | "VA" | "LI" => "EU",
        // Asia
        "CN" | "JP" | "KR" | "KP" | "IN" | "PK" | "BD" | "LK" | "NP" | "BT" | "MM" | "TH"
        | "LA" | "KH" | "VN" | "MY" | "SG" | "ID" | "PH" | "BN" | "TL" | "MN" | "TW" | "HK"
        | "MO" | "KZ" | "KG" | "TJ" | "TM" | "UZ" | "AF" | "IR" | "IQ" | "SY" | "LB" | "JO"
        | "IL" | "PS" | "SA" | "YE" | "OM" | "AE" | "QA" | "BH" | "KW" | "TR" | "GE" | "AM"
        | "AZ" => "AS",
        // Africa
        "ZA" | "EG" | "NG" | "KE" | "ET" | "TZ" | "UG" | "GH" | "DZ" | "MA" | "TN" | "LY"
        | "SD" | "SS" | "SO" | "SN" | "ML" | "NE" | "TD" | "CM" | "CI" | "BF" | "BJ" | "TG"
        | "GN" | "GW" | "SL" | "LR" | "GM" | "MR" | "RW" | "BI" | "CD" | "CG" | "GA" | "GQ"
        | "CF" | "AO" | "ZM" | "ZW" | "MW" | "MZ" | "BW" | "NA" | "SZ" | "LS" | "MG" | "MU"
        | "SC" | "DJ" | "ER" => "AF",
        // Oceania
        "AU" | "NZ" | "PG" | "FJ" | "SB" | "VU" | "WS" | "TO" | "KI" | "FM" | "MH" | "PW"
        | "NR" | "TV" => "OC",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_is_empty() {
        let info = NoopProvider.lookup("8.8.8.8".parse().unwrap());
        assert_eq!(info, Info::default());
    }

    #[test]
    fn test_classify_by_filename() {
        // GeoLite2 naming
        assert_eq!(classify("geolite2-country.mmdb", ""), (false, true, false));
        assert_eq!(classify("geolite2-asn.mmdb", ""), (true, false, false));
        assert_eq!(classify("geolite2-city.mmdb", ""), (false, true, false));
        // v6 hints
        assert_eq!(classify("country-ipv6.mmdb", ""), (false, true, true));
        assert_eq!(classify("country-v6.mmdb", ""), (false, true, true));
        assert_eq!(classify("asn_6.mmdb", ""), (true, false, true));
        assert_eq!(classify("dbip-country6.mmdb", ""), (false, true, true));
    }

    #[test]
    fn test_classify_by_metadata() {
        assert_eq!(classify("data.mmdb", "geolite2-asn"), (true, false, false));
        assert_eq!(classify("data.mmdb", "dbip-country-lite"), (false, true, false));
        assert_eq!(classify("data.mmdb", "geoip2-city"), (false, true, false));
        // Nothing recognizable
        assert_eq!(classify("data.mmdb", "something-else"), (false, false, false));
    }

    #[test]
    fn test_continent_table() {
        assert_eq!(continent_for_country("us"), "NA");
        assert_eq!(continent_for_country("RU"), "EU");
        assert_eq!(continent_for_country("JP"), "AS");
        assert_eq!(continent_for_country("AU"), "OC");
        assert_eq!(continent_for_country("ZZ"), "");
    }

    #[test]
    fn test_missing_path_is_error() {
        let result = MmdbProvider::new_from_path(
            "/nonexistent/geoip-dir",
            Duration::ZERO,
            Vec::new(),
            Duration::ZERO,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_dir_is_error() {
        let dir = std::env::temp_dir().join(format!("meridian-geo-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let result = MmdbProvider::new_from_path(
            dir.to_str().unwrap(),
            Duration::ZERO,
            Vec::new(),
            Duration::ZERO,
        );
        assert!(result.is_err());
        let _ = fs::remove_dir_all(&dir);
    }
}
