//! Persistent zone storage
//!
//! Zones, rrsets and rdata live in SQLite behind `sqlx`. The serving core
//! is thread-based, so the store owns a private Tokio runtime and exposes
//! a synchronous facade; nothing outside this module touches async.
//!
//! Writes that must be atomic (dynamic updates, replication apply, zone
//! deletion) go through [`StoreTx`]; a transaction dropped without commit
//! rolls back.

use std::str::FromStr;

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tokio::runtime::Runtime;

use crate::config::DbConfig;

pub mod soa;

#[derive(Debug, Display, From, Error)]
pub enum StoreError {
    Sql(sqlx::Error),
    Io(std::io::Error),
    #[display(fmt = "unsupported db driver: {}", _0)]
    #[from(ignore)]
    UnsupportedDriver(#[error(not(source))] String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A zone apex. `name` is lowercase without a trailing dot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub rrsets: Vec<RRSet>,
}

/// The set of records sharing (zone, owner name, type). `name` is a
/// lowercase FQDN with trailing dot, `rtype` an uppercase mnemonic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RRSet {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub zone_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: String,
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub records: Vec<RData>,
}

/// One record datum plus its optional selection keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RData {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub rrset_id: i64,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
}

impl RData {
    pub fn plain(data: &str) -> RData {
        RData {
            data: data.to_string(),
            ..RData::default()
        }
    }

    /// True when no selection key is set.
    pub fn is_generic(&self) -> bool {
        self.country.is_none()
            && self.continent.is_none()
            && self.asn.is_none()
            && self.subnet.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub records: Vec<TemplateRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub template_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: String,
    #[serde(default)]
    pub ttl: u32,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
}

fn zone_from_row(row: &SqliteRow) -> Zone {
    Zone {
        id: row.get("id"),
        name: row.get("name"),
        rrsets: Vec::new(),
    }
}

fn rrset_from_row(row: &SqliteRow) -> RRSet {
    RRSet {
        id: row.get("id"),
        zone_id: row.get("zone_id"),
        name: row.get("name"),
        rtype: row.get("rtype"),
        ttl: row.get::<i64, _>("ttl") as u32,
        records: Vec::new(),
    }
}

fn rdata_from_row(row: &SqliteRow) -> RData {
    RData {
        id: row.get("id"),
        rrset_id: row.get("rrset_id"),
        data: row.get("data"),
        country: row.get("country"),
        continent: row.get("continent"),
        asn: row.get("asn"),
        subnet: row.get("subnet"),
    }
}

/// Synchronous handle over the SQLite pool.
pub struct Store {
    rt: Runtime,
    pool: SqlitePool,
}

impl Store {
    /// Open the store described by the config. Only sqlite is supported;
    /// an empty driver means sqlite.
    pub fn open(cfg: &DbConfig) -> Result<Store> {
        match cfg.driver.to_lowercase().as_str() {
            "" | "sqlite" | "sqlite3" => {}
            other => return Err(StoreError::UnsupportedDriver(other.to_string())),
        }

        let dsn = if cfg.dsn.is_empty() {
            "meridian.db"
        } else {
            cfg.dsn.as_str()
        };

        let rt = Runtime::new()?;

        let pool = if dsn.contains(":memory:") {
            // A single never-recycled connection keeps every handle on
            // the same in-memory database.
            let options =
                SqliteConnectOptions::from_str("sqlite::memory:").map_err(StoreError::Sql)?;
            rt.block_on(
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options),
            )?
        } else {
            let options = SqliteConnectOptions::new()
                .filename(dsn)
                .create_if_missing(true)
                .busy_timeout(std::time::Duration::from_secs(5));
            rt.block_on(
                SqlitePoolOptions::new()
                    .max_connections(5)
                    .connect_with(options),
            )?
        };

        Ok(Store { rt, pool })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Store> {
        let store = Store::open(&DbConfig {
            driver: "sqlite".to_string(),
            dsn: ":memory:".to_string(),
        })?;
        store.migrate()?;
        Ok(store)
    }

    /// Create the schema when absent.
    pub fn migrate(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS zones (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            "CREATE TABLE IF NOT EXISTS rrsets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                zone_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                rtype TEXT NOT NULL,
                ttl INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(zone_id, name, rtype)
            )",
            "CREATE TABLE IF NOT EXISTS rdata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rrset_id INTEGER NOT NULL,
                data TEXT NOT NULL,
                country TEXT,
                continent TEXT,
                asn INTEGER,
                subnet TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_rrsets_zone ON rrsets(zone_id)",
            "CREATE INDEX IF NOT EXISTS idx_rdata_rrset ON rdata(rrset_id)",
            "CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT ''
            )",
            "CREATE TABLE IF NOT EXISTS template_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                template_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                rtype TEXT NOT NULL,
                ttl INTEGER NOT NULL DEFAULT 0,
                data TEXT NOT NULL,
                country TEXT,
                continent TEXT,
                asn INTEGER,
                subnet TEXT
            )",
        ];

        self.rt.block_on(async {
            for stmt in statements {
                sqlx::query(stmt).execute(&self.pool).await?;
            }
            Ok::<_, sqlx::Error>(())
        })?;
        Ok(())
    }

    /// Begin a transaction.
    pub fn begin(&self) -> Result<StoreTx<'_>> {
        let tx = self.rt.block_on(self.pool.begin())?;
        Ok(StoreTx {
            rt: &self.rt,
            tx: Some(tx),
        })
    }

    /// All zones ordered by name length descending, so the longest
    /// suffix matches first.
    pub fn zones(&self) -> Result<Vec<Zone>> {
        let rows = self.rt.block_on(
            sqlx::query("SELECT id, name FROM zones ORDER BY length(name) DESC")
                .fetch_all(&self.pool),
        )?;
        Ok(rows.iter().map(zone_from_row).collect())
    }

    /// Find a zone by apex name, accepting either trimmed or FQDN form.
    pub fn find_zone(&self, name: &str) -> Result<Option<Zone>> {
        let trimmed = name.trim_end_matches('.').to_lowercase();
        let dotted = format!("{}.", trimmed);
        let row = self.rt.block_on(
            sqlx::query("SELECT id, name FROM zones WHERE name = ?1 OR name = ?2")
                .bind(&trimmed)
                .bind(&dotted)
                .fetch_optional(&self.pool),
        )?;
        Ok(row.as_ref().map(zone_from_row))
    }

    pub fn zone_by_id(&self, id: i64) -> Result<Option<Zone>> {
        let row = self.rt.block_on(
            sqlx::query("SELECT id, name FROM zones WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool),
        )?;
        Ok(row.as_ref().map(zone_from_row))
    }

    pub fn create_zone(&self, name: &str) -> Result<Zone> {
        let name = name.trim_end_matches('.').to_lowercase();
        let result = self.rt.block_on(
            sqlx::query("INSERT INTO zones (name) VALUES (?1)")
                .bind(&name)
                .execute(&self.pool),
        )?;
        Ok(Zone {
            id: result.last_insert_rowid(),
            name,
            rrsets: Vec::new(),
        })
    }

    /// Destroy a zone and everything under it, atomically.
    pub fn delete_zone(&self, id: i64) -> Result<()> {
        let mut tx = self.begin()?;
        tx.delete_zone_rrsets(id)?;
        tx.delete_zone_row(id)?;
        tx.commit()
    }

    fn load_records(&self, set: &mut RRSet) -> Result<()> {
        let rows = self.rt.block_on(
            sqlx::query(
                "SELECT id, rrset_id, data, country, continent, asn, subnet
                 FROM rdata WHERE rrset_id = ?1 ORDER BY id",
            )
            .bind(set.id)
            .fetch_all(&self.pool),
        )?;
        set.records = rows.iter().map(rdata_from_row).collect();
        Ok(())
    }

    /// Find one rrset by (zone, owner, type) with records preloaded.
    pub fn rrset(&self, zone_id: i64, name: &str, rtype: &str) -> Result<Option<RRSet>> {
        let row = self.rt.block_on(
            sqlx::query(
                "SELECT id, zone_id, name, rtype, ttl FROM rrsets
                 WHERE zone_id = ?1 AND name = ?2 AND rtype = ?3",
            )
            .bind(zone_id)
            .bind(name.to_lowercase())
            .bind(rtype.to_uppercase())
            .fetch_optional(&self.pool),
        )?;

        match row {
            Some(row) => {
                let mut set = rrset_from_row(&row);
                self.load_records(&mut set)?;
                Ok(Some(set))
            }
            None => Ok(None),
        }
    }

    /// First rrset of a type anywhere in the zone (used for SOA).
    pub fn rrset_by_type(&self, zone_id: i64, rtype: &str) -> Result<Option<RRSet>> {
        let row = self.rt.block_on(
            sqlx::query(
                "SELECT id, zone_id, name, rtype, ttl FROM rrsets
                 WHERE zone_id = ?1 AND rtype = ?2 LIMIT 1",
            )
            .bind(zone_id)
            .bind(rtype.to_uppercase())
            .fetch_optional(&self.pool),
        )?;

        match row {
            Some(row) => {
                let mut set = rrset_from_row(&row);
                self.load_records(&mut set)?;
                Ok(Some(set))
            }
            None => Ok(None),
        }
    }

    pub fn rrset_by_id(&self, zone_id: i64, id: i64) -> Result<Option<RRSet>> {
        let row = self.rt.block_on(
            sqlx::query(
                "SELECT id, zone_id, name, rtype, ttl FROM rrsets
                 WHERE zone_id = ?1 AND id = ?2",
            )
            .bind(zone_id)
            .bind(id)
            .fetch_optional(&self.pool),
        )?;

        match row {
            Some(row) => {
                let mut set = rrset_from_row(&row);
                self.load_records(&mut set)?;
                Ok(Some(set))
            }
            None => Ok(None),
        }
    }

    /// All rrsets of a zone with records preloaded.
    pub fn rrsets_for_zone(&self, zone_id: i64) -> Result<Vec<RRSet>> {
        let rows = self.rt.block_on(
            sqlx::query(
                "SELECT id, zone_id, name, rtype, ttl FROM rrsets
                 WHERE zone_id = ?1 ORDER BY id",
            )
            .bind(zone_id)
            .fetch_all(&self.pool),
        )?;

        let mut sets: Vec<RRSet> = rows.iter().map(rrset_from_row).collect();
        for set in &mut sets {
            self.load_records(set)?;
        }
        Ok(sets)
    }

    /// Create an rrset and its records outside a caller transaction.
    pub fn create_rrset(&self, set: &RRSet) -> Result<RRSet> {
        let mut tx = self.begin()?;
        let created = tx.create_rrset(set)?;
        tx.commit()?;
        Ok(created)
    }

    /// Replace an rrset's attributes and records wholesale.
    pub fn replace_rrset(&self, set: &RRSet) -> Result<()> {
        let mut tx = self.begin()?;
        tx.update_rrset(set)?;
        tx.delete_rdata_for(set.id)?;
        for rec in &set.records {
            tx.create_rdata(set.id, rec)?;
        }
        tx.commit()
    }

    pub fn delete_rrset(&self, zone_id: i64, rrset_id: i64) -> Result<()> {
        let mut tx = self.begin()?;
        tx.delete_rrset_by_id(zone_id, rrset_id)?;
        tx.commit()
    }

    pub fn update_rdata_text(&self, rdata_id: i64, text: &str) -> Result<()> {
        self.rt.block_on(
            sqlx::query("UPDATE rdata SET data = ?1 WHERE id = ?2")
                .bind(text)
                .bind(rdata_id)
                .execute(&self.pool),
        )?;
        Ok(())
    }

    pub fn templates(&self) -> Result<Vec<Template>> {
        let rows = self.rt.block_on(
            sqlx::query("SELECT id, name, description FROM templates ORDER BY id")
                .fetch_all(&self.pool),
        )?;

        let mut templates: Vec<Template> = rows
            .iter()
            .map(|row| Template {
                id: row.get("id"),
                name: row.get("name"),
                description: row.get("description"),
                records: Vec::new(),
            })
            .collect();

        for tmpl in &mut templates {
            let rows = self.rt.block_on(
                sqlx::query(
                    "SELECT id, template_id, name, rtype, ttl, data,
                            country, continent, asn, subnet
                     FROM template_records WHERE template_id = ?1 ORDER BY id",
                )
                .bind(tmpl.id)
                .fetch_all(&self.pool),
            )?;
            tmpl.records = rows
                .iter()
                .map(|row| TemplateRecord {
                    id: row.get("id"),
                    template_id: row.get("template_id"),
                    name: row.get("name"),
                    rtype: row.get("rtype"),
                    ttl: row.get::<i64, _>("ttl") as u32,
                    data: row.get("data"),
                    country: row.get("country"),
                    continent: row.get("continent"),
                    asn: row.get("asn"),
                    subnet: row.get("subnet"),
                })
                .collect();
        }
        Ok(templates)
    }
}

/// A live transaction. Dropped without commit it rolls back.
pub struct StoreTx<'a> {
    rt: &'a Runtime,
    tx: Option<Transaction<'static, Sqlite>>,
}

impl<'a> StoreTx<'a> {
    fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        self.tx.as_mut().expect("transaction already finished")
    }

    pub fn commit(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            self.rt.block_on(tx.commit())?;
        }
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            self.rt.block_on(tx.rollback())?;
        }
        Ok(())
    }

    pub fn find_zone(&mut self, name: &str) -> Result<Option<Zone>> {
        let trimmed = name.trim_end_matches('.').to_lowercase();
        let dotted = format!("{}.", trimmed);
        let rt = self.rt;
        let conn = self.conn();
        let row = rt.block_on(
            sqlx::query("SELECT id, name FROM zones WHERE name = ?1 OR name = ?2")
                .bind(&trimmed)
                .bind(&dotted)
                .fetch_optional(conn),
        )?;
        Ok(row.as_ref().map(zone_from_row))
    }

    pub fn create_zone(&mut self, name: &str) -> Result<Zone> {
        let name = name.trim_end_matches('.').to_lowercase();
        let rt = self.rt;
        let conn = self.conn();
        let result = rt.block_on(
            sqlx::query("INSERT INTO zones (name) VALUES (?1)")
                .bind(&name)
                .execute(conn),
        )?;
        Ok(Zone {
            id: result.last_insert_rowid(),
            name,
            rrsets: Vec::new(),
        })
    }

    pub fn find_rrset(
        &mut self,
        zone_id: i64,
        name: &str,
        rtype: &str,
    ) -> Result<Option<RRSet>> {
        let rt = self.rt;
        let conn = self.conn();
        let row = rt.block_on(
            sqlx::query(
                "SELECT id, zone_id, name, rtype, ttl FROM rrsets
                 WHERE zone_id = ?1 AND name = ?2 AND rtype = ?3",
            )
            .bind(zone_id)
            .bind(name.to_lowercase())
            .bind(rtype.to_uppercase())
            .fetch_optional(conn),
        )?;

        match row {
            Some(row) => {
                let mut set = rrset_from_row(&row);
                let rt = self.rt;
                let conn = self.conn();
                let rows = rt.block_on(
                    sqlx::query(
                        "SELECT id, rrset_id, data, country, continent, asn, subnet
                         FROM rdata WHERE rrset_id = ?1 ORDER BY id",
                    )
                    .bind(set.id)
                    .fetch_all(conn),
                )?;
                set.records = rows.iter().map(rdata_from_row).collect();
                Ok(Some(set))
            }
            None => Ok(None),
        }
    }

    /// Delete every rrset (and its rdata) at an owner name.
    pub fn delete_rrsets_at(&mut self, zone_id: i64, name: &str) -> Result<u64> {
        let name = name.to_lowercase();
        let rt = self.rt;
        let conn = self.conn();
        rt.block_on(
            sqlx::query(
                "DELETE FROM rdata WHERE rrset_id IN
                 (SELECT id FROM rrsets WHERE zone_id = ?1 AND name = ?2)",
            )
            .bind(zone_id)
            .bind(&name)
            .execute(&mut *conn),
        )?;
        let result = rt.block_on(
            sqlx::query("DELETE FROM rrsets WHERE zone_id = ?1 AND name = ?2")
                .bind(zone_id)
                .bind(&name)
                .execute(conn),
        )?;
        Ok(result.rows_affected())
    }

    /// Delete one typed rrset (and its rdata) at an owner name.
    pub fn delete_rrset(&mut self, zone_id: i64, name: &str, rtype: &str) -> Result<u64> {
        let name = name.to_lowercase();
        let rtype = rtype.to_uppercase();
        let rt = self.rt;
        let conn = self.conn();
        rt.block_on(
            sqlx::query(
                "DELETE FROM rdata WHERE rrset_id IN
                 (SELECT id FROM rrsets WHERE zone_id = ?1 AND name = ?2 AND rtype = ?3)",
            )
            .bind(zone_id)
            .bind(&name)
            .bind(&rtype)
            .execute(&mut *conn),
        )?;
        let result = rt.block_on(
            sqlx::query("DELETE FROM rrsets WHERE zone_id = ?1 AND name = ?2 AND rtype = ?3")
                .bind(zone_id)
                .bind(&name)
                .bind(&rtype)
                .execute(conn),
        )?;
        Ok(result.rows_affected())
    }

    /// Delete all rrsets belonging to a zone.
    pub fn delete_zone_rrsets(&mut self, zone_id: i64) -> Result<u64> {
        let rt = self.rt;
        let conn = self.conn();
        rt.block_on(
            sqlx::query(
                "DELETE FROM rdata WHERE rrset_id IN
                 (SELECT id FROM rrsets WHERE zone_id = ?1)",
            )
            .bind(zone_id)
            .execute(&mut *conn),
        )?;
        let result = rt.block_on(
            sqlx::query("DELETE FROM rrsets WHERE zone_id = ?1")
                .bind(zone_id)
                .execute(conn),
        )?;
        Ok(result.rows_affected())
    }

    pub fn delete_zone_row(&mut self, zone_id: i64) -> Result<()> {
        let rt = self.rt;
        let conn = self.conn();
        rt.block_on(
            sqlx::query("DELETE FROM zones WHERE id = ?1")
                .bind(zone_id)
                .execute(conn),
        )?;
        Ok(())
    }

    /// Rewrite an rrset's attributes in place.
    pub fn update_rrset(&mut self, set: &RRSet) -> Result<()> {
        let name = set.name.to_lowercase();
        let rtype = set.rtype.to_uppercase();
        let rt = self.rt;
        let conn = self.conn();
        rt.block_on(
            sqlx::query(
                "UPDATE rrsets SET name = ?1, rtype = ?2, ttl = ?3,
                 updated_at = datetime('now') WHERE id = ?4",
            )
            .bind(&name)
            .bind(&rtype)
            .bind(set.ttl as i64)
            .bind(set.id)
            .execute(conn),
        )?;
        Ok(())
    }

    pub fn delete_rdata_for(&mut self, rrset_id: i64) -> Result<u64> {
        let rt = self.rt;
        let conn = self.conn();
        let result = rt.block_on(
            sqlx::query("DELETE FROM rdata WHERE rrset_id = ?1")
                .bind(rrset_id)
                .execute(conn),
        )?;
        Ok(result.rows_affected())
    }

    pub fn delete_rrset_by_id(&mut self, zone_id: i64, rrset_id: i64) -> Result<()> {
        self.delete_rdata_for(rrset_id)?;
        let rt = self.rt;
        let conn = self.conn();
        rt.block_on(
            sqlx::query("DELETE FROM rrsets WHERE zone_id = ?1 AND id = ?2")
                .bind(zone_id)
                .bind(rrset_id)
                .execute(conn),
        )?;
        Ok(())
    }

    /// Delete rdata rows of an rrset whose text equals `data`.
    pub fn delete_rdata_matching(&mut self, rrset_id: i64, data: &str) -> Result<u64> {
        let rt = self.rt;
        let conn = self.conn();
        let result = rt.block_on(
            sqlx::query("DELETE FROM rdata WHERE rrset_id = ?1 AND data = ?2")
                .bind(rrset_id)
                .bind(data)
                .execute(conn),
        )?;
        Ok(result.rows_affected())
    }

    pub fn create_rrset(&mut self, set: &RRSet) -> Result<RRSet> {
        let rt = self.rt;
        let name = set.name.to_lowercase();
        let rtype = set.rtype.to_uppercase();
        let conn = self.conn();
        let result = rt.block_on(
            sqlx::query(
                "INSERT INTO rrsets (zone_id, name, rtype, ttl) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(set.zone_id)
            .bind(&name)
            .bind(&rtype)
            .bind(set.ttl as i64)
            .execute(conn),
        )?;

        let mut created = RRSet {
            id: result.last_insert_rowid(),
            zone_id: set.zone_id,
            name,
            rtype,
            ttl: set.ttl,
            records: Vec::new(),
        };
        for rec in &set.records {
            let stored = self.create_rdata(created.id, rec)?;
            created.records.push(stored);
        }
        Ok(created)
    }

    pub fn set_rrset_ttl(&mut self, rrset_id: i64, ttl: u32) -> Result<()> {
        let rt = self.rt;
        let conn = self.conn();
        rt.block_on(
            sqlx::query("UPDATE rrsets SET ttl = ?1, updated_at = datetime('now') WHERE id = ?2")
                .bind(ttl as i64)
                .bind(rrset_id)
                .execute(conn),
        )?;
        Ok(())
    }

    pub fn create_rdata(&mut self, rrset_id: i64, rec: &RData) -> Result<RData> {
        let rt = self.rt;
        let conn = self.conn();
        let result = rt.block_on(
            sqlx::query(
                "INSERT INTO rdata (rrset_id, data, country, continent, asn, subnet)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(rrset_id)
            .bind(&rec.data)
            .bind(&rec.country)
            .bind(&rec.continent)
            .bind(rec.asn)
            .bind(&rec.subnet)
            .execute(conn),
        )?;
        Ok(RData {
            id: result.last_insert_rowid(),
            rrset_id,
            data: rec.data.clone(),
            country: rec.country.clone(),
            continent: rec.continent.clone(),
            asn: rec.asn,
            subnet: rec.subnet.clone(),
        })
    }

    pub fn find_template(&mut self, name: &str) -> Result<Option<Template>> {
        let rt = self.rt;
        let conn = self.conn();
        let row = rt.block_on(
            sqlx::query("SELECT id, name, description FROM templates WHERE name = ?1")
                .bind(name)
                .fetch_optional(conn),
        )?;
        Ok(row.map(|row| Template {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            records: Vec::new(),
        }))
    }

    pub fn create_template(&mut self, name: &str, description: &str) -> Result<Template> {
        let rt = self.rt;
        let conn = self.conn();
        let result = rt.block_on(
            sqlx::query("INSERT INTO templates (name, description) VALUES (?1, ?2)")
                .bind(name)
                .bind(description)
                .execute(conn),
        )?;
        Ok(Template {
            id: result.last_insert_rowid(),
            name: name.to_string(),
            description: description.to_string(),
            records: Vec::new(),
        })
    }

    pub fn update_template_description(&mut self, id: i64, description: &str) -> Result<()> {
        let rt = self.rt;
        let conn = self.conn();
        rt.block_on(
            sqlx::query("UPDATE templates SET description = ?1 WHERE id = ?2")
                .bind(description)
                .bind(id)
                .execute(conn),
        )?;
        Ok(())
    }

    pub fn delete_template_records(&mut self, template_id: i64) -> Result<u64> {
        let rt = self.rt;
        let conn = self.conn();
        let result = rt.block_on(
            sqlx::query("DELETE FROM template_records WHERE template_id = ?1")
                .bind(template_id)
                .execute(conn),
        )?;
        Ok(result.rows_affected())
    }

    pub fn create_template_record(
        &mut self,
        template_id: i64,
        rec: &TemplateRecord,
    ) -> Result<()> {
        let rt = self.rt;
        let conn = self.conn();
        rt.block_on(
            sqlx::query(
                "INSERT INTO template_records
                 (template_id, name, rtype, ttl, data, country, continent, asn, subnet)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(template_id)
            .bind(&rec.name)
            .bind(&rec.rtype)
            .bind(rec.ttl as i64)
            .bind(&rec.data)
            .bind(&rec.country)
            .bind(&rec.continent)
            .bind(rec.asn)
            .bind(&rec.subnet)
            .execute(conn),
        )?;
        Ok(())
    }
}

impl Drop for StoreTx<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = self.rt.block_on(tx.rollback());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_crud() {
        let store = Store::open_in_memory().unwrap();

        let zone = store.create_zone("Example.COM.").unwrap();
        assert_eq!(zone.name, "example.com");

        // Unique on name.
        assert!(store.create_zone("example.com").is_err());

        let found = store.find_zone("example.com.").unwrap().unwrap();
        assert_eq!(found.id, zone.id);

        store.delete_zone(zone.id).unwrap();
        assert!(store.find_zone("example.com").unwrap().is_none());
    }

    #[test]
    fn test_zones_ordered_by_length_desc() {
        let store = Store::open_in_memory().unwrap();
        store.create_zone("test").unwrap();
        store.create_zone("geodns.test").unwrap();
        store.create_zone("deep.geodns.test").unwrap();

        let zones = store.zones().unwrap();
        let names: Vec<&str> = zones.iter().map(|z| z.name.as_str()).collect();
        assert_eq!(names, vec!["deep.geodns.test", "geodns.test", "test"]);
    }

    #[test]
    fn test_rrset_uniqueness_and_lookup() {
        let store = Store::open_in_memory().unwrap();
        let zone = store.create_zone("geodns.test").unwrap();

        let set = RRSet {
            zone_id: zone.id,
            name: "SVC.geodns.test.".to_string(),
            rtype: "a".to_string(),
            ttl: 60,
            records: vec![RData::plain("198.51.100.12")],
            ..RRSet::default()
        };
        let created = store.create_rrset(&set).unwrap();
        assert_eq!(created.name, "svc.geodns.test.");
        assert_eq!(created.rtype, "A");

        // Same (zone, name, type) violates the unique index.
        assert!(store.create_rrset(&set).is_err());

        let loaded = store.rrset(zone.id, "svc.geodns.test.", "A").unwrap().unwrap();
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].data, "198.51.100.12");
    }

    #[test]
    fn test_transaction_rollback_on_drop() {
        let store = Store::open_in_memory().unwrap();
        let zone = store.create_zone("geodns.test").unwrap();

        {
            let mut tx = store.begin().unwrap();
            tx.create_rrset(&RRSet {
                zone_id: zone.id,
                name: "www.geodns.test.".to_string(),
                rtype: "A".to_string(),
                ttl: 60,
                records: vec![RData::plain("192.0.2.1")],
                ..RRSet::default()
            })
            .unwrap();
            // Dropped without commit.
        }

        assert!(store.rrset(zone.id, "www.geodns.test.", "A").unwrap().is_none());
    }

    #[test]
    fn test_delete_rrsets_cascades_rdata() {
        let store = Store::open_in_memory().unwrap();
        let zone = store.create_zone("geodns.test").unwrap();
        store
            .create_rrset(&RRSet {
                zone_id: zone.id,
                name: "a.geodns.test.".to_string(),
                rtype: "A".to_string(),
                ttl: 60,
                records: vec![RData::plain("192.0.2.1"), RData::plain("192.0.2.2")],
                ..RRSet::default()
            })
            .unwrap();

        let mut tx = store.begin().unwrap();
        let removed = tx.delete_rrsets_at(zone.id, "a.geodns.test.").unwrap();
        tx.commit().unwrap();
        assert_eq!(removed, 1);

        // Recreating gets a fresh set with no leftover records.
        let recreated = store
            .create_rrset(&RRSet {
                zone_id: zone.id,
                name: "a.geodns.test.".to_string(),
                rtype: "A".to_string(),
                ttl: 60,
                records: vec![],
                ..RRSet::default()
            })
            .unwrap();
        let loaded = store.rrset_by_id(zone.id, recreated.id).unwrap().unwrap();
        assert!(loaded.records.is_empty());
    }

    #[test]
    fn test_selector_fields_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let zone = store.create_zone("geodns.test").unwrap();
        let created = store
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
                    RData {
                        data: "198.51.100.13".to_string(),
                        subnet: Some("8.8.8.0/24".to_string()),
                        ..RData::default()
                    },
                ],
                ..RRSet::default()
            })
            .unwrap();

        let loaded = store.rrset_by_id(zone.id, created.id).unwrap().unwrap();
        assert_eq!(loaded.records[0].country.as_deref(), Some("US"));
        assert!(!loaded.records[0].is_generic());
        assert_eq!(loaded.records[1].subnet.as_deref(), Some("8.8.8.0/24"));
    }
}
