//! Meridian DNS Server
//!
//! An authoritative DNS server that selects answer records based on the
//! querying client's network location: subnet, autonomous system, country
//! or continent. Zone data lives in a relational store and is replicated
//! from a single master to any number of read-only slaves by periodic pull.
//!
//! # Features
//!
//! * Full DNS protocol support (UDP and TCP)
//! * Geo-aware record selection driven by MaxMind databases
//! * RFC 2136 dynamic updates with optional TSIG authentication
//! * Per-client-scope answer caching with TTL support
//! * Master/slave replication over a JSON snapshot API
//!
//! # Architecture
//!
//! * `dns` - the serving core: wire codec, listeners, query pipeline,
//!   dynamic updates, answer cache
//! * `geo` - GeoIP providers with hot reload
//! * `store` - zone/rrset/rdata persistence
//! * `replication` - slave-side pull synchronization
//! * `web` - management and replication HTTP API
//! * `config` - YAML configuration

/// YAML configuration loading
pub mod config;

/// DNS server implementation and protocol handling
pub mod dns;

/// GeoIP lookup providers
pub mod geo;

/// Slave-side pull replication
pub mod replication;

/// Persistent zone storage
pub mod store;

/// Management HTTP API
pub mod web;
