//! DNS serving core
//!
//! This module contains the transport-agnostic DNS codec and the pieces of
//! the serving pipeline built on top of it:
//!
//! * `buffer` - low-level packet buffers with name compression
//! * `protocol` - header, question, record and packet types
//! * `netutil` - TCP length-prefix plumbing
//! * `cache` - the per-client-scope answer cache
//! * `selector` - geo-aware record selection
//! * `client` - the forwarder client for local misses
//! * `tsig` - RFC 8945 transaction signatures
//! * `update` - RFC 2136 dynamic update processing
//! * `context` - shared server state
//! * `server` - the query pipeline and the UDP/TCP listeners

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// Internal network utilities
pub mod netutil;

/// Geo-scoped answer caching with TTL support
pub mod cache;

/// Geo-aware rdata selection
pub mod selector;

/// DNS client for forwarding queries upstream
pub mod client;

/// TSIG message authentication (RFC 8945)
pub mod tsig;

/// Dynamic update processing (RFC 2136)
pub mod update;

/// Server configuration and shared context
pub mod context;

/// UDP and TCP DNS server implementations
pub mod server;
