//! Shared server state
//!
//! One `ServerContext` is assembled at startup and handed to every
//! listener, worker and background task. It owns the store handle, the
//! answer cache, the GeoIP provider and the process-wide shutdown flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::dns::cache::AnswerCache;
use crate::dns::client::ForwarderClient;
use crate::geo::{GeoProvider, MmdbProvider, NoopProvider, StopHandle};
use crate::store::Store;

/// Cooperative shutdown flag shared by every long-lived loop.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> ShutdownSignal {
        ShutdownSignal::default()
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct ServerContext {
    pub config: Config,
    pub store: Store,
    pub cache: AnswerCache,
    pub geo: Box<dyn GeoProvider>,
    pub forwarder: ForwarderClient,
    pub shutdown: ShutdownSignal,
    /// Keeps the GeoIP reload/download tasks alive until shutdown.
    pub geo_stop: Option<StopHandle>,
}

impl ServerContext {
    /// Assemble the runtime from configuration and an opened store. A
    /// failing GeoIP load degrades to the no-op provider with a log
    /// line; queries then run without geo information.
    pub fn new(config: Config, store: Store) -> ServerContext {
        let mut geo: Box<dyn GeoProvider> = Box::new(NoopProvider);
        let mut geo_stop = None;

        if config.geoip.enabled && !config.geoip.mmdb_path.is_empty() {
            match MmdbProvider::new_from_path(
                &config.geoip.mmdb_path,
                Duration::from_secs(config.geoip.reload_sec),
                config.geoip.download_urls.clone(),
                Duration::from_secs(config.geoip.download_interval_sec),
            ) {
                Ok((provider, stop)) => {
                    geo = Box::new(ArcProvider(provider));
                    geo_stop = Some(stop);
                }
                Err(e) => {
                    log::warn!("geoip: {}; serving without geo information", e);
                }
            }
        }

        let cache = AnswerCache::new(config.cache.size);

        ServerContext {
            forwarder: ForwarderClient::new(Duration::from_secs(2)),
            cache,
            geo,
            geo_stop,
            shutdown: ShutdownSignal::new(),
            config,
            store,
        }
    }
}

/// Adapter so an `Arc`-shared provider satisfies the boxed trait slot.
struct ArcProvider(Arc<MmdbProvider>);

impl GeoProvider for ArcProvider {
    fn lookup(&self, ip: std::net::IpAddr) -> crate::geo::Info {
        self.0.lookup(ip)
    }
}
