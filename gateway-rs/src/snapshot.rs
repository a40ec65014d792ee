//! Immutable routing snapshots
//!
//! Everything the data path reads per request (rule table, redirects,
//! blocks, access controller, stream rules) is compiled into one
//! [`Snapshot`] and published through an [`ArcSwap`]. A request loads the
//! snapshot once and uses it for its whole lifetime; a reload swaps the
//! pointer atomically, so no request ever observes a mix of two generations.

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::access::{AccessController, BlockTable, GeoIpLookup};
use crate::error::ValidationError;
use crate::redirect::RedirectTable;
use crate::router::RuleTable;
use crate::rules::{BackendEndpoint, RuleSet, StreamProxyRule};

/// One compiled generation of the rule set
#[derive(Debug)]
pub struct Snapshot {
    generation: u64,
    pub routes: RuleTable,
    pub redirects: RedirectTable,
    pub blocks: BlockTable,
    pub access: AccessController,
    pub streams: Vec<StreamProxyRule>,
}

impl Snapshot {
    /// Snapshot with no rules; every request is NotFound
    pub fn empty() -> Self {
        Self {
            generation: 0,
            routes: RuleTable::default(),
            redirects: RedirectTable::default(),
            blocks: BlockTable::default(),
            access: AccessController::permissive(),
            streams: Vec::new(),
        }
    }

    fn compile(
        generation: u64,
        rules: &RuleSet,
        geoip: Arc<dyn GeoIpLookup>,
    ) -> std::result::Result<Self, ValidationError> {
        rules.validate()?;
        // Compilation errors reject the whole set too.
        let compiled = (|| -> crate::error::Result<Self> {
            Ok(Self {
                generation,
                routes: RuleTable::build(&rules.proxy, rules.fallback.as_ref())?,
                redirects: RedirectTable::build(&rules.redirect)?,
                blocks: BlockTable::build(&rules.block)?,
                access: AccessController::build(&rules.access, geoip)?,
                streams: rules.stream.clone(),
            })
        })();
        compiled.map_err(|e| {
            let mut errors = ValidationError::new();
            errors.push("rules", e);
            errors
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Every backend referenced by this snapshot, deduplicated by address
    pub fn endpoints(&self) -> Vec<BackendEndpoint> {
        let mut seen = HashSet::new();
        let http = self
            .routes
            .routes()
            .flat_map(|route| route.rule.backends.iter());
        let stream = self.streams.iter().flat_map(|rule| rule.backends.iter());
        http.chain(stream)
            .filter(|backend| seen.insert(backend.address.clone()))
            .cloned()
            .collect()
    }
}

/// Publisher of the active [`Snapshot`]
pub struct SnapshotHandle {
    current: ArcSwap<Snapshot>,
    /// Serializes compile-and-publish so generations are stored in order
    publish: Mutex<()>,
    geoip: Arc<dyn GeoIpLookup>,
}

impl SnapshotHandle {
    pub fn new(geoip: Arc<dyn GeoIpLookup>) -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::empty()),
            publish: Mutex::new(()),
            geoip,
        }
    }

    /// Validate and compile `rules` without publishing them
    pub fn load_snapshot(&self, rules: &RuleSet) -> std::result::Result<Snapshot, ValidationError> {
        let generation = self.current.load().generation() + 1;
        Snapshot::compile(generation, rules, self.geoip.clone())
    }

    /// Replace the active snapshot.
    ///
    /// On error the previous snapshot stays active, nothing is published and
    /// no generation number is spent. Concurrent reloads publish one at a
    /// time, each one generation above the snapshot it replaces.
    pub fn reload(&self, rules: &RuleSet) -> std::result::Result<Arc<Snapshot>, ValidationError> {
        let _publish = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = self.current.load().generation() + 1;
        match Snapshot::compile(generation, rules, self.geoip.clone()) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.current.store(snapshot.clone());
                info!(
                    generation,
                    routes = snapshot.routes.len(),
                    redirects = snapshot.redirects.len(),
                    streams = snapshot.streams.len(),
                    "Rule snapshot activated"
                );
                Ok(snapshot)
            }
            Err(e) => {
                warn!(generation, error = %e, "Rule set rejected, keeping active snapshot");
                Err(e)
            }
        }
    }

    /// Snapshot to use for one request or connection
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }
}

impl std::fmt::Debug for SnapshotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotHandle")
            .field("generation", &self.current.load().generation())
            .finish()
    }
}
