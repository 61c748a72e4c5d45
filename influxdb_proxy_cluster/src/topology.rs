//! The routing tables built from one configuration load.
use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    backend::{Backend, BackendFactory},
    config::{BackendMap, MeasurementMap},
    ring::{Ring, ShardGroup},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no ring configured for {0}")]
    NotFound(String),

    #[error("{key} matches several measurement prefixes: {prefixes:?}")]
    Ambiguous { key: String, prefixes: Vec<String> },
}

/// Backends, rings and next tier of one configuration load.
///
/// A topology is immutable once built; a reload builds a new one and swaps it in.
#[derive(Debug, Default)]
pub struct Topology {
    backends: BTreeMap<String, Arc<dyn Backend>>,
    rings: BTreeMap<String, Arc<Ring>>,
    nexts: Vec<Arc<dyn Backend>>,
}

impl Topology {
    /// Build every backend and ring the configuration names.
    ///
    /// Problems with individual entries are logged and the entry skipped, so a partially
    /// broken configuration still routes whatever it can.
    pub(crate) fn build(
        backend_configs: &BackendMap,
        measurements: &MeasurementMap,
        next_names: &[String],
        replicas: usize,
        factory: &dyn BackendFactory,
    ) -> Self {
        let mut backends = BTreeMap::new();
        for (name, config) in backend_configs {
            match factory.create(name, config) {
                Ok(backend) => {
                    backends.insert(name.clone(), backend);
                }
                Err(e) => error!(backend = %name, error = %e, "failed to create backend"),
            }
        }

        let mut rings = BTreeMap::new();
        for (prefix, group_names) in measurements {
            let mut groups: Vec<ShardGroup> = Vec::with_capacity(group_names.len());
            for (index, names) in group_names.iter().enumerate() {
                let group: ShardGroup = names
                    .iter()
                    .filter_map(|name| {
                        let backend = backends.get(name).map(Arc::clone);
                        if backend.is_none() {
                            error!(measurement = %prefix, backend = %name, "backend not found");
                        }
                        backend
                    })
                    .collect();
                if group.is_empty() {
                    warn!(
                        measurement = %prefix,
                        group = index,
                        "shard group has no backends, rows routed to it will fail"
                    );
                }
                groups.push(group);
            }

            match Ring::new(groups, replicas) {
                Ok(ring) => {
                    rings.insert(prefix.clone(), Arc::new(ring));
                }
                Err(e) => error!(measurement = %prefix, error = %e, "measurement not routable"),
            }
        }

        for (i, a) in rings.keys().enumerate() {
            for b in rings.keys().skip(i + 1) {
                if b.starts_with(a.as_str()) {
                    warn!(
                        prefix = %a,
                        overlaps = %b,
                        "overlapping measurement prefixes, names matching both only resolve exactly"
                    );
                }
            }
        }

        let nexts = next_names
            .iter()
            .filter_map(|name| {
                let backend = backends.get(name).map(Arc::clone);
                if backend.is_none() {
                    error!(backend = %name, "next tier backend not found");
                }
                backend
            })
            .collect();

        info!(
            backends = backends.len(),
            measurements = rings.len(),
            "cluster topology built"
        );

        Self {
            backends,
            rings,
            nexts,
        }
    }

    /// The ring for `key`: an exact measurement match, or else the one prefix matching it.
    pub fn resolve_ring(&self, key: &str) -> Result<&Arc<Ring>, ResolveError> {
        if let Some(ring) = self.rings.get(key) {
            return Ok(ring);
        }

        let mut matches = self
            .rings
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()));
        match (matches.next(), matches.next()) {
            (Some((_, ring)), None) => Ok(ring),
            (None, _) => Err(ResolveError::NotFound(key.to_string())),
            (Some((first, _)), Some((second, _))) => {
                let mut prefixes = vec![first.clone(), second.clone()];
                prefixes.extend(matches.map(|(p, _)| p.clone()));
                Err(ResolveError::Ambiguous {
                    key: key.to_string(),
                    prefixes,
                })
            }
        }
    }

    /// Configured measurement prefixes, sorted.
    pub fn measurements(&self) -> impl Iterator<Item = &str> {
        self.rings.keys().map(String::as_str)
    }

    /// Backends receiving a verbatim copy of every write.
    pub fn nexts(&self) -> &[Arc<dyn Backend>] {
        &self.nexts
    }

    /// Close every backend, logging failures.
    pub(crate) async fn close_backends(&self) {
        for (name, backend) in &self.backends {
            if let Err(e) = backend.close().await {
                warn!(backend = %name, error = %e, "failed to close backend");
            }
        }
    }
}
