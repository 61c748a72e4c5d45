//! Backend selection and scatter/gather for queries.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    backend::{Backend, BackendError, QueryRequest, is_readable},
    ring::ShardGroup,
};

#[derive(Debug, Error)]
pub enum GroupError {
    #[error("no active readable backend in shard group")]
    NoCandidates,

    #[error("every backend in shard group failed, last error: {0}")]
    AllFailed(#[source] BackendError),
}

/// Readable replicas of `group` in the order they should be tried: those in `zone` first,
/// then the others, each in configuration order.
pub fn candidates<'a>(group: &'a [Arc<dyn Backend>], zone: &str) -> Vec<&'a Arc<dyn Backend>> {
    let (local, remote): (Vec<_>, Vec<_>) = group
        .iter()
        .filter(|&b| is_readable(&**b))
        .partition(|b| b.zone() == zone);
    local.into_iter().chain(remote).collect()
}

/// Run `request` against the replicas of `group` until one answers.
pub async fn query_group(
    group: &[Arc<dyn Backend>],
    zone: &str,
    request: &QueryRequest,
    timeout: Duration,
) -> Result<Bytes, GroupError> {
    let mut last_error = None;
    for backend in candidates(group, zone) {
        let result = match tokio::time::timeout(timeout, backend.query(request)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                name: backend.name().to_string(),
                timeout,
            }),
        };
        match result {
            Ok(body) => {
                debug!(backend = %backend.name(), "query answered");
                return Ok(body);
            }
            Err(e) => {
                warn!(backend = %backend.name(), error = %e, "query failed, trying next replica");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.map_or(GroupError::NoCandidates, GroupError::AllFailed))
}

/// Run `request` once per shard group, concurrently.
///
/// Responses are returned in shard group order. The first failing group fails the whole
/// fan-out.
pub async fn fan_out(
    groups: &[ShardGroup],
    zone: &str,
    request: &QueryRequest,
    timeout: Duration,
) -> Result<Vec<Bytes>, (usize, GroupError)> {
    let (tx, mut rx) = mpsc::channel(groups.len().max(1));

    for (index, group) in groups.iter().enumerate() {
        let tx = tx.clone();
        let group = group.clone();
        let zone = zone.to_string();
        let request = request.clone();
        tokio::spawn(async move {
            let result = query_group(&group, &zone, &request, timeout).await;
            // the receiver only goes away once the fan-out has already failed
            let _ = tx.send((index, result)).await;
        });
    }
    drop(tx);

    let mut responses = Vec::with_capacity(groups.len());
    while let Some((index, result)) = rx.recv().await {
        match result {
            Ok(body) => responses.push((index, body)),
            Err(e) => return Err((index, e)),
        }
    }
    responses.sort_by_key(|(index, _)| *index);
    Ok(responses.into_iter().map(|(_, body)| body).collect())
}
