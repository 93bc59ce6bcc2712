//! Fan-out of one request to many peers, each settled independently.
//!
//! Each target gets its own send with its own timeout. A failure for one
//! target (timeout, error reply, dead peer) is recorded for that target only
//! and never aborts or delays its siblings.

use crate::caller::{Caller, SendOptions};
use crate::transport::Peer;
use courier_types::{BusError, BusResult, Operation};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Predicate selecting which peers receive a broadcast.
pub type PeerFilter = Arc<dyn Fn(&Peer) -> bool + Send + Sync>;

/// Options for a broadcast.
#[derive(Clone, Default)]
pub struct BroadcastOptions {
    /// Only peers for which this returns true are targeted.
    pub filter: Option<PeerFilter>,
    /// Per-target timeout. Defaults to the bus configuration.
    pub timeout: Option<Duration>,
}

impl BroadcastOptions {
    /// Options targeting every reachable peer with the configured timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Only target peers for which `f` returns true.
    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&Peer) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(f));
        self
    }

    /// Per-target deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_ms(self, ms: u64) -> Self {
        self.timeout(Duration::from_millis(ms))
    }
}

impl fmt::Debug for BroadcastOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastOptions")
            .field("filter", &self.filter.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Outcome for one broadcast target.
#[derive(Debug)]
pub struct TargetOutcome<T> {
    pub peer: Peer,
    pub outcome: BusResult<T>,
}

/// Aggregated broadcast outcomes, one per target, in target order.
#[derive(Debug)]
pub struct BroadcastReport<T> {
    /// Number of targets the request was issued to.
    pub target_count: usize,
    pub results: Vec<TargetOutcome<T>>,
}

impl<T> BroadcastReport<T> {
    /// Number of targets that answered successfully.
    pub fn fulfilled_count(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_ok()).count()
    }

    /// Number of targets that failed.
    pub fn rejected_count(&self) -> usize {
        self.target_count - self.fulfilled_count()
    }

    /// Successful results with the peer that produced them.
    pub fn fulfilled(&self) -> impl Iterator<Item = (&Peer, &T)> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok().map(|v| (&r.peer, v)))
    }

    /// Failures with the peer that produced them.
    pub fn rejected(&self) -> impl Iterator<Item = (&Peer, &BusError)> {
        self.results
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|e| (&r.peer, e)))
    }
}

/// Issue `O` with `payload` to every peer in `peers` that passes the filter.
pub async fn broadcast<O: Operation>(
    caller: &Caller,
    peers: Vec<Peer>,
    payload: O::Payload,
    filter: Option<&PeerFilter>,
    timeout: Duration,
) -> BroadcastReport<O::Output> {
    let targets: Vec<Peer> = peers
        .into_iter()
        .filter(|peer| filter.map_or(true, |f| f(peer)))
        .collect();

    debug!(
        kind = O::TYPE,
        targets = targets.len(),
        timeout_ms = timeout.as_millis() as u64,
        "Broadcasting request"
    );

    let payload = match serde_json::to_value(payload) {
        Ok(payload) => payload,
        Err(e) => {
            let err = BusError::bad_request(format!("Failed to encode {} payload: {e}", O::TYPE));
            return BroadcastReport {
                target_count: targets.len(),
                results: targets
                    .into_iter()
                    .map(|peer| TargetOutcome {
                        peer,
                        outcome: Err(err.clone()),
                    })
                    .collect(),
            };
        }
    };

    let calls = targets.iter().map(|peer| {
        let mut options = SendOptions::new().to(peer.role.clone()).timeout(timeout);
        options.target = peer.context.clone();
        let payload = payload.clone();
        async move {
            let result = caller.send_raw(O::TYPE, payload, options).await?;
            serde_json::from_value::<O::Output>(result)
                .map_err(|e| BusError::internal(format!("Malformed {} result: {e}", O::TYPE)))
        }
    });
    let outcomes = join_all(calls).await;

    BroadcastReport {
        target_count: targets.len(),
        results: targets
            .into_iter()
            .zip(outcomes)
            .map(|(peer, outcome)| TargetOutcome { peer, outcome })
            .collect(),
    }
}
