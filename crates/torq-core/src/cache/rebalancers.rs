// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of in-flight rebalancers and their recent results.
//!
//! At most one rebalancer exists per `(origin, origin id, focus channel)`.
//! Results are kept per key twice, once keyed by the incoming channel and
//! once by the outgoing channel. Every 100th append to a list prunes results
//! older than five minutes from its head.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::actor::{self, Actor, ActorHandle};
use crate::error::CacheError;
use crate::types::{
    ChannelId, RebalanceRequestOrigin, RebalanceResult, RebalanceStatus, Rebalancer, RebalancerKey,
};

/// Results younger than this survive pruning.
pub const RESULT_RETENTION_SECS: i64 = 300;

/// Pruning runs on every Nth append to a result list.
pub const RESULT_PRUNE_EVERY: u64 = 100;

type OriginKey = (RebalanceRequestOrigin, i32);
type ResultKey = (RebalanceRequestOrigin, i32, ChannelId);

/// Operations accepted by the rebalancer registry.
#[derive(Debug)]
pub enum RebalancersOp {
    /// One rebalancer.
    Read {
        /// Key.
        key: RebalancerKey,
        /// Reply.
        reply: oneshot::Sender<Option<Rebalancer>>,
    },
    /// Every rebalancer, optionally with one status.
    ReadAll {
        /// Status filter.
        status: Option<RebalanceStatus>,
        /// Reply.
        reply: oneshot::Sender<Vec<Rebalancer>>,
    },
    /// Register a rebalancer; false if the key is taken.
    Write {
        /// Rebalancer.
        rebalancer: Rebalancer,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Change a rebalancer's status.
    WriteStatus {
        /// Key.
        key: RebalancerKey,
        /// Status.
        status: RebalanceStatus,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Remove a rebalancer without cancelling it.
    Delete {
        /// Key.
        key: RebalancerKey,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Remove a rebalancer if it is still the one registered under its key.
    Finish {
        /// Key.
        key: RebalancerKey,
        /// Rebalancer that finished.
        rebalance_id: Uuid,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Cancel and remove a rebalancer.
    Cancel {
        /// Key.
        key: RebalancerKey,
        /// Reply.
        reply: oneshot::Sender<bool>,
    },
    /// Cancel every rebalancer of an origin whose focus channel is not listed.
    CancelExcept {
        /// Origin.
        origin: RebalanceRequestOrigin,
        /// Origin id.
        origin_id: i32,
        /// Focus channels to keep.
        active_channel_ids: Vec<ChannelId>,
        /// Reply with the number cancelled.
        reply: oneshot::Sender<usize>,
    },
    /// Cancel every rebalancer of an origin.
    CancelByOriginId {
        /// Origin.
        origin: RebalanceRequestOrigin,
        /// Origin id.
        origin_id: i32,
        /// Reply with the number cancelled.
        reply: oneshot::Sender<usize>,
    },
    /// Record an attempt's result.
    AppendResult(RebalanceResult),
    /// Newest result for a channel pair.
    LatestResult {
        /// Restrict to one origin.
        origin: Option<OriginKey>,
        /// Incoming channel or 0.
        incoming_channel_id: ChannelId,
        /// Outgoing channel or 0.
        outgoing_channel_id: ChannelId,
        /// Status filter.
        status: Option<RebalanceStatus>,
        /// Reply.
        reply: oneshot::Sender<Option<RebalanceResult>>,
    },
}

#[derive(Debug, Default)]
struct ResultList {
    results: VecDeque<RebalanceResult>,
    appends: u64,
}

impl ResultList {
    fn append(&mut self, result: RebalanceResult, now: DateTime<Utc>) {
        self.results.push_back(result);
        self.appends += 1;
        if self.appends % RESULT_PRUNE_EVERY == 0 {
            let cutoff = now - Duration::seconds(RESULT_RETENTION_SECS);
            while self
                .results
                .front()
                .is_some_and(|oldest| oldest.updated_on <= cutoff)
            {
                self.results.pop_front();
            }
        }
    }

    fn latest(&self, outgoing_channel_id: ChannelId, incoming_channel_id: ChannelId, status: Option<RebalanceStatus>) -> Option<&RebalanceResult> {
        self.results.iter().rev().find(|result| {
            (incoming_channel_id == 0 || result.incoming_channel_id == incoming_channel_id)
                && (outgoing_channel_id == 0 || result.outgoing_channel_id == outgoing_channel_id)
                && status.is_none_or(|status| result.status == status)
        })
    }
}

#[derive(Default)]
struct RebalancersCache {
    rebalancers: HashMap<RebalanceRequestOrigin, HashMap<i32, HashMap<ChannelId, Rebalancer>>>,
    incoming_results: HashMap<ResultKey, ResultList>,
    outgoing_results: HashMap<ResultKey, ResultList>,
}

/// At least one channel must be set; with `exclusive` exactly one.
fn validate(incoming: ChannelId, outgoing: ChannelId, exclusive: bool) -> Result<(), CacheError> {
    if incoming == 0 && outgoing == 0 {
        return Err(CacheError::MissingFocusChannel);
    }
    if exclusive && incoming != 0 && outgoing != 0 {
        return Err(CacheError::AmbiguousFocusChannel { incoming, outgoing });
    }
    Ok(())
}

fn validate_key(key: &RebalancerKey, operation: &'static str) -> bool {
    match validate(key.incoming_channel_id, key.outgoing_channel_id, true) {
        Ok(()) => true,
        Err(e) => {
            error!(operation, error = %e, "Invalid rebalancer request");
            false
        }
    }
}

impl RebalancersCache {
    fn get(&self, key: &RebalancerKey) -> Option<&Rebalancer> {
        self.rebalancers
            .get(&key.origin)?
            .get(&key.origin_id)?
            .get(&key.focus_channel_id())
    }

    fn get_mut(&mut self, key: &RebalancerKey) -> Option<&mut Rebalancer> {
        self.rebalancers
            .get_mut(&key.origin)?
            .get_mut(&key.origin_id)?
            .get_mut(&key.focus_channel_id())
    }

    fn remove(&mut self, key: &RebalancerKey) -> Option<Rebalancer> {
        let by_origin = self.rebalancers.get_mut(&key.origin)?;
        let by_id = by_origin.get_mut(&key.origin_id)?;
        let removed = by_id.remove(&key.focus_channel_id());
        if by_id.is_empty() {
            by_origin.remove(&key.origin_id);
        }
        removed
    }

    fn write(&mut self, rebalancer: Rebalancer) -> bool {
        let key = rebalancer.key();
        if !validate_key(&key, "write") {
            return false;
        }
        let slot = self
            .rebalancers
            .entry(key.origin)
            .or_default()
            .entry(key.origin_id)
            .or_default();
        if slot.contains_key(&key.focus_channel_id()) {
            return false;
        }
        slot.insert(key.focus_channel_id(), rebalancer);
        true
    }

    fn cancel_where(&mut self, origin: RebalanceRequestOrigin, origin_id: i32, cancel: impl Fn(ChannelId) -> bool) -> usize {
        let Some(by_id) = self
            .rebalancers
            .get_mut(&origin)
            .and_then(|by_origin| by_origin.get_mut(&origin_id))
        else {
            return 0;
        };
        let doomed: Vec<ChannelId> = by_id.keys().copied().filter(|id| cancel(*id)).collect();
        for channel_id in &doomed {
            if let Some(rebalancer) = by_id.remove(channel_id) {
                rebalancer.cancel.cancel();
                debug!(origin = origin.as_str(), origin_id, channel_id, "Rebalancer cancelled");
            }
        }
        if by_id.is_empty()
            && let Some(by_origin) = self.rebalancers.get_mut(&origin)
        {
            by_origin.remove(&origin_id);
        }
        doomed.len()
    }

    fn append_result(&mut self, result: RebalanceResult) {
        if let Err(e) = validate(result.incoming_channel_id, result.outgoing_channel_id, false) {
            error!(error = %e, "Invalid rebalance result");
            return;
        }
        let now = Utc::now();
        if result.incoming_channel_id != 0 {
            self.incoming_results
                .entry((result.origin, result.origin_id, result.incoming_channel_id))
                .or_default()
                .append(result.clone(), now);
        }
        if result.outgoing_channel_id != 0 {
            self.outgoing_results
                .entry((result.origin, result.origin_id, result.outgoing_channel_id))
                .or_default()
                .append(result, now);
        }
    }

    fn latest_result(
        &self,
        origin: Option<OriginKey>,
        incoming_channel_id: ChannelId,
        outgoing_channel_id: ChannelId,
        status: Option<RebalanceStatus>,
    ) -> Option<RebalanceResult> {
        if let Err(e) = validate(incoming_channel_id, outgoing_channel_id, false) {
            error!(error = %e, "Invalid rebalance result lookup");
            return None;
        }
        let (lists, channel_id) = if incoming_channel_id != 0 {
            (&self.incoming_results, incoming_channel_id)
        } else {
            (&self.outgoing_results, outgoing_channel_id)
        };
        lists
            .iter()
            .filter(|((list_origin, list_origin_id, list_channel), _)| {
                *list_channel == channel_id
                    && origin.is_none_or(|(o, id)| o == *list_origin && id == *list_origin_id)
            })
            .filter_map(|(_, list)| list.latest(outgoing_channel_id, incoming_channel_id, status))
            .max_by_key(|result| result.updated_on)
            .cloned()
    }
}

impl Actor for RebalancersCache {
    type Op = RebalancersOp;
    const NAME: &'static str = "rebalancers";

    fn handle(&mut self, op: RebalancersOp) {
        match op {
            RebalancersOp::Read { key, reply } => {
                let rebalancer = if validate_key(&key, "read") {
                    self.get(&key).cloned()
                } else {
                    None
                };
                let _ = reply.send(rebalancer);
            }
            RebalancersOp::ReadAll { status, reply } => {
                let mut all: Vec<Rebalancer> = self
                    .rebalancers
                    .values()
                    .flat_map(HashMap::values)
                    .flat_map(HashMap::values)
                    .filter(|rebalancer| status.is_none_or(|status| rebalancer.status == status))
                    .cloned()
                    .collect();
                all.sort_by_key(|rebalancer| rebalancer.created_on);
                let _ = reply.send(all);
            }
            RebalancersOp::Write { rebalancer, reply } => {
                let _ = reply.send(self.write(rebalancer));
            }
            RebalancersOp::WriteStatus { key, status, reply } => {
                let updated = validate_key(&key, "status")
                    && match self.get_mut(&key) {
                        Some(rebalancer) => {
                            rebalancer.status = status;
                            rebalancer.updated_on = Utc::now();
                            true
                        }
                        None => false,
                    };
                let _ = reply.send(updated);
            }
            RebalancersOp::Delete { key, reply } => {
                let deleted = validate_key(&key, "delete") && self.remove(&key).is_some();
                let _ = reply.send(deleted);
            }
            RebalancersOp::Finish {
                key,
                rebalance_id,
                reply,
            } => {
                let finished = validate_key(&key, "finish")
                    && self
                        .get(&key)
                        .is_some_and(|rebalancer| rebalancer.rebalance_id == rebalance_id)
                    && self.remove(&key).is_some();
                let _ = reply.send(finished);
            }
            RebalancersOp::Cancel { key, reply } => {
                let cancelled = match validate(key.incoming_channel_id, key.outgoing_channel_id, false) {
                    Ok(()) => match self.remove(&key) {
                        Some(rebalancer) => {
                            rebalancer.cancel.cancel();
                            true
                        }
                        None => false,
                    },
                    Err(e) => {
                        error!(operation = "cancel", error = %e, "Invalid rebalancer request");
                        false
                    }
                };
                let _ = reply.send(cancelled);
            }
            RebalancersOp::CancelExcept {
                origin,
                origin_id,
                active_channel_ids,
                reply,
            } => {
                let cancelled = self.cancel_where(origin, origin_id, |channel_id| {
                    !active_channel_ids.contains(&channel_id)
                });
                let _ = reply.send(cancelled);
            }
            RebalancersOp::CancelByOriginId {
                origin,
                origin_id,
                reply,
            } => {
                let _ = reply.send(self.cancel_where(origin, origin_id, |_| true));
            }
            RebalancersOp::AppendResult(result) => self.append_result(result),
            RebalancersOp::LatestResult {
                origin,
                incoming_channel_id,
                outgoing_channel_id,
                status,
                reply,
            } => {
                let _ = reply.send(self.latest_result(
                    origin,
                    incoming_channel_id,
                    outgoing_channel_id,
                    status,
                ));
            }
        }
    }
}

/// Handle to the rebalancer registry.
#[derive(Debug, Clone)]
pub struct RebalancersCacheHandle {
    inner: ActorHandle<RebalancersOp>,
}

impl RebalancersCacheHandle {
    /// Start the registry.
    pub fn spawn(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (inner, task) = actor::spawn(RebalancersCache::default(), cancel);
        (Self { inner }, task)
    }

    /// One rebalancer.
    pub async fn rebalancer(&self, key: RebalancerKey) -> Option<Rebalancer> {
        self.inner
            .request(|reply| RebalancersOp::Read { key, reply })
            .await
    }

    /// Every rebalancer, oldest first, optionally with one status.
    pub async fn rebalancers(&self, status: Option<RebalanceStatus>) -> Vec<Rebalancer> {
        self.inner
            .request(|reply| RebalancersOp::ReadAll { status, reply })
            .await
    }

    /// Register a rebalancer. Returns false if its key is taken.
    pub async fn add_rebalancer(&self, rebalancer: Rebalancer) -> bool {
        self.inner
            .request(|reply| RebalancersOp::Write { rebalancer, reply })
            .await
    }

    /// Change a rebalancer's status.
    pub async fn set_rebalancer_status(&self, key: RebalancerKey, status: RebalanceStatus) -> bool {
        self.inner
            .request(|reply| RebalancersOp::WriteStatus { key, status, reply })
            .await
    }

    /// Remove a rebalancer without cancelling it.
    pub async fn remove_rebalancer(&self, key: RebalancerKey) -> bool {
        self.inner
            .request(|reply| RebalancersOp::Delete { key, reply })
            .await
    }

    /// Remove a finished rebalancer unless its key was taken over.
    pub async fn finish_rebalancer(&self, key: RebalancerKey, rebalance_id: Uuid) -> bool {
        self.inner
            .request(|reply| RebalancersOp::Finish {
                key,
                rebalance_id,
                reply,
            })
            .await
    }

    /// Cancel and remove a rebalancer.
    pub async fn cancel_rebalancer(&self, key: RebalancerKey) -> bool {
        self.inner
            .request(|reply| RebalancersOp::Cancel { key, reply })
            .await
    }

    /// Cancel every rebalancer of an origin whose focus channel is not in
    /// `active_channel_ids`.
    pub async fn cancel_rebalancers_except(
        &self,
        origin: RebalanceRequestOrigin,
        origin_id: i32,
        active_channel_ids: Vec<ChannelId>,
    ) -> usize {
        self.inner
            .request(|reply| RebalancersOp::CancelExcept {
                origin,
                origin_id,
                active_channel_ids,
                reply,
            })
            .await
    }

    /// Cancel every rebalancer of an origin.
    pub async fn cancel_rebalancers_by_origin_id(&self, origin: RebalanceRequestOrigin, origin_id: i32) -> usize {
        self.inner
            .request(|reply| RebalancersOp::CancelByOriginId {
                origin,
                origin_id,
                reply,
            })
            .await
    }

    /// Record an attempt's result.
    pub fn add_result(&self, result: RebalanceResult) {
        self.inner.tell(RebalancersOp::AppendResult(result));
    }

    /// Newest result for a channel pair across every origin.
    pub async fn latest_result(
        &self,
        incoming_channel_id: ChannelId,
        outgoing_channel_id: ChannelId,
        status: Option<RebalanceStatus>,
    ) -> Option<RebalanceResult> {
        self.inner
            .request(|reply| RebalancersOp::LatestResult {
                origin: None,
                incoming_channel_id,
                outgoing_channel_id,
                status,
                reply,
            })
            .await
    }

    /// Newest result for a channel pair of one origin.
    pub async fn latest_result_by_origin(
        &self,
        origin: RebalanceRequestOrigin,
        origin_id: i32,
        incoming_channel_id: ChannelId,
        outgoing_channel_id: ChannelId,
        status: Option<RebalanceStatus>,
    ) -> Option<RebalanceResult> {
        self.inner
            .request(|reply| RebalancersOp::LatestResult {
                origin: Some((origin, origin_id)),
                incoming_channel_id,
                outgoing_channel_id,
                status,
                reply,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RebalanceRequest;

    fn request(origin_id: i32, incoming: ChannelId, outgoing: ChannelId) -> RebalanceRequest {
        RebalanceRequest {
            node_id: 1,
            origin: Some(RebalanceRequestOrigin::Workflow),
            origin_id,
            incoming_channel_id: incoming,
            outgoing_channel_id: outgoing,
            amount_msat: 100_000,
            ..Default::default()
        }
    }

    fn result(incoming: ChannelId, outgoing: ChannelId, status: RebalanceStatus, age_secs: i64) -> RebalanceResult {
        RebalanceResult {
            rebalance_id: Uuid::new_v4(),
            origin: RebalanceRequestOrigin::Workflow,
            origin_id: 42,
            incoming_channel_id: incoming,
            outgoing_channel_id: outgoing,
            status,
            hops: Vec::new(),
            total_fee_msat: 0,
            total_amount_msat: 0,
            error: None,
            updated_on: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_validation() {
        let cancel = CancellationToken::new();
        let (cache, _task) = RebalancersCacheHandle::spawn(cancel.clone());
        let both = Rebalancer::new(request(1, 5, 6), CancellationToken::new());
        assert!(!cache.add_rebalancer(both).await);
        let neither = Rebalancer::new(request(1, 0, 0), CancellationToken::new());
        assert!(!cache.add_rebalancer(neither).await);
        assert!(cache.latest_result(0, 0, None).await.is_none());
        assert!(cache.rebalancers(None).await.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_status_update_and_filter() {
        let cancel = CancellationToken::new();
        let (cache, _task) = RebalancersCacheHandle::spawn(cancel.clone());
        let first = Rebalancer::new(request(1, 5, 0), CancellationToken::new());
        let key = first.key();
        assert!(cache.add_rebalancer(first).await);
        assert!(cache.add_rebalancer(Rebalancer::new(request(1, 6, 0), CancellationToken::new())).await);

        assert!(cache.set_rebalancer_status(key, RebalanceStatus::Active).await);
        assert_eq!(cache.rebalancers(Some(RebalanceStatus::Active)).await.len(), 1);
        assert_eq!(cache.rebalancers(Some(RebalanceStatus::Pending)).await.len(), 1);
        assert_eq!(cache.rebalancers(None).await.len(), 2);

        assert!(cache.remove_rebalancer(key).await);
        assert!(!cache.remove_rebalancer(key).await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_finish_keeps_replacement() {
        let cancel = CancellationToken::new();
        let (cache, _task) = RebalancersCacheHandle::spawn(cancel.clone());
        let first = Rebalancer::new(request(1, 5, 0), CancellationToken::new());
        let (key, first_id) = (first.key(), first.rebalance_id);
        assert!(cache.add_rebalancer(first).await);
        assert!(cache.cancel_rebalancer(key).await);

        let replacement = Rebalancer::new(request(1, 5, 0), CancellationToken::new());
        let replacement_id = replacement.rebalance_id;
        assert!(cache.add_rebalancer(replacement).await);
        assert!(!cache.finish_rebalancer(key, first_id).await);
        assert!(cache.rebalancer(key).await.is_some());
        assert!(cache.finish_rebalancer(key, replacement_id).await);
        assert!(cache.rebalancer(key).await.is_none());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_by_origin_id() {
        let cancel = CancellationToken::new();
        let (cache, _task) = RebalancersCacheHandle::spawn(cancel.clone());
        let tokens: Vec<CancellationToken> = (0..3).map(|_| CancellationToken::new()).collect();
        for (i, token) in tokens.iter().enumerate() {
            let rebalancer = Rebalancer::new(request(7, 10 + i as i32, 0), token.clone());
            assert!(cache.add_rebalancer(rebalancer).await);
        }
        let other = CancellationToken::new();
        assert!(cache.add_rebalancer(Rebalancer::new(request(8, 10, 0), other.clone())).await);

        assert_eq!(
            cache
                .cancel_rebalancers_by_origin_id(RebalanceRequestOrigin::Workflow, 7)
                .await,
            3
        );
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
        assert!(!other.is_cancelled());
        assert_eq!(cache.rebalancers(None).await.len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_latest_result() {
        let cancel = CancellationToken::new();
        let (cache, _task) = RebalancersCacheHandle::spawn(cancel.clone());
        cache.add_result(result(5, 6, RebalanceStatus::Inactive, 30));
        cache.add_result(result(5, 6, RebalanceStatus::Active, 20));
        cache.add_result(result(5, 7, RebalanceStatus::Inactive, 10));

        let latest = cache.latest_result(5, 0, None).await.unwrap();
        assert_eq!(latest.outgoing_channel_id, 7);
        let latest = cache.latest_result(5, 6, None).await.unwrap();
        assert_eq!(latest.status, RebalanceStatus::Active);
        let latest = cache
            .latest_result(0, 6, Some(RebalanceStatus::Inactive))
            .await
            .unwrap();
        assert_eq!(latest.incoming_channel_id, 5);

        assert!(
            cache
                .latest_result_by_origin(RebalanceRequestOrigin::Manual, 42, 5, 0, None)
                .await
                .is_none()
        );
        assert!(
            cache
                .latest_result_by_origin(RebalanceRequestOrigin::Workflow, 42, 5, 0, None)
                .await
                .is_some()
        );
        cancel.cancel();
    }
}
