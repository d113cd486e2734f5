//! Replication coordinator
//!
//! Drives client operations against the ordered candidate nodes of a key.
//! Writes complete in tiers: callers wait for the minimal, optimal or
//! maximal number of acknowledgements and may come back for a higher tier
//! later. `finish()` freezes the per-node accounting.
//!
//! Per node a write moves through:
//! ```text
//! Untried -> InFlight -> Succeeded
//!                     -> AwaitingRetry -> Untried (next retry round)
//!                     -> Failed
//! ```
//! and `finish()` turns whatever was never tried into `Ignored`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use ringstore_core::clock::Clock;
use ringstore_core::entry::{decompress_content, EntryMetadata};
use ringstore_core::error::{QuorumTier, Result, RingStoreError};
use ringstore_core::key::{EntryKey, KeyCodec};
use tracing::{debug, instrument, warn};

use crate::config::CoordinatorConfig;
use crate::metrics;
use crate::topology::{NodeId, RingTopology};
use crate::transport::{
    call_with_timeout, CallError, CallResult, GetResponse, HeadResponse, ItemInfo, PeerTransport,
    PutRequest,
};

/// Kind of replicated operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Put,
    Delete,
    Get,
    Info,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Put => "put",
            OperationKind::Delete => "delete",
            OperationKind::Get => "get",
            OperationKind::Info => "info",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a node stands within one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Not attempted in the current round
    Untried,
    InFlight,
    Succeeded,
    /// Failed, will be tried again in the next retry round
    AwaitingRetry,
    Failed,
    /// Never contacted before the operation finished
    Ignored,
}

/// Per-node accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCallRecord {
    pub node: NodeId,
    pub attempts: u32,
    pub outcome: NodeOutcome,
    pub last_error: Option<CallError>,
}

/// Progress of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Created,
    PartiallyCompleted(usize),
    MinimallySatisfied,
    OptimallySatisfied,
    MaximallySatisfied,
    Finished,
}

/// Outcome counts and per-node records of one logical operation
#[derive(Debug, Clone)]
pub struct OperationResult {
    kind: OperationKind,
    records: Vec<NodeCallRecord>,
    minimal_oks: usize,
    optimal_oks: usize,
    max_oks: usize,
    finished: bool,
}

impl OperationResult {
    fn new(
        kind: OperationKind,
        candidates: Vec<NodeId>,
        minimal_oks: usize,
        optimal_oks: usize,
        max_oks: usize,
    ) -> Self {
        let records = candidates
            .into_iter()
            .map(|node| NodeCallRecord {
                node,
                attempts: 0,
                outcome: NodeOutcome::Untried,
                last_error: None,
            })
            .collect();
        Self {
            kind,
            records,
            minimal_oks,
            optimal_oks,
            max_oks,
            finished: false,
        }
    }

    fn count(&self, outcome: NodeOutcome) -> usize {
        self.records.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn success_count(&self) -> usize {
        self.count(NodeOutcome::Succeeded)
    }

    pub fn fail_count(&self) -> usize {
        self.count(NodeOutcome::Failed)
    }

    pub fn ignore_count(&self) -> usize {
        self.count(NodeOutcome::Ignored)
    }

    /// Number of nodes the key maps to
    pub fn candidates(&self) -> usize {
        self.records.len()
    }

    pub fn minimal_oks(&self) -> usize {
        self.minimal_oks
    }

    pub fn optimal_oks(&self) -> usize {
        self.optimal_oks
    }

    pub fn max_oks(&self) -> usize {
        self.max_oks
    }

    pub fn threshold(&self, tier: QuorumTier) -> usize {
        match tier {
            QuorumTier::Minimal => self.minimal_oks,
            QuorumTier::Optimal => self.optimal_oks,
            QuorumTier::Maximal => self.max_oks,
        }
    }

    pub fn succeeded_minimally(&self) -> bool {
        self.success_count() >= self.minimal_oks
    }

    pub fn succeeded_optimally(&self) -> bool {
        self.success_count() >= self.optimal_oks
    }

    pub fn succeeded_maximally(&self) -> bool {
        self.success_count() >= self.max_oks
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn records(&self) -> &[NodeCallRecord] {
        &self.records
    }

    pub fn record(&self, node: &NodeId) -> Option<&NodeCallRecord> {
        self.records.iter().find(|r| &r.node == node)
    }

    pub fn state(&self) -> OperationState {
        if self.finished {
            OperationState::Finished
        } else if self.succeeded_maximally() {
            OperationState::MaximallySatisfied
        } else if self.succeeded_optimally() {
            OperationState::OptimallySatisfied
        } else if self.succeeded_minimally() {
            OperationState::MinimallySatisfied
        } else if self.records.iter().any(|r| r.attempts > 0) {
            OperationState::PartiallyCompleted(self.success_count())
        } else {
            OperationState::Created
        }
    }

    fn next_untried(&self) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.outcome == NodeOutcome::Untried)
    }

    fn has_awaiting_retry(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.outcome == NodeOutcome::AwaitingRetry)
    }

    fn reset_retries(&mut self) {
        for record in &mut self.records {
            if record.outcome == NodeOutcome::AwaitingRetry {
                record.outcome = NodeOutcome::Untried;
            }
        }
    }

    fn mark_success(&mut self, index: usize) {
        let record = &mut self.records[index];
        record.outcome = NodeOutcome::Succeeded;
        record.last_error = None;
    }

    fn mark_failure(&mut self, index: usize, error: CallError, retry: bool) {
        let record = &mut self.records[index];
        record.outcome = if retry {
            NodeOutcome::AwaitingRetry
        } else {
            NodeOutcome::Failed
        };
        record.last_error = Some(error);
    }

    /// Settle every open slot and freeze the result
    fn close(&mut self) {
        for record in &mut self.records {
            record.outcome = match record.outcome {
                NodeOutcome::Untried if record.attempts > 0 => NodeOutcome::Failed,
                NodeOutcome::Untried | NodeOutcome::InFlight => NodeOutcome::Ignored,
                NodeOutcome::AwaitingRetry => NodeOutcome::Failed,
                other => other,
            };
        }
        self.finished = true;
        metrics::record_operation(self.kind.as_str());
    }

    fn unreachable_error(&self) -> RingStoreError {
        metrics::record_threshold_unreachable(self.kind.as_str());
        RingStoreError::ThresholdUnreachable {
            tier: QuorumTier::Minimal,
            needed: self.minimal_oks,
            achieved: self.success_count(),
        }
    }
}

#[derive(Debug, Clone)]
enum WriteCall {
    Put(PutRequest),
    Delete(EntryKey),
}

/// A PUT or DELETE in progress
pub struct WriteOperation {
    key: EntryKey,
    call: WriteCall,
    transport: Arc<dyn PeerTransport>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    result: OperationResult,
    retry_round: u32,
}

impl WriteOperation {
    fn new(
        kind: OperationKind,
        key: EntryKey,
        call: WriteCall,
        candidates: Vec<NodeId>,
        transport: Arc<dyn PeerTransport>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        let result = OperationResult::new(
            kind,
            candidates,
            config.minimal_oks,
            config.optimal_oks,
            config.max_oks,
        );
        Self {
            key,
            call,
            transport,
            clock,
            config,
            result,
            retry_round: 0,
        }
    }

    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    /// Live view of the accounting
    pub fn result(&self) -> &OperationResult {
        &self.result
    }

    pub fn state(&self) -> OperationState {
        self.result.state()
    }

    pub fn succeeded_minimally(&self) -> bool {
        self.result.succeeded_minimally()
    }

    pub fn succeeded_optimally(&self) -> bool {
        self.result.succeeded_optimally()
    }

    pub fn succeeded_maximally(&self) -> bool {
        self.result.succeeded_maximally()
    }

    /// Wait for `minimal_oks` acknowledgements
    pub async fn complete_minimally(&mut self) -> Result<&mut Self> {
        self.complete(QuorumTier::Minimal).await
    }

    /// Wait for `optimal_oks` acknowledgements
    pub async fn complete_optimally(&mut self) -> Result<&mut Self> {
        self.complete(QuorumTier::Optimal).await
    }

    /// Wait for `max_oks` acknowledgements
    pub async fn complete_maximally(&mut self) -> Result<&mut Self> {
        self.complete(QuorumTier::Maximal).await
    }

    /// One pass over untried nodes towards `max_oks`, without retry rounds.
    /// An unmet tier is not an error here.
    pub async fn try_complete_maximally(&mut self) -> Result<&mut Self> {
        self.ensure_open()?;
        self.drive(self.result.max_oks, false).await;
        Ok(self)
    }

    /// Freeze the accounting and return it
    pub fn finish(&mut self) -> Result<OperationResult> {
        self.ensure_open()?;
        self.result.close();
        debug!(
            operation = %self.result.kind,
            key = %self.key,
            success = self.result.success_count(),
            failed = self.result.fail_count(),
            ignored = self.result.ignore_count(),
            "Operation finished"
        );
        Ok(self.result.clone())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.result.finished {
            return Err(RingStoreError::InvalidState(format!(
                "{} of {} already finished",
                self.result.kind, self.key
            )));
        }
        Ok(())
    }

    async fn complete(&mut self, tier: QuorumTier) -> Result<&mut Self> {
        self.ensure_open()?;
        let target = self.result.threshold(tier);
        self.drive(target, true).await;

        if !self.result.succeeded_minimally() {
            warn!(
                operation = %self.result.kind,
                key = %self.key,
                tier = %tier,
                success = self.result.success_count(),
                needed = self.result.minimal_oks,
                "Minimal tier unreachable"
            );
            return Err(self.result.unreachable_error());
        }
        Ok(self)
    }

    async fn drive(&mut self, target: usize, with_retries: bool) {
        loop {
            self.run_pass(target).await;

            if self.result.success_count() >= target
                || !with_retries
                || !self.config.allow_retries
                || self.retry_round >= self.config.max_retry_rounds
                || !self.result.has_awaiting_retry()
            {
                return;
            }

            self.retry_round += 1;
            debug!(
                operation = %self.result.kind,
                key = %self.key,
                round = self.retry_round,
                "Retrying failed nodes"
            );
            self.clock.sleep(self.config.retry_delay()).await;
            self.result.reset_retries();
        }
    }

    /// Keep just enough calls in flight to reach `target`, replacing each
    /// failure with the next untried node. With hedging enabled, one more
    /// node is contacted whenever no call answered for `hedge_delay`.
    async fn run_pass(&mut self, target: usize) {
        let hedge_delay = self.config.hedge_delay();
        let mut hedged = 0;
        let mut in_flight = FuturesUnordered::new();
        while self.result.success_count() < target {
            while self.result.success_count() + in_flight.len() < target + hedged {
                let Some(index) = self.result.next_untried() else {
                    break;
                };
                let record = &mut self.result.records[index];
                record.outcome = NodeOutcome::InFlight;
                record.attempts += 1;
                in_flight.push(self.dispatch(index).map(move |outcome| (index, outcome)));
            }
            if in_flight.is_empty() {
                break;
            }

            let can_hedge = !hedge_delay.is_zero() && self.result.next_untried().is_some();
            let next = if can_hedge {
                tokio::select! {
                    biased;
                    next = in_flight.next() => next,
                    _ = self.clock.sleep(hedge_delay) => {
                        hedged += 1;
                        debug!(
                            operation = %self.result.kind,
                            key = %self.key,
                            in_flight = in_flight.len(),
                            "No answer within hedge delay, contacting another node"
                        );
                        continue;
                    }
                }
            } else {
                in_flight.next().await
            };
            let Some((index, outcome)) = next else {
                break;
            };
            self.record_call(index, outcome);
        }

        // calls still running once the target is met are dropped unanswered
        for record in &mut self.result.records {
            if record.outcome == NodeOutcome::InFlight {
                record.outcome = NodeOutcome::Untried;
                record.attempts -= 1;
            }
        }
    }

    fn dispatch(&self, index: usize) -> BoxFuture<'static, CallResult<()>> {
        let transport = self.transport.clone();
        let clock = self.clock.clone();
        let node = self.result.records[index].node.clone();
        let timeout = self.config.call_timeout();
        let call = self.call.clone();

        async move {
            let request = async move {
                match call {
                    WriteCall::Put(request) => transport.put(&node, request).await.map(|_| ()),
                    WriteCall::Delete(key) => transport.delete(&node, &key).await.map(|_| ()),
                }
            };
            call_with_timeout(clock.as_ref(), timeout, request).await
        }
        .boxed()
    }

    fn record_call(&mut self, index: usize, outcome: CallResult<()>) {
        let kind = self.result.kind;
        match outcome {
            Ok(()) => {
                metrics::record_node_call(kind.as_str(), true);
                self.result.mark_success(index);
            }
            Err(e) => {
                metrics::record_node_call(kind.as_str(), false);
                let retry =
                    self.config.allow_retries && self.retry_round < self.config.max_retry_rounds;
                debug!(
                    operation = %kind,
                    key = %self.key,
                    node = %self.result.records[index].node,
                    error = %e,
                    retry,
                    "Node call failed"
                );
                self.result.mark_failure(index, e, retry);
            }
        }
    }
}

/// Outcome of a replicated GET
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Uncompressed content, if any node had a live version
    pub content: Option<Bytes>,
    pub info: Option<ItemInfo>,
    /// Node that served the content
    pub served_by: Option<NodeId>,
    pub result: OperationResult,
}

/// Outcome of a replicated HEAD
#[derive(Debug, Clone)]
pub struct InfoResult {
    /// What each answering node reported; `None` for "not found"
    pub per_node: Vec<(NodeId, Option<ItemInfo>)>,
    pub result: OperationResult,
}

impl InfoResult {
    /// Most recently written version among the answers
    pub fn newest(&self) -> Option<&ItemInfo> {
        self.per_node
            .iter()
            .filter_map(|(_, info)| info.as_ref())
            .max_by_key(|info| info.last_modified)
    }
}

/// Client-facing entry point for replicated operations
pub struct ReplicationCoordinator {
    topology: Arc<RingTopology>,
    transport: Arc<dyn PeerTransport>,
    codec: Arc<dyn KeyCodec>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

impl ReplicationCoordinator {
    pub fn new(
        topology: Arc<RingTopology>,
        transport: Arc<dyn PeerTransport>,
        codec: Arc<dyn KeyCodec>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            topology,
            transport,
            codec,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn codec(&self) -> &Arc<dyn KeyCodec> {
        &self.codec
    }

    /// Candidate nodes of `key`, primary first
    pub fn candidates(&self, key: &EntryKey) -> Vec<NodeId> {
        self.topology
            .nodes_for_key(self.codec.as_ref(), key)
            .into_iter()
            .map(|n| n.id)
            .collect()
    }

    /// Start writing `content` under `key`
    pub fn put(&self, key: EntryKey, content: Bytes) -> WriteOperation {
        self.put_with_ttl(key, content, None)
    }

    /// Start writing `content` that expires `max_ttl_secs` after it is stored
    pub fn put_with_ttl(
        &self,
        key: EntryKey,
        content: Bytes,
        max_ttl_secs: Option<u32>,
    ) -> WriteOperation {
        let request = PutRequest {
            key: key.clone(),
            content_hash: self.codec.content_hash(&content),
            content,
            max_ttl_secs,
        };
        self.write(OperationKind::Put, key, WriteCall::Put(request))
    }

    /// Start deleting `key`
    pub fn delete(&self, key: EntryKey) -> WriteOperation {
        self.write(OperationKind::Delete, key.clone(), WriteCall::Delete(key))
    }

    fn write(&self, kind: OperationKind, key: EntryKey, call: WriteCall) -> WriteOperation {
        let candidates = self.candidates(&key);
        WriteOperation::new(
            kind,
            key,
            call,
            candidates,
            self.transport.clone(),
            self.clock.clone(),
            self.config.clone(),
        )
    }

    fn read_result(&self, kind: OperationKind, key: &EntryKey) -> OperationResult {
        let candidates = self.candidates(key);
        let all = candidates.len();
        OperationResult::new(kind, candidates, 1, 1, all)
    }

    /// Read `key` from the first node that has it
    ///
    /// "Not found" answers count as successes and the search moves on.
    /// Fails only when no node answered at all.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &EntryKey) -> Result<ReadResult> {
        let mut result = self.read_result(OperationKind::Get, key);
        let timeout = self.config.call_timeout();

        for index in 0..result.candidates() {
            let node = result.records[index].node.clone();
            result.records[index].attempts += 1;
            let outcome =
                call_with_timeout(self.clock.as_ref(), timeout, self.transport.get(&node, key))
                    .await;

            let read = match outcome {
                Ok(GetResponse::Found(read)) => read,
                Ok(GetResponse::NotFound) => {
                    metrics::record_node_call(OperationKind::Get.as_str(), true);
                    result.mark_success(index);
                    continue;
                }
                Err(e) => {
                    metrics::record_node_call(OperationKind::Get.as_str(), false);
                    debug!(key = %key, node = %node, error = %e, "Read failed");
                    result.mark_failure(index, e, false);
                    continue;
                }
            };

            match self.decode_content(&read.metadata, &read.content) {
                Ok(content) => {
                    metrics::record_node_call(OperationKind::Get.as_str(), true);
                    result.mark_success(index);
                    result.close();
                    return Ok(ReadResult {
                        content: Some(content),
                        info: Some(ItemInfo::from(&read.metadata)),
                        served_by: Some(node),
                        result,
                    });
                }
                Err(e) => {
                    metrics::record_node_call(OperationKind::Get.as_str(), false);
                    warn!(key = %key, node = %node, error = %e, "Node returned corrupt content");
                    result.mark_failure(index, CallError::from(e), false);
                }
            }
        }

        result.close();
        if result.success_count() == 0 {
            return Err(result.unreachable_error());
        }
        Ok(ReadResult {
            content: None,
            info: None,
            served_by: None,
            result,
        })
    }

    fn decode_content(&self, metadata: &EntryMetadata, stored: &Bytes) -> Result<Bytes> {
        let content = decompress_content(
            metadata.compression,
            stored,
            metadata.original_length as usize,
        )?;
        let actual = self.codec.content_hash(&content);
        if actual != metadata.content_hash {
            return Err(RingStoreError::HashMismatch {
                expected: metadata.content_hash,
                actual,
            });
        }
        Ok(content)
    }

    /// Metadata of `key` from every candidate node, asked in parallel
    #[instrument(skip(self))]
    pub async fn find_info(&self, key: &EntryKey) -> Result<InfoResult> {
        let mut result = self.read_result(OperationKind::Info, key);
        let timeout = self.config.call_timeout();

        let mut in_flight: FuturesUnordered<_> = result
            .records
            .iter_mut()
            .enumerate()
            .map(|(index, record)| {
                record.attempts += 1;
                record.outcome = NodeOutcome::InFlight;
                let node = record.node.clone();
                let transport = self.transport.clone();
                let clock = self.clock.clone();
                let key = key.clone();
                async move {
                    let outcome =
                        call_with_timeout(clock.as_ref(), timeout, transport.head(&node, &key))
                            .await;
                    (index, node, outcome)
                }
            })
            .collect();

        let mut per_node = Vec::new();
        while let Some((index, node, outcome)) = in_flight.next().await {
            match outcome {
                Ok(response) => {
                    metrics::record_node_call(OperationKind::Info.as_str(), true);
                    result.mark_success(index);
                    let info = match response {
                        HeadResponse::Found(info) => Some(info),
                        HeadResponse::NotFound => None,
                    };
                    per_node.push((node, info));
                }
                Err(e) => {
                    metrics::record_node_call(OperationKind::Info.as_str(), false);
                    debug!(key = %key, node = %node, error = %e, "Head failed");
                    result.mark_failure(index, e, false);
                }
            }
        }

        result.close();
        if result.success_count() == 0 {
            return Err(result.unreachable_error());
        }
        Ok(InfoResult { per_node, result })
    }

    /// Uncompressed length of `key` from the first node that has it
    #[instrument(skip(self))]
    pub async fn get_content_length(&self, key: &EntryKey) -> Result<Option<u64>> {
        let timeout = self.config.call_timeout();
        let mut answered = false;
        for node in self.candidates(key) {
            let outcome =
                call_with_timeout(self.clock.as_ref(), timeout, self.transport.head(&node, key))
                    .await;
            match outcome {
                Ok(HeadResponse::Found(info)) => return Ok(Some(info.original_length)),
                Ok(HeadResponse::NotFound) => answered = true,
                Err(e) => debug!(key = %key, node = %node, error = %e, "Head failed"),
            }
        }
        if answered {
            Ok(None)
        } else {
            Err(RingStoreError::ThresholdUnreachable {
                tier: QuorumTier::Minimal,
                needed: 1,
                achieved: 0,
            })
        }
    }
}
