//! The pipeline graph: an arena of stages and their producer/consumer edges.
//!
//! Starting a producing stage is a barrier: its consumers are started
//! concurrently and the producer is only marked running, and its post-start
//! hook only runs, once every consumer has completed. A consumer completes
//! by notifying its producer at the end of its own start, so running state
//! propagates from the leaves back up while initialization fans out down.
//!
//! Stopping is the mirror without a barrier: the stage's input is detached
//! and drained, its stop hooks run, and only then is its producer told.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use knive_core::events::{EventBus, PipelineEvent};
use knive_core::{Backoff, Error, LifecycleError, ProcessFault, Result, WiringError};

use crate::barrier::{BarrierState, StartBarrier};
use crate::context::{Ancestor, FaultMessage, FaultReporter, StageContext};
use crate::fanout::{Fanout, INPUT_QUEUE_DEPTH};
use crate::stage::{FaultAction, Stage, StageKind};

/// Upper bound for producer-chain walks.
pub const MAX_LINEAGE_DEPTH: usize = 32;

/// Number of wiring records kept for diagnostics.
const WIRING_HISTORY: usize = 256;

/// Shared, lockable stage object.
pub type StageHandle = Arc<tokio::sync::Mutex<Box<dyn Stage>>>;

/// How the graph brings back a stage whose `on_fault` asks for a restart.
///
/// Consecutive restarts are spaced by `backoff`. After `max_attempts` of them
/// the stage is left stopped. A run that lasted `stable_after` or longer
/// resets the count.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub stable_after: Duration,
}

impl RestartPolicy {
    /// Delay before restart number `attempt`, counting from 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut backoff = self.backoff.clone();
        let mut delay = backoff.next_delay();
        for _ in 1..attempt {
            delay = backoff.next_delay();
        }
        delay
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(30), 2),
            stable_after: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Identifiers and snapshots
// ---------------------------------------------------------------------------

/// Index of a stage in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StageId(usize);

impl StageId {
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Read-only view of one node.
#[derive(Debug, Clone, Serialize)]
pub struct StageInfo {
    pub id: StageId,
    pub name: String,
    pub role: &'static str,
    pub kind: StageKind,
    pub status: StageStatus,
    pub producer: Option<StageId>,
    pub consumers: Vec<StageId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WiringChange {
    Linked,
    Unlinked,
}

/// One edge mutation, numbered in the order it happened.
#[derive(Debug, Clone, Serialize)]
pub struct WiringRecord {
    pub seq: u64,
    pub change: WiringChange,
    pub producer: StageId,
    pub consumer: StageId,
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

struct Node {
    name: String,
    role: &'static str,
    kind: StageKind,
    stage: StageHandle,
    status: StageStatus,
    producer: Option<StageId>,
    consumers: Vec<StageId>,
    output: Arc<Fanout>,
    pump: Option<JoinHandle<()>>,
    barrier: Option<StartBarrier>,
    span: tracing::Span,
    /// Start generation, bumped on every start attempt.
    run: u64,
    /// Set for the whole start protocol, including the post-start hook.
    starting: bool,
    /// A fault reported while `starting`, handled once the start settles.
    pending_fault: Option<ProcessFault>,
    started_at: Option<Instant>,
    restarts: u32,
}

impl Node {
    fn info(&self, id: StageId) -> StageInfo {
        StageInfo {
            id,
            name: self.name.clone(),
            role: self.role,
            kind: self.kind,
            status: self.status,
            producer: self.producer,
            consumers: self.consumers.clone(),
        }
    }
}

#[derive(Default)]
struct GraphState {
    nodes: Vec<Node>,
    wiring_seq: u64,
    history: VecDeque<WiringRecord>,
}

impl GraphState {
    fn node(&self, id: StageId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| Error::not_found("stage", id))
    }

    fn node_mut(&mut self, id: StageId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| Error::not_found("stage", id))
    }

    /// Producer chain of `id`, nearest first.
    fn ancestors(&self, id: StageId) -> Vec<StageId> {
        let mut out = Vec::new();
        let mut cursor = self.nodes.get(id.0).and_then(|n| n.producer);
        while let Some(p) = cursor {
            if out.len() >= MAX_LINEAGE_DEPTH || out.contains(&p) {
                break;
            }
            out.push(p);
            cursor = self.nodes.get(p.0).and_then(|n| n.producer);
        }
        out
    }

    fn record(&mut self, change: WiringChange, producer: StageId, consumer: StageId) {
        self.wiring_seq += 1;
        let record = WiringRecord {
            seq: self.wiring_seq,
            change,
            producer,
            consumer,
        };
        tracing::debug!(
            seq = record.seq,
            "Wiring {:?}: '{}' -> '{}'",
            change,
            self.nodes[producer.0].name,
            self.nodes[consumer.0].name
        );
        if self.history.len() >= WIRING_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    fn unlink(&mut self, producer: StageId, consumer: StageId) {
        self.nodes[producer.0].consumers.retain(|c| *c != consumer);
        self.nodes[consumer.0].producer = None;
        self.record(WiringChange::Unlinked, producer, consumer);
    }
}

// ---------------------------------------------------------------------------
// PipelineGraph
// ---------------------------------------------------------------------------

/// Owns the stages of one channel and drives their lifecycle.
pub struct PipelineGraph {
    state: Mutex<GraphState>,
    faults_tx: mpsc::UnboundedSender<FaultMessage>,
    faults_rx: Mutex<Option<mpsc::UnboundedReceiver<FaultMessage>>>,
    events: Option<Arc<EventBus>>,
    restart: Mutex<RestartPolicy>,
    this: Weak<PipelineGraph>,
}

impl PipelineGraph {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Create a graph that publishes lifecycle events on `events`.
    pub fn with_events(events: Arc<EventBus>) -> Arc<Self> {
        Self::build(Some(events))
    }

    fn build(events: Option<Arc<EventBus>>) -> Arc<Self> {
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(GraphState::default()),
            faults_tx,
            faults_rx: Mutex::new(Some(faults_rx)),
            events,
            restart: Mutex::new(RestartPolicy::default()),
            this: this.clone(),
        })
    }

    pub fn set_restart_policy(&self, policy: RestartPolicy) {
        *self.restart.lock() = policy;
    }

    /// Add an idle, unwired stage.
    pub fn add_stage<S: Stage>(&self, stage: S) -> StageId {
        self.add_boxed(Box::new(stage))
    }

    pub fn add_boxed(&self, stage: Box<dyn Stage>) -> StageId {
        let name = stage.name().to_string();
        let role = stage.role();
        let kind = stage.kind();
        let mut state = self.state.lock();
        let id = StageId(state.nodes.len());
        let span = tracing::info_span!("stage", name = %name);
        state.nodes.push(Node {
            name,
            role,
            kind,
            stage: Arc::new(tokio::sync::Mutex::new(stage)),
            status: StageStatus::Idle,
            producer: None,
            consumers: Vec::new(),
            output: Arc::new(Fanout::new()),
            pump: None,
            barrier: None,
            span,
            run: 0,
            starting: false,
            pending_fault: None,
            started_at: None,
            restarts: 0,
        });
        id
    }

    // -- Wiring --------------------------------------------------------------

    /// Link `consumer` as a consumer of `producer`.
    ///
    /// Adding an existing edge is a no-op. A consumer that already has a
    /// different producer is moved, which requires it to be idle.
    pub fn add_consumer(&self, producer: StageId, consumer: StageId) -> Result<()> {
        let mut state = self.state.lock();
        let (p_name, p_kind, already_linked) = {
            let p = state.node(producer)?;
            (p.name.clone(), p.kind, p.consumers.contains(&consumer))
        };
        let (c_name, c_kind, c_status, previous) = {
            let c = state.node(consumer)?;
            (c.name.clone(), c.kind, c.status, c.producer)
        };

        if producer == consumer {
            return Err(WiringError::SelfReference { stage: p_name }.into());
        }
        if !c_kind.consumes() {
            return Err(WiringError::NotAConsumer { stage: c_name }.into());
        }
        if !p_kind.produces() {
            return Err(WiringError::NotAProducer { stage: p_name }.into());
        }
        if already_linked {
            tracing::debug!("'{}' is already a consumer of '{}'", c_name, p_name);
            return Ok(());
        }
        if c_status != StageStatus::Idle {
            return Err(WiringError::AlreadyRunning { stage: c_name }.into());
        }
        if state.ancestors(producer).contains(&consumer) {
            return Err(WiringError::Cycle {
                producer: p_name,
                consumer: c_name,
            }
            .into());
        }

        if let Some(previous) = previous {
            state.unlink(previous, consumer);
        }
        state.nodes[producer.0].consumers.push(consumer);
        state.nodes[consumer.0].producer = Some(producer);
        state.record(WiringChange::Linked, producer, consumer);
        Ok(())
    }

    /// Attach `consumer` to `producer`, or detach it when `producer` is
    /// `None`. Only allowed while `consumer` is idle.
    pub fn set_producer(&self, consumer: StageId, producer: Option<StageId>) -> Result<()> {
        {
            let mut state = self.state.lock();
            let (name, status, previous) = {
                let c = state.node(consumer)?;
                (c.name.clone(), c.status, c.producer)
            };
            if status != StageStatus::Idle {
                return Err(WiringError::AlreadyRunning { stage: name }.into());
            }
            if producer.is_none() {
                if let Some(previous) = previous {
                    state.unlink(previous, consumer);
                }
                return Ok(());
            }
        }
        match producer {
            Some(p) => self.add_consumer(p, consumer),
            None => Ok(()),
        }
    }

    /// Unlink `consumer` from `producer`. The consumer must be stopped.
    pub fn remove_consumer(&self, producer: StageId, consumer: StageId) -> Result<()> {
        let mut state = self.state.lock();
        let (p_name, linked) = {
            let p = state.node(producer)?;
            (p.name.clone(), p.consumers.contains(&consumer))
        };
        let (c_name, c_status) = {
            let c = state.node(consumer)?;
            (c.name.clone(), c.status)
        };
        if !linked {
            tracing::debug!("'{}' is not a consumer of '{}'", c_name, p_name);
            return Ok(());
        }
        if c_status != StageStatus::Idle {
            return Err(WiringError::ConsumerStillRunning { consumer: c_name }.into());
        }
        state.unlink(producer, consumer);
        Ok(())
    }

    // -- Start ---------------------------------------------------------------

    /// Run the start protocol on `id`.
    ///
    /// Starting a running stage logs a warning and does nothing.
    pub async fn start(&self, id: StageId) -> Result<()> {
        self.ensure_supervisor();
        self.start_boxed(id).await
    }

    fn start_boxed(&self, id: StageId) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.start_inner(id))
    }

    async fn start_inner(&self, id: StageId) -> Result<()> {
        let (handle, kind, consumers, span) = {
            let mut state = self.state.lock();
            let node = state.node_mut(id)?;
            match node.status {
                StageStatus::Running => {
                    tracing::warn!("Stage '{}' is already running; start ignored", node.name);
                    return Ok(());
                }
                StageStatus::Starting => {
                    return Err(LifecycleError::StartInProgress {
                        stage: node.name.clone(),
                    }
                    .into());
                }
                StageStatus::Stopping => {
                    return Err(LifecycleError::StopInProgress {
                        stage: node.name.clone(),
                    }
                    .into());
                }
                StageStatus::Idle => {}
            }
            if node.kind.produces() && node.consumers.is_empty() {
                return Err(LifecycleError::NoConsumers {
                    stage: node.name.clone(),
                }
                .into());
            }
            if node.kind.consumes() && node.producer.is_none() {
                return Err(LifecycleError::NoProducer {
                    stage: node.name.clone(),
                }
                .into());
            }
            node.status = StageStatus::Starting;
            node.starting = true;
            node.pending_fault = None;
            node.run += 1;
            (
                node.stage.clone(),
                node.kind,
                node.consumers.clone(),
                node.span.clone(),
            )
        };

        let result = self
            .run_start(id, handle, kind, consumers)
            .instrument(span)
            .await;

        let (run, pending) = {
            let mut state = self.state.lock();
            let node = state.node_mut(id)?;
            node.starting = false;
            if result.is_ok() {
                node.started_at = Some(Instant::now());
            } else {
                node.status = StageStatus::Idle;
            }
            (node.run, node.pending_fault.take())
        };

        match result {
            Ok(()) => {
                self.publish(|name| PipelineEvent::StageStarted { stage: name }, id);
                if let Some(fault) = pending {
                    // Hand the fault back to the supervisor now that the
                    // stage is running.
                    let _ = self.faults_tx.send((id, run, fault));
                }
                Ok(())
            }
            Err(e) => {
                if let Some(fault) = pending {
                    tracing::debug!("Dropping fault of stage {} after failed start: {}", id, fault);
                }
                let error = e.to_string();
                self.publish(|name| PipelineEvent::StageFailed { stage: name, error }, id);
                Err(e)
            }
        }
    }

    async fn run_start(
        &self,
        id: StageId,
        handle: StageHandle,
        kind: StageKind,
        consumers: Vec<StageId>,
    ) -> Result<()> {
        let ctx = self.context(id)?;

        // Phase 1: pre-start.
        handle.lock().await.will_start(&ctx).await?;

        // Phases 2 and 3. Whatever the pre-start hook set up is torn down
        // again when they fail.
        if let Err(e) = self.finish_start(id, &handle, kind, &consumers, &ctx).await {
            self.set_status(id, StageStatus::Stopping);
            let mut stage = handle.lock().await;
            if let Err(stop) = stage.will_stop(&ctx).await {
                tracing::warn!("Pre-stop hook of '{}' failed during rollback: {}", ctx.name(), stop);
            }
            if let Err(stop) = stage.did_stop(&ctx).await {
                tracing::warn!("Post-stop hook of '{}' failed during rollback: {}", ctx.name(), stop);
            }
            tracing::warn!("Stage '{}' failed to start: {}", ctx.name(), e);
            return Err(e);
        }

        self.notify_started(id).await;
        Ok(())
    }

    async fn finish_start(
        &self,
        id: StageId,
        handle: &StageHandle,
        kind: StageKind,
        consumers: &[StageId],
        ctx: &StageContext,
    ) -> Result<()> {
        // Phase 2: fan-out start behind a barrier.
        if kind.produces() {
            self.start_consumers(id, consumers).await?;
        }

        // Phase 3: running, post-start, attach input.
        self.set_status(id, StageStatus::Running);
        handle.lock().await.did_start(ctx).await?;
        tracing::info!("Stage '{}' started", ctx.name());

        if kind.consumes() {
            self.attach_input(id, handle.clone(), ctx.clone())?;
        }
        Ok(())
    }

    async fn start_consumers(&self, id: StageId, consumers: &[StageId]) -> Result<()> {
        let barrier = StartBarrier::new(consumers.len());
        let mut pending = Vec::new();
        {
            let mut state = self.state.lock();
            for &c in consumers {
                if state.node(c)?.status == StageStatus::Running {
                    barrier.complete(c);
                } else {
                    pending.push(c);
                }
            }
            state.node_mut(id)?.barrier = Some(barrier.clone());
        }

        let results = join_all(
            pending
                .iter()
                .map(|&c| async move { (c, self.start_boxed(c).await) }),
        )
        .await;

        for (c, result) in results {
            match result {
                Ok(()) => {
                    barrier.complete(c);
                }
                Err(e) => barrier.fail(c, e),
            }
        }

        let outcome = barrier.wait().await;

        let mut state = self.state.lock();
        state.node_mut(id)?.barrier = None;
        match outcome {
            Ok(completed) => {
                tracing::debug!(
                    "'{}': {} of {} consumers started",
                    state.nodes[id.0].name,
                    completed.len(),
                    consumers.len()
                );
                Ok(())
            }
            Err(failure) => Err(LifecycleError::StartFailed {
                stage: state.nodes[id.0].name.clone(),
                consumer: state.nodes[failure.consumer.0].name.clone(),
                message: failure.error.to_string(),
            }
            .into()),
        }
    }

    fn attach_input(&self, id: StageId, handle: StageHandle, ctx: StageContext) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Bytes>(INPUT_QUEUE_DEPTH);
        let mut state = self.state.lock();
        let (producer, span) = {
            let node = state.node(id)?;
            (node.producer, node.span.clone())
        };
        let Some(producer) = producer else {
            return Err(LifecycleError::NoProducer { stage: ctx.name().to_string() }.into());
        };
        state.node(producer)?.output.attach(id, tx);
        let pump = tokio::spawn(pump(handle, ctx, rx).instrument(span));
        state.node_mut(id)?.pump = Some(pump);
        Ok(())
    }

    async fn notify_started(&self, id: StageId) {
        let upstream = {
            let state = self.state.lock();
            state.nodes.get(id.0).and_then(|n| n.producer).map(|p| {
                let node = &state.nodes[p.0];
                if let Some(ref barrier) = node.barrier {
                    barrier.complete(id);
                }
                (p, node.stage.clone())
            })
        };
        let Some((producer, handle)) = upstream else {
            return;
        };
        if let Ok(pctx) = self.context(producer) {
            handle.lock().await.consumer_started(id, &pctx).await;
        }
    }

    // -- Stop ----------------------------------------------------------------

    /// Run the stop protocol on `id`. Consumers are not stopped.
    ///
    /// Stopping a stage that is not running logs a warning and does nothing.
    pub async fn stop(&self, id: StageId) -> Result<()> {
        let (handle, pump, producer, span) = {
            let mut state = self.state.lock();
            let node = state.node_mut(id)?;
            match node.status {
                StageStatus::Running if node.starting => {
                    return Err(LifecycleError::StartInProgress {
                        stage: node.name.clone(),
                    }
                    .into());
                }
                StageStatus::Running => {}
                StageStatus::Idle | StageStatus::Stopping => {
                    tracing::warn!("Stage '{}' is not running; stop ignored", node.name);
                    return Ok(());
                }
                StageStatus::Starting => {
                    return Err(LifecycleError::StartInProgress {
                        stage: node.name.clone(),
                    }
                    .into());
                }
            }
            node.status = StageStatus::Stopping;
            let pump = node.pump.take();
            let producer = node.producer;
            let handle = node.stage.clone();
            let span = node.span.clone();
            if let Some(p) = producer {
                state.nodes[p.0].output.detach(id);
            }
            (handle, pump, producer, span)
        };

        async {
            if let Some(pump) = pump {
                if let Err(e) = pump.await {
                    tracing::warn!("Input task ended abnormally: {}", e);
                }
            }

            let ctx = self.context(id)?;
            {
                let mut stage = handle.lock().await;
                if let Err(e) = stage.will_stop(&ctx).await {
                    tracing::warn!("Pre-stop hook of '{}' failed: {}", ctx.name(), e);
                }
                if let Err(e) = stage.did_stop(&ctx).await {
                    tracing::warn!("Post-stop hook of '{}' failed: {}", ctx.name(), e);
                }
            }
            self.set_status(id, StageStatus::Idle);
            tracing::info!("Stage '{}' stopped", ctx.name());

            if let Some(p) = producer {
                let upstream = self.state.lock().nodes.get(p.0).map(|n| n.stage.clone());
                if let (Some(upstream), Ok(pctx)) = (upstream, self.context(p)) {
                    upstream.lock().await.consumer_stopped(id, &pctx).await;
                }
            }
            Ok::<(), Error>(())
        }
        .instrument(span)
        .await?;

        self.publish(|name| PipelineEvent::StageStopped { stage: name }, id);
        Ok(())
    }

    /// Stop `root` and then every stage below it, upstream first.
    pub async fn stop_tree(&self, root: StageId) -> Result<()> {
        let mut order = vec![root];
        order.extend(self.descendants(root));
        for id in order {
            if self.is_running(id) {
                self.stop(id).await?;
            }
        }
        Ok(())
    }

    // -- Faults --------------------------------------------------------------

    fn ensure_supervisor(&self) {
        let Some(mut rx) = self.faults_rx.lock().take() else {
            return;
        };
        let weak = self.this.clone();
        tokio::spawn(async move {
            while let Some((id, run, fault)) = rx.recv().await {
                let Some(graph) = weak.upgrade() else {
                    break;
                };
                graph.handle_fault(id, run, fault).await;
            }
        });
    }

    async fn handle_fault(&self, id: StageId, run: u64, fault: ProcessFault) {
        let (name, handle, started_at) = {
            let mut state = self.state.lock();
            let Some(node) = state.nodes.get_mut(id.0) else {
                return;
            };
            if node.run != run {
                tracing::debug!("Ignoring fault of an earlier run of '{}': {}", node.name, fault);
                return;
            }
            if node.starting {
                tracing::debug!("Fault of '{}' while starting, deferred: {}", node.name, fault);
                node.pending_fault = Some(fault);
                return;
            }
            if node.status != StageStatus::Running {
                tracing::debug!("Ignoring fault of '{}' while {:?}: {}", node.name, node.status, fault);
                return;
            }
            (node.name.clone(), node.stage.clone(), node.started_at)
        };

        tracing::error!(
            command = %fault.command_line,
            exit_code = ?fault.exit_code,
            last_message = ?fault.last_line,
            "Stage '{}' crashed",
            name
        );
        self.publish(
            |stage| PipelineEvent::StageCrashed {
                stage,
                fault: fault.clone(),
            },
            id,
        );

        let action = handle.lock().await.on_fault(&fault);
        if let Err(e) = self.stop(id).await {
            tracing::error!("Failed to stop crashed stage '{}': {}", name, e);
            return;
        }
        if action == FaultAction::Restart {
            self.schedule_restart(id, run, &name, started_at);
        }
    }

    fn schedule_restart(&self, id: StageId, run: u64, name: &str, started_at: Option<Instant>) {
        let policy = self.restart.lock().clone();
        let attempt = {
            let mut state = self.state.lock();
            let Some(node) = state.nodes.get_mut(id.0) else {
                return;
            };
            if started_at.is_some_and(|t| t.elapsed() >= policy.stable_after) {
                node.restarts = 0;
            }
            node.restarts += 1;
            node.restarts
        };
        if attempt > policy.max_attempts {
            tracing::error!(
                "Stage '{}' crashed {} times in a row; leaving it stopped",
                name,
                policy.max_attempts
            );
            let error = format!("gave up after {} restarts", policy.max_attempts);
            self.publish(|stage| PipelineEvent::StageFailed { stage, error }, id);
            return;
        }
        let Some(graph) = self.this.upgrade() else {
            return;
        };

        let delay = policy.delay(attempt);
        tracing::info!(
            "Restarting stage '{}' in {:?} (attempt {}/{})",
            name,
            delay,
            attempt,
            policy.max_attempts
        );
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !graph.restart_due(id, run) {
                tracing::debug!("Restart of '{}' skipped; it was started or its producer stopped", name);
                return;
            }
            match graph.start_boxed(id).await {
                Ok(()) => graph.publish(|stage| PipelineEvent::StageRestarted { stage }, id),
                Err(e) => tracing::error!("Restart of '{}' failed: {}", name, e),
            }
        });
    }

    /// Whether a restart scheduled after run `run` of `id` should still
    /// happen: nobody started the stage since, and its producer still runs.
    fn restart_due(&self, id: StageId, run: u64) -> bool {
        let state = self.state.lock();
        let Some(node) = state.nodes.get(id.0) else {
            return false;
        };
        let producer_running = node
            .producer
            .and_then(|p| state.nodes.get(p.0))
            .map_or(true, |p| p.status == StageStatus::Running);
        node.status == StageStatus::Idle && node.run == run && producer_running
    }

    // -- Queries -------------------------------------------------------------

    pub fn status(&self, id: StageId) -> Option<StageStatus> {
        self.state.lock().nodes.get(id.0).map(|n| n.status)
    }

    pub fn is_running(&self, id: StageId) -> bool {
        self.status(id) == Some(StageStatus::Running)
    }

    pub fn name(&self, id: StageId) -> Option<String> {
        self.state.lock().nodes.get(id.0).map(|n| n.name.clone())
    }

    pub fn producer(&self, id: StageId) -> Option<StageId> {
        self.state.lock().nodes.get(id.0).and_then(|n| n.producer)
    }

    pub fn consumers(&self, id: StageId) -> Vec<StageId> {
        self.state
            .lock()
            .nodes
            .get(id.0)
            .map(|n| n.consumers.clone())
            .unwrap_or_default()
    }

    /// Lockable stage object, for operations outside the lifecycle such as
    /// recording.
    pub fn stage(&self, id: StageId) -> Option<StageHandle> {
        self.state.lock().nodes.get(id.0).map(|n| n.stage.clone())
    }

    /// All (producer, consumer) pairs, producers in arena order and
    /// consumers in link order.
    pub fn edges(&self) -> Vec<(StageId, StageId)> {
        let state = self.state.lock();
        let edges = state
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(i, n)| n.consumers.iter().map(move |c| (StageId(i), *c)))
            .collect();
        edges
    }

    /// Producer chain of `id`, nearest first, at most
    /// [`MAX_LINEAGE_DEPTH`] long.
    pub fn ancestors(&self, id: StageId) -> Vec<StageId> {
        self.state.lock().ancestors(id)
    }

    /// Nearest ancestor whose role is `role`.
    pub fn find_ancestor(&self, id: StageId, role: &str) -> Option<StageId> {
        let state = self.state.lock();
        let found = state
            .ancestors(id)
            .into_iter()
            .find(|a| state.nodes[a.0].role == role);
        found
    }

    /// Every stage below `root`, breadth first.
    pub fn descendants(&self, root: StageId) -> Vec<StageId> {
        let state = self.state.lock();
        let mut seen = HashSet::from([root]);
        let mut queue: VecDeque<StageId> = VecDeque::from([root]);
        let mut out = Vec::new();
        while let Some(id) = queue.pop_front() {
            let Some(node) = state.nodes.get(id.0) else {
                continue;
            };
            for &c in &node.consumers {
                if seen.insert(c) {
                    out.push(c);
                    queue.push_back(c);
                }
            }
        }
        out
    }

    /// Barrier state of a stage that is waiting for its consumers.
    pub fn barrier(&self, id: StageId) -> Option<BarrierState> {
        self.state
            .lock()
            .nodes
            .get(id.0)
            .and_then(|n| n.barrier.as_ref().map(StartBarrier::snapshot))
    }

    pub fn wiring_history(&self) -> Vec<WiringRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    pub fn info(&self, id: StageId) -> Option<StageInfo> {
        self.state.lock().nodes.get(id.0).map(|n| n.info(id))
    }

    pub fn snapshot(&self) -> Vec<StageInfo> {
        let state = self.state.lock();
        let infos = state
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| n.info(StageId(i)))
            .collect();
        infos
    }

    // -- Internals -----------------------------------------------------------

    fn context(&self, id: StageId) -> Result<StageContext> {
        let state = self.state.lock();
        let node = state.node(id)?;
        let lineage = state
            .ancestors(id)
            .into_iter()
            .map(|a| Ancestor {
                id: a,
                name: state.nodes[a.0].name.clone(),
                role: state.nodes[a.0].role,
            })
            .collect();
        Ok(StageContext::new(
            id,
            node.name.clone(),
            lineage,
            node.output.clone(),
            FaultReporter::new(id, node.run, self.faults_tx.clone()),
        ))
    }

    fn set_status(&self, id: StageId, status: StageStatus) {
        if let Some(node) = self.state.lock().nodes.get_mut(id.0) {
            node.status = status;
        }
    }

    fn publish(&self, event: impl FnOnce(String) -> PipelineEvent, id: StageId) {
        let Some(ref bus) = self.events else {
            return;
        };
        if let Some(name) = self.name(id) {
            bus.publish(event(name));
        }
    }
}

impl fmt::Debug for PipelineGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineGraph")
            .field("stages", &self.state.lock().nodes.len())
            .finish()
    }
}

/// Deliver queued chunks to a running consumer, one at a time.
async fn pump(stage: StageHandle, ctx: StageContext, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = rx.recv().await {
        let len = data.len();
        let mut stage = stage.lock().await;
        if let Err(e) = stage.receive(data, &ctx).await {
            tracing::warn!("Stage '{}' dropped {} bytes: {}", ctx.name(), len, e);
        }
    }
}
