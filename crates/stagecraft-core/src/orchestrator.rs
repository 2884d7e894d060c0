//! Phase orchestrator
//!
//! Walks an [`ExecutionPlan`] for one input at a time:
//!
//! - **single**: the first registered plugin of each stage runs, and its
//!   output becomes the next stage's input
//! - **canary**: like single, restricted to a plugin subset; a stage with no
//!   eligible plugin passes its input through and is reported as skipped
//! - **multi**: every signal becomes a task running the plugins of the
//!   signal's stage; tasks interleave on the caller's task, no threads
//!
//! Each run leases the registry and the ledger inside an
//! [`ExecutionScope`](crate::scope::ExecutionScope),
//! so both are handed back on every exit, including a dropped run future.

use crate::collaborators::{Clock, Publisher, RunOutcome, RunRecord, Store, SystemClock};
use crate::config::EngineConfig;
use crate::error::{BuildError, OrchestratorError, RunError};
use crate::event::{EventEnvelope, EventKind, EventLog, LifecycleEvent};
use crate::run::{RunContext, RunMode, RunState, RunStateMachine};
use crate::scope::with_scope;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stagecraft_kernel::{
    Edge, ExecutionPlan, Payload, Plugin, PluginId, Registry, RunId, Stage, StageContext,
    TenantId, TopologyBuilder,
};
use stagecraft_telemetry::TelemetryLedger;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// One unit of multi-mode input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Stage whose plugins handle this signal
    pub kind: Stage,
    /// Input handed to the first plugin
    pub payload: Payload,
}

impl Signal {
    /// Create signal
    #[inline]
    #[must_use]
    pub fn new(kind: Stage, payload: Payload) -> Self {
        Self { kind, payload }
    }
}

/// Run input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunInput {
    /// Single and canary input
    Payload(Payload),
    /// Multi input
    Signals(Vec<Signal>),
}

/// Everything needed to start a run
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Tenant the run belongs to
    pub tenant: TenantId,
    /// Input
    pub input: RunInput,
    /// Execution mode
    pub mode: RunMode,
    /// Checked before each stage starts
    pub cancel: CancellationToken,
}

impl RunRequest {
    /// Single-mode request
    #[must_use]
    pub fn single(tenant: TenantId, payload: Payload) -> Self {
        Self::new(tenant, RunInput::Payload(payload), RunMode::Single)
    }

    /// Multi-mode request
    #[must_use]
    pub fn multi(tenant: TenantId, signals: Vec<Signal>) -> Self {
        Self::new(tenant, RunInput::Signals(signals), RunMode::Multi)
    }

    /// Canary request over `plugins`
    #[must_use]
    pub fn canary(
        tenant: TenantId,
        payload: Payload,
        plugins: impl IntoIterator<Item = PluginId>,
    ) -> Self {
        Self::new(tenant, RunInput::Payload(payload), RunMode::canary(plugins))
    }

    /// Request with an explicit input and mode
    #[must_use]
    pub fn new(tenant: TenantId, input: RunInput, mode: RunMode) -> Self {
        Self {
            tenant,
            input,
            mode,
            cancel: CancellationToken::new(),
        }
    }

    /// With a caller-owned cancellation token
    #[inline]
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Output of one completed plugin, streamed while the run is in progress
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutput {
    /// Run
    pub run_id: RunId,
    /// Stage that produced it
    pub stage: Stage,
    /// Plugin that produced it
    pub plugin_id: PluginId,
    /// Output payload
    pub payload: Payload,
    /// Index of the originating signal in multi mode
    pub signal: Option<usize>,
}

/// Result of one multi-mode signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalOutput {
    /// Position of the signal in the request
    pub index: usize,
    /// Signal stage
    pub kind: Stage,
    /// Output of the last plugin, or the input if none ran
    pub payload: Payload,
    /// Plugins that ran, in order
    pub plugins: Vec<PluginId>,
}

/// Run result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutput {
    /// Final payload of a single or canary run
    Payload(Payload),
    /// Per-signal outputs of a multi run, in completion order
    Signals(Vec<SignalOutput>),
}

/// Run summary numbers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Distinct stages that ran or were skipped
    pub stage_count: usize,
    /// Plugin invocations that finished
    pub plugins_run: usize,
    /// Skipped stage events
    pub skipped: usize,
    /// Wall time in milliseconds
    pub elapsed_ms: u64,
}

impl RunDiagnostics {
    /// Derive counts from a run's event list
    #[must_use]
    pub fn from_events(events: &[LifecycleEvent], elapsed_ms: u64) -> Self {
        let stages: BTreeSet<&Stage> = events.iter().filter_map(|e| e.stage.as_ref()).collect();
        Self {
            stage_count: stages.len(),
            plugins_run: events
                .iter()
                .filter(|e| matches!(e.kind, EventKind::Completed | EventKind::Failed))
                .count(),
            skipped: events
                .iter()
                .filter(|e| e.kind == EventKind::Skipped)
                .count(),
            elapsed_ms,
        }
    }
}

/// Successful run
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorOutput {
    /// Run identity
    pub context: RunContext,
    /// Result
    pub output: RunOutput,
    /// All lifecycle events, run marker first
    pub events: Vec<LifecycleEvent>,
    /// Summary numbers
    pub diagnostics: RunDiagnostics,
}

impl OrchestratorOutput {
    /// Run id
    #[inline]
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.context.run_id
    }

    /// Final payload of a single or canary run
    #[must_use]
    pub fn payload(&self) -> Option<&Payload> {
        match &self.output {
            RunOutput::Payload(p) => Some(p),
            RunOutput::Signals(_) => None,
        }
    }

    /// Signal outputs of a multi run, empty otherwise
    #[must_use]
    pub fn signals(&self) -> &[SignalOutput] {
        match &self.output {
            RunOutput::Signals(s) => s,
            RunOutput::Payload(_) => &[],
        }
    }

    /// Events without the run marker
    pub fn stage_events(&self) -> impl Iterator<Item = &LifecycleEvent> {
        self.events.iter().filter(|e| !e.is_run_marker())
    }
}

/// Emits events into the run's log, the ledger and the publisher
struct RunTrace<'a> {
    ctx: &'a RunContext,
    log: EventLog,
    clock: &'a dyn Clock,
    ledger: &'a TelemetryLedger,
    publisher: Option<&'a dyn Publisher>,
}

impl RunTrace<'_> {
    fn emit(
        &self,
        kind: EventKind,
        stage: Option<&Stage>,
        plugin_id: Option<&PluginId>,
        detail: Option<String>,
    ) {
        let event = self
            .log
            .append(kind, stage.cloned(), plugin_id.cloned(), self.clock.now(), detail);

        if let Some(stage) = &event.stage {
            tracing::debug!(stage = %stage, plugin = ?event.plugin_id, kind = %kind, "stage event");
            let route = format!("{}/{}", self.ctx.mode.label(), kind);
            if let Err(e) = self
                .ledger
                .record_at(&self.ctx.tenant_id, stage, &route, event.at)
            {
                tracing::warn!(error = %e, stage = %stage, "telemetry not recorded");
            }
        }

        if let Some(publisher) = self.publisher {
            let envelope = EventEnvelope {
                run_id: self.ctx.run_id,
                tenant: self.ctx.tenant_id.clone(),
                event,
            };
            if let Err(e) = publisher.publish(&envelope) {
                tracing::warn!(error = %e, seq = envelope.event.seq, "event publication failed");
            }
        }
    }

    fn stage_context(&self, stage: &Stage) -> StageContext {
        StageContext {
            run_id: self.ctx.run_id,
            tenant: self.ctx.tenant_id.clone(),
            stage: stage.clone(),
        }
    }
}

/// How one multi-mode signal ended
enum SignalEnd {
    Done(SignalOutput),
    /// Stopped before its next plugin because another signal failed
    Halted,
    Failed(RunError),
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    registry: Arc<Registry>,
    ledger: Arc<TelemetryLedger>,
    edges: Vec<Edge>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    publisher: Option<Arc<dyn Publisher>>,
    store: Option<Arc<dyn Store>>,
}

impl OrchestratorBuilder {
    /// Add an explicit stage edge
    #[must_use]
    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Add explicit stage edges
    #[must_use]
    pub fn edges(mut self, edges: impl IntoIterator<Item = Edge>) -> Self {
        self.edges.extend(edges);
        self
    }

    /// With configuration
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// With clock
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// With event publisher
    #[must_use]
    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// With run store
    #[must_use]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate config and compute the execution plan
    ///
    /// # Errors
    /// Returns [`BuildError`] for an invalid config or topology.
    pub fn build(self) -> Result<Orchestrator, BuildError> {
        self.config.validate()?;
        let plan = TopologyBuilder::new(&self.registry)
            .edges(self.edges)
            .with_options(self.config.topology_options())
            .build()?;

        tracing::info!(
            plugins = self.registry.len(),
            stages = plan.len(),
            has_cycle = plan.diagnostics.has_cycle,
            forks = plan.diagnostics.fork_count,
            "orchestrator ready"
        );

        Ok(Orchestrator {
            registry: self.registry,
            ledger: self.ledger,
            plan,
            config: self.config,
            clock: self.clock,
            publisher: self.publisher,
            store: self.store,
            latest: Mutex::new(None),
        })
    }
}

/// Runs inputs through a fixed plan
pub struct Orchestrator {
    registry: Arc<Registry>,
    ledger: Arc<TelemetryLedger>,
    plan: ExecutionPlan,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    publisher: Option<Arc<dyn Publisher>>,
    store: Option<Arc<dyn Store>>,
    /// Most recently started run and its state
    latest: Mutex<Option<(RunId, RunState)>>,
}

impl Orchestrator {
    /// Start building an orchestrator
    #[must_use]
    pub fn builder(registry: Arc<Registry>, ledger: Arc<TelemetryLedger>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            ledger,
            edges: Vec::new(),
            config: EngineConfig::default(),
            clock: Arc::new(SystemClock),
            publisher: None,
            store: None,
        }
    }

    /// Orchestrator with default config and no collaborators
    ///
    /// # Errors
    /// Returns [`BuildError`] if the registry cannot be ordered.
    pub fn new(registry: Arc<Registry>, ledger: Arc<TelemetryLedger>) -> Result<Self, BuildError> {
        Self::builder(registry, ledger).build()
    }

    /// State of the most recently started run
    #[must_use]
    pub fn state(&self) -> RunState {
        self.latest
            .lock()
            .map_or(RunState::Idle, |(_, state)| state)
    }

    /// Stages in execution order
    #[inline]
    #[must_use]
    pub fn list_stages(&self) -> &[Stage] {
        &self.plan.ordered_stages
    }

    /// Computed plan
    #[inline]
    #[must_use]
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Shared registry
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Shared ledger
    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &Arc<TelemetryLedger> {
        &self.ledger
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bounded channel sized for [`Orchestrator::run_streaming`]
    #[must_use]
    pub fn phase_channel(&self) -> (mpsc::Sender<PhaseOutput>, mpsc::Receiver<PhaseOutput>) {
        mpsc::channel(self.config.phase_queue_capacity)
    }

    /// Execute one run
    ///
    /// # Errors
    /// Returns [`OrchestratorError`] with the events emitted so far when a
    /// plugin fails, the run is cancelled, or the input does not fit the mode.
    pub async fn run(&self, request: RunRequest) -> Result<OrchestratorOutput, OrchestratorError> {
        self.execute(request, None).await
    }

    /// Execute one run, streaming each plugin output into `sender`
    ///
    /// The queue is bounded, so the receiver must be drained concurrently.
    /// A dropped receiver does not fail the run.
    ///
    /// # Errors
    /// Same as [`Orchestrator::run`].
    pub async fn run_streaming(
        &self,
        request: RunRequest,
        sender: mpsc::Sender<PhaseOutput>,
    ) -> Result<OrchestratorOutput, OrchestratorError> {
        self.execute(request, Some(sender)).await
    }

    async fn execute(
        &self,
        request: RunRequest,
        sink: Option<mpsc::Sender<PhaseOutput>>,
    ) -> Result<OrchestratorOutput, OrchestratorError> {
        let RunRequest {
            tenant,
            input,
            mode,
            cancel,
        } = request;
        let started = Instant::now();
        let ctx = RunContext::new(tenant, mode, self.clock.now());
        let span = tracing::info_span!(
            "run",
            run_id = %ctx.run_id,
            tenant = %ctx.tenant_id,
            mode = %ctx.mode
        );

        let trace = RunTrace {
            ctx: &ctx,
            log: EventLog::new(),
            clock: self.clock.as_ref(),
            ledger: &self.ledger,
            publisher: if self.config.publish_events {
                self.publisher.as_deref()
            } else {
                None
            },
        };
        let mut machine = RunStateMachine::new();
        let finalizer = RunFinalizer {
            latest: &self.latest,
            run_id: ctx.run_id,
            finished: false,
        };

        let result = with_scope(
            "run",
            |scope| {
                scope.defer(self.registry.lease());
                scope.defer(self.ledger.lease());
            },
            |()| {
                self.drive(&trace, &mut machine, input, &cancel, sink.as_ref())
                    .instrument(span.clone())
            },
        )
        .await;

        let terminal = if result.is_ok() {
            RunState::Completed
        } else {
            RunState::Errored
        };
        if let Err(e) = machine.advance(terminal) {
            tracing::warn!(parent: &span, error = %e, "run state not finalized");
        }
        finalizer.finish(machine.state());

        let events = trace.log.into_events();
        let diagnostics = RunDiagnostics::from_events(&events, elapsed_ms(started));
        let outcome = match &result {
            Ok(_) => RunOutcome::Completed,
            Err(e) => RunOutcome::Errored {
                reason: e.to_string(),
            },
        };
        self.persist(&ctx, outcome, &events, diagnostics)
            .instrument(span.clone())
            .await;

        match result {
            Ok(output) => {
                tracing::info!(
                    parent: &span,
                    stage_count = diagnostics.stage_count,
                    elapsed_ms = diagnostics.elapsed_ms,
                    "run completed"
                );
                Ok(OrchestratorOutput {
                    context: ctx,
                    output,
                    events,
                    diagnostics,
                })
            }
            Err(error) => {
                tracing::warn!(parent: &span, error = %error, "run errored");
                Err(OrchestratorError {
                    run_id: ctx.run_id,
                    error,
                    events,
                    stage_count: diagnostics.stage_count,
                    elapsed_ms: diagnostics.elapsed_ms,
                })
            }
        }
    }

    async fn drive(
        &self,
        trace: &RunTrace<'_>,
        machine: &mut RunStateMachine,
        input: RunInput,
        cancel: &CancellationToken,
        sink: Option<&mpsc::Sender<PhaseOutput>>,
    ) -> Result<RunOutput, RunError> {
        machine.advance(RunState::Running)?;
        self.mark_started(trace.ctx.run_id);
        tracing::info!(stages = self.plan.len(), "run started");
        trace.emit(
            EventKind::Started,
            None,
            None,
            Some(trace.ctx.mode.label().to_string()),
        );
        self.dispatch(trace, input, cancel, sink).await
    }

    async fn dispatch(
        &self,
        trace: &RunTrace<'_>,
        input: RunInput,
        cancel: &CancellationToken,
        sink: Option<&mpsc::Sender<PhaseOutput>>,
    ) -> Result<RunOutput, RunError> {
        let mode = &trace.ctx.mode;
        match (mode, input) {
            (RunMode::Multi, RunInput::Signals(signals)) => self
                .run_signals(trace, signals, cancel, sink)
                .await
                .map(RunOutput::Signals),
            (RunMode::Multi, RunInput::Payload(_)) => Err(RunError::InvalidInput {
                mode: mode.label(),
                reason: "expected signals, got a payload".to_string(),
            }),
            (_, RunInput::Payload(payload)) => self
                .run_sequential(trace, payload, cancel, sink)
                .await
                .map(RunOutput::Payload),
            (_, RunInput::Signals(_)) => Err(RunError::InvalidInput {
                mode: mode.label(),
                reason: "expected a payload, got signals".to_string(),
            }),
        }
    }

    /// Single and canary
    async fn run_sequential(
        &self,
        trace: &RunTrace<'_>,
        input: Payload,
        cancel: &CancellationToken,
        sink: Option<&mpsc::Sender<PhaseOutput>>,
    ) -> Result<Payload, RunError> {
        let mode = &trace.ctx.mode;
        let mut payload = input;
        for stage in &self.plan.ordered_stages {
            if cancel.is_cancelled() {
                tracing::info!(stage = %stage, "cancellation observed");
                return Err(RunError::Cancelled {
                    before: Some(stage.clone()),
                });
            }

            let Some(plugin) = self
                .registry
                .by_stage(stage)
                .into_iter()
                .find(|p| mode.admits(p.id()))
            else {
                trace.emit(
                    EventKind::Skipped,
                    Some(stage),
                    None,
                    Some("no eligible plugin".to_string()),
                );
                continue;
            };

            payload = self.invoke(trace, stage, plugin, payload, None, sink).await?;
        }
        Ok(payload)
    }

    /// Multi
    async fn run_signals(
        &self,
        trace: &RunTrace<'_>,
        signals: Vec<Signal>,
        cancel: &CancellationToken,
        sink: Option<&mpsc::Sender<PhaseOutput>>,
    ) -> Result<Vec<SignalOutput>, RunError> {
        // not linked to `cancel`: a failure must not look like cancellation
        let halt = CancellationToken::new();
        let ends: Vec<SignalEnd> = signals
            .into_iter()
            .enumerate()
            .map(|(index, signal)| self.run_signal(trace, index, signal, cancel, &halt, sink))
            .collect::<FuturesUnordered<_>>()
            .collect()
            .await;

        let mut outputs = Vec::with_capacity(ends.len());
        let mut cancelled = None;
        for end in ends {
            match end {
                SignalEnd::Done(output) => outputs.push(output),
                SignalEnd::Halted => {}
                SignalEnd::Failed(e) if e.is_cancelled() => {
                    cancelled.get_or_insert(e);
                }
                // completion order, so this is the earliest failure
                SignalEnd::Failed(e) => return Err(e),
            }
        }
        match cancelled {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }

    async fn run_signal(
        &self,
        trace: &RunTrace<'_>,
        index: usize,
        signal: Signal,
        cancel: &CancellationToken,
        halt: &CancellationToken,
        sink: Option<&mpsc::Sender<PhaseOutput>>,
    ) -> SignalEnd {
        let Signal { kind, payload } = signal;
        if cancel.is_cancelled() {
            tracing::info!(stage = %kind, signal = index, "cancellation observed");
            return SignalEnd::Failed(RunError::Cancelled { before: Some(kind) });
        }

        let plugins = self.registry.by_stage(&kind);
        if plugins.is_empty() {
            trace.emit(
                EventKind::Skipped,
                Some(&kind),
                None,
                Some(format!("no plugin for signal {index}")),
            );
            return SignalEnd::Done(SignalOutput {
                index,
                kind,
                payload,
                plugins: Vec::new(),
            });
        }

        let mut payload = payload;
        let mut ran = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            if halt.is_cancelled() {
                tracing::debug!(stage = %kind, signal = index, "signal halted after sibling failure");
                return SignalEnd::Halted;
            }
            match self
                .invoke(trace, &kind, plugin, payload, Some(index), sink)
                .await
            {
                Ok(output) => {
                    payload = output;
                    ran.push(plugin.id().clone());
                }
                Err(e) => {
                    halt.cancel();
                    return SignalEnd::Failed(e);
                }
            }
        }
        SignalEnd::Done(SignalOutput {
            index,
            kind,
            payload,
            plugins: ran,
        })
    }

    async fn invoke(
        &self,
        trace: &RunTrace<'_>,
        stage: &Stage,
        plugin: &Arc<dyn Plugin>,
        input: Payload,
        signal: Option<usize>,
        sink: Option<&mpsc::Sender<PhaseOutput>>,
    ) -> Result<Payload, RunError> {
        let plugin_id = plugin.id();
        trace.emit(EventKind::Started, Some(stage), Some(plugin_id), None);

        match plugin.run(&trace.stage_context(stage), input).await {
            Ok(output) => {
                trace.emit(EventKind::Completed, Some(stage), Some(plugin_id), None);
                if let Some(sender) = sink {
                    let phase = PhaseOutput {
                        run_id: trace.ctx.run_id,
                        stage: stage.clone(),
                        plugin_id: plugin_id.clone(),
                        payload: output.clone(),
                        signal,
                    };
                    if sender.send(phase).await.is_err() {
                        tracing::debug!(stage = %stage, "phase receiver dropped");
                    }
                }
                Ok(output)
            }
            Err(cause) => {
                trace.emit(
                    EventKind::Failed,
                    Some(stage),
                    Some(plugin_id),
                    Some(format!("{cause:#}")),
                );
                Err(RunError::PluginExecution {
                    stage: stage.clone(),
                    plugin_id: plugin_id.clone(),
                    cause,
                })
            }
        }
    }

    fn mark_started(&self, run_id: RunId) {
        *self.latest.lock() = Some((run_id, RunState::Running));
    }

    async fn persist(
        &self,
        ctx: &RunContext,
        outcome: RunOutcome,
        events: &[LifecycleEvent],
        diagnostics: RunDiagnostics,
    ) {
        if !self.config.persist_runs {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        let record = RunRecord {
            context: ctx.clone(),
            outcome,
            events: events.to_vec(),
            stage_count: diagnostics.stage_count,
            elapsed_ms: diagnostics.elapsed_ms,
        };
        if let Err(e) = store.save(record).await {
            tracing::warn!(error = %e, "run record not saved");
        }
    }
}

/// Settles `latest` for one run, marking it errored if the run future is
/// dropped before it finishes
struct RunFinalizer<'a> {
    latest: &'a Mutex<Option<(RunId, RunState)>>,
    run_id: RunId,
    finished: bool,
}

impl RunFinalizer<'_> {
    fn finish(mut self, state: RunState) {
        self.settle(state);
        self.finished = true;
    }

    fn settle(&self, state: RunState) {
        let mut latest = self.latest.lock();
        if let Some((id, current)) = latest.as_mut() {
            if *id == self.run_id {
                *current = state;
            }
        }
    }
}

impl Drop for RunFinalizer<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(run_id = %self.run_id, "run dropped before it finished");
            self.settle(RunState::Errored);
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.plan.ordered_stages)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("publisher", &self.publisher.is_some())
            .field("store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
