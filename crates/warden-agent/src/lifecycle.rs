//! Agent lifecycle controller.
//!
//! `Agent<W>` owns one [`Worker`] and moves it through the lifecycle.
//! Health and metrics run as two timer tasks per agent; each is a single
//! sequential loop, so ticks of the same timer never overlap. Both loops are
//! cancelled and awaited by `stop()`, so nothing ticks after it returns.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use warden_core::clock::{Clock, SystemClock};
use warden_core::config::WardenConfig;
use warden_core::error::{Result, WardenError};
use warden_core::events::{AgentEvent, EventBus};
use warden_core::traits::Store;
use warden_core::types::{AgentError, AgentState, HealthRecord, MetricsSnapshot};
use warden_resilience::{
    DeadLetterQueue, ErrorHandler, EscalationPolicy, ReplayHandler, RetryExecutor, RetryPolicy,
    classify,
};

use crate::health::{HealthCheck, HealthThresholds, MetricsCollector, TickGuard};

/// Worker-specific logic plugged into an [`Agent`].
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    type Command: Send + 'static;
    type Output: Send + 'static;

    /// Verify dependencies and allocate resources. Failure is fatal.
    async fn initialize(&self, ctx: &AgentContext) -> anyhow::Result<()> {
        ctx.store().ping().await?;
        Ok(())
    }

    async fn cleanup(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_command(
        &self,
        ctx: &AgentContext,
        command: Self::Command,
    ) -> anyhow::Result<Self::Output>;

    async fn check_health(&self, ctx: &AgentContext) -> anyhow::Result<HealthCheck> {
        Ok(ctx.default_health().await)
    }

    /// Worker-specific gauges merged into each metrics snapshot.
    async fn collect_metrics(&self, _ctx: &AgentContext) -> anyhow::Result<BTreeMap<String, Value>> {
        Ok(BTreeMap::new())
    }

    /// Re-execute a dead-lettered operation.
    async fn replay(&self, _ctx: &AgentContext, operation: &str, _payload: &Value) -> anyhow::Result<()> {
        anyhow::bail!("no replay support for operation '{operation}'")
    }
}

/// Process-wide collaborators handed to every agent at construction.
#[derive(Clone)]
pub struct AgentServices {
    pub store: Arc<dyn Store>,
    pub handler: Arc<ErrorHandler>,
    pub events: EventBus,
    pub clock: Arc<dyn Clock>,
    pub dlq: Option<Arc<DeadLetterQueue>>,
    pub config: WardenConfig,
}

impl AgentServices {
    /// Default escalation policy, system clock, no dead-letter queue.
    pub fn new(store: Arc<dyn Store>, config: WardenConfig) -> Self {
        let events = EventBus::default();
        let handler = Arc::new(ErrorHandler::new(
            store.clone(),
            EscalationPolicy::default(),
            events.clone(),
        ));
        Self {
            store,
            handler,
            events,
            clock: Arc::new(SystemClock),
            dlq: None,
            config,
        }
    }

    pub fn with_dlq(mut self, dlq: Arc<DeadLetterQueue>) -> Self {
        self.dlq = Some(dlq);
        self
    }
}

/// What a worker sees of its agent.
pub struct AgentContext {
    name: String,
    store: Arc<dyn Store>,
    handler: Arc<ErrorHandler>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    dlq: Option<Arc<DeadLetterQueue>>,
    retry: RetryExecutor,
    metrics: MetricsCollector,
    thresholds: HealthThresholds,
    health_tick: TickGuard,
    metrics_tick: TickGuard,
}

impl AgentContext {
    pub fn new(name: &str, services: &AgentServices) -> Self {
        Self {
            name: name.to_string(),
            store: services.store.clone(),
            handler: services.handler.clone(),
            events: services.events.clone(),
            clock: services.clock.clone(),
            dlq: services.dlq.clone(),
            retry: RetryExecutor::new(
                name,
                RetryPolicy::from_config(&services.config.retry),
                services.handler.clone(),
            ),
            metrics: MetricsCollector::new(),
            thresholds: HealthThresholds::from_config(&services.config.health),
            health_tick: TickGuard::new(),
            metrics_tick: TickGuard::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn handler(&self) -> &Arc<ErrorHandler> {
        &self.handler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn dlq(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dlq.as_ref()
    }

    pub fn retry(&self) -> &RetryExecutor {
        &self.retry
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Route a failure through the shared handler under this agent's name.
    pub async fn report(&self, error: &anyhow::Error, context: &str) -> AgentError {
        self.handler.handle(&self.name, error, context).await
    }

    /// `with_retry`, then dead-letter the operation if it still fails.
    /// The final error is returned either way.
    pub async fn run_resilient<T, F, Fut>(
        &self,
        key: &str,
        operation: &str,
        payload: Value,
        op: F,
    ) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let err = match self.retry.with_retry(key, operation, op).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        // A key clash never ran the operation; nothing to park.
        if matches!(err.downcast_ref::<WardenError>(), Some(WardenError::RetryKeyInFlight(_))) {
            return Err(err);
        }
        match &self.dlq {
            Some(dlq) => {
                dlq.enqueue(&self.name, operation, payload, &classify(&err)).await;
            }
            None => tracing::warn!(
                agent = %self.name,
                "⚠️ [{}] '{operation}' failed and no dead-letter queue is configured", self.name
            ),
        }
        Err(err)
    }

    /// Error-count bands plus a store reachability check.
    pub async fn default_health(&self) -> HealthCheck {
        let store_ok = self.store.ping().await.is_ok();
        let status = self.thresholds.evaluate(self.metrics.error_count(), store_ok);
        HealthCheck {
            status,
            details: serde_json::json!({
                "success_count": self.metrics.success_count(),
                "error_count": self.metrics.error_count(),
                "warning_count": self.metrics.warning_count(),
                "store": if store_ok { "reachable" } else { "unreachable" },
                "in_flight": self.retry.in_flight().len(),
            }),
        }
    }
}

/// Current state plus the channel state changes are published on.
struct StateCell {
    agent: String,
    state: Mutex<AgentState>,
    events: EventBus,
}

impl StateCell {
    fn get(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, to: AgentState) -> Result<AgentState> {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(WardenError::InvalidTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            *state = to;
            from
        };
        self.announce(from, to);
        Ok(from)
    }

    /// Move to `error` unless the agent is already stopping or stopped.
    fn halt(&self) -> Option<AgentState> {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let from = *state;
            if matches!(from, AgentState::Stopping | AgentState::Stopped)
                || !from.can_transition_to(AgentState::Error)
            {
                return None;
            }
            *state = AgentState::Error;
            from
        };
        self.announce(from, AgentState::Error);
        Some(from)
    }

    fn announce(&self, from: AgentState, to: AgentState) {
        tracing::info!(agent = %self.agent, "🔄 [{}] {from} → {to}", self.agent);
        self.events.publish(AgentEvent::StateChanged {
            agent: self.agent.clone(),
            from,
            to,
        });
    }
}

struct Timers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Forwards dead-letter replays to the worker.
struct WorkerReplay<W: Worker> {
    worker: Arc<W>,
    ctx: Arc<AgentContext>,
}

#[async_trait]
impl<W: Worker> ReplayHandler for WorkerReplay<W> {
    async fn replay(&self, operation: &str, payload: &Value) -> anyhow::Result<()> {
        self.worker.replay(&self.ctx, operation, payload).await
    }
}

/// A supervised worker.
pub struct Agent<W: Worker> {
    worker: Arc<W>,
    ctx: Arc<AgentContext>,
    state: StateCell,
    health_interval: Duration,
    metrics_interval: Duration,
    timers: tokio::sync::Mutex<Option<Timers>>,
    /// Serializes start/stop.
    lifecycle: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    cleaned_up: AtomicBool,
}

impl<W: Worker> Agent<W> {
    pub fn new(name: &str, worker: W, services: &AgentServices) -> Self {
        Self {
            worker: Arc::new(worker),
            ctx: Arc::new(AgentContext::new(name, services)),
            state: StateCell {
                agent: name.to_string(),
                state: Mutex::new(AgentState::Idle),
                events: services.events.clone(),
            },
            health_interval: services.config.health.health_check_interval(),
            metrics_interval: services.config.health.metrics_interval(),
            timers: tokio::sync::Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            initialized: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn state(&self) -> AgentState {
        self.state.get()
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    /// `idle → initializing → ready → running`.
    ///
    /// An `initialize` failure is reported, leaves the agent in `error`, and
    /// is returned to the caller.
    pub async fn start(&self) -> anyhow::Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.state.transition(AgentState::Initializing)?;

        if let Err(e) = self.worker.initialize(&self.ctx).await {
            self.ctx.report(&e, "initialize").await;
            self.state.transition(AgentState::Error)?;
            return Err(e);
        }
        self.initialized.store(true, Ordering::SeqCst);
        self.state.transition(AgentState::Ready)?;

        if let Some(dlq) = &self.ctx.dlq {
            dlq.register_handler(
                self.name(),
                Arc::new(WorkerReplay {
                    worker: self.worker.clone(),
                    ctx: self.ctx.clone(),
                }),
            );
        }
        self.arm_timers().await;
        self.ctx.retry.set_owner_stopped(false);
        self.state.transition(AgentState::Running)?;
        tracing::info!("🚀 Agent '{}' running", self.name());
        Ok(())
    }

    /// Disarm timers, run `cleanup`, move to `stopped`.
    ///
    /// A no-op on a stopped agent. On an agent in `error` the timers are
    /// disarmed and cleanup runs once, but the state stays `error`.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let stopping = match self.state.get() {
            AgentState::Stopped => {
                tracing::debug!("Agent '{}' already stopped", self.name());
                return Ok(());
            }
            AgentState::Error => false,
            _ => match self.state.transition(AgentState::Stopping) {
                Ok(_) => true,
                // A fatal command error got there first.
                Err(_) if self.state.get() == AgentState::Error => false,
                Err(e) => return Err(e),
            },
        };

        self.shutdown().await;
        if stopping {
            self.state.transition(AgentState::Stopped)?;
            tracing::info!("🛑 Agent '{}' stopped", self.name());
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.disarm_timers().await;
        if let Some(dlq) = &self.ctx.dlq {
            dlq.unregister_handler(self.name());
        }
        self.ctx.retry.set_owner_stopped(true);

        if self.initialized.load(Ordering::SeqCst) && !self.cleaned_up.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.worker.cleanup(&self.ctx).await {
                self.ctx.report(&e, "cleanup").await;
            }
        }
    }

    /// Dispatch a command. Failures are reported before being returned;
    /// a fatal one moves the agent to `error`.
    pub async fn handle_command(&self, command: W::Command) -> anyhow::Result<W::Output> {
        if self.state.get() != AgentState::Running {
            return Err(WardenError::NotRunning(self.name().to_string()).into());
        }
        let started = Instant::now();
        match self.worker.handle_command(&self.ctx, command).await {
            Ok(output) => {
                self.ctx.metrics.record_success(started.elapsed());
                Ok(output)
            }
            Err(e) => {
                self.ctx.metrics.record_error();
                let classified = self.ctx.report(&e, "handle_command").await;
                if self.ctx.handler.policy().is_fatal(&classified) {
                    self.escalate_fatal(&classified).await;
                }
                Err(e)
            }
        }
    }

    async fn escalate_fatal(&self, error: &AgentError) {
        if self.state.halt().is_none() {
            tracing::warn!(
                agent = %self.name(),
                "⚠️ Agent '{}' is {}, fatal {} error not escalated: {}",
                self.name(), self.state(), error.kind, error.message
            );
            return;
        }
        tracing::error!(
            agent = %self.name(),
            "💥 Agent '{}' halted by fatal {} error: {}", self.name(), error.kind, error.message
        );
        self.disarm_timers().await;
        if let Some(dlq) = &self.ctx.dlq {
            dlq.unregister_handler(self.name());
        }
    }

    /// Run a health check now. `None` if one is already in progress.
    pub async fn check_health_now(&self) -> Option<HealthRecord> {
        health_tick(&*self.worker, &self.ctx).await
    }

    /// Collect metrics now. `None` if a collection is already in progress.
    pub async fn collect_metrics_now(&self) -> Option<MetricsSnapshot> {
        metrics_tick(&*self.worker, &self.ctx).await
    }

    async fn arm_timers(&self) {
        let cancel = CancellationToken::new();
        let health = {
            let (worker, ctx) = (self.worker.clone(), self.ctx.clone());
            spawn_timer(self.health_interval, cancel.clone(), move || {
                let (worker, ctx) = (worker.clone(), ctx.clone());
                async move {
                    health_tick(&*worker, &ctx).await;
                }
            })
        };
        let metrics = {
            let (worker, ctx) = (self.worker.clone(), self.ctx.clone());
            spawn_timer(self.metrics_interval, cancel.clone(), move || {
                let (worker, ctx) = (worker.clone(), ctx.clone());
                async move {
                    metrics_tick(&*worker, &ctx).await;
                }
            })
        };
        *self.timers.lock().await = Some(Timers {
            cancel,
            handles: vec![health, metrics],
        });
    }

    /// Cancel both loops and wait for them, including any tick in progress.
    async fn disarm_timers(&self) {
        let Some(timers) = self.timers.lock().await.take() else {
            return;
        };
        timers.cancel.cancel();
        for handle in timers.handles {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Timer task for '{}' ended abnormally: {e}", self.name());
            }
        }
    }
}

/// First tick fires one full period after arming.
fn spawn_timer<F, Fut>(period: Duration, cancel: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
    })
}

async fn health_tick<W: Worker>(worker: &W, ctx: &AgentContext) -> Option<HealthRecord> {
    let _pass = ctx.health_tick.try_enter()?;
    let check = match worker.check_health(ctx).await {
        Ok(check) => check,
        Err(e) => {
            ctx.metrics.record_warning();
            ctx.report(&e, "health check").await;
            HealthCheck::unhealthy(serde_json::json!({ "error": format!("{e:#}") }))
        }
    };
    let record = HealthRecord {
        agent: ctx.name.clone(),
        status: check.status,
        details: check.details,
        timestamp: ctx.clock.now(),
    };
    if let Err(e) = ctx.store.insert_health(&record).await {
        ctx.report(&anyhow::Error::new(e), "persist health").await;
    }
    tracing::debug!(agent = %ctx.name, "💓 [{}] health: {}", ctx.name, record.status);
    ctx.events.publish(AgentEvent::Health(record.clone()));
    Some(record)
}

async fn metrics_tick<W: Worker>(worker: &W, ctx: &AgentContext) -> Option<MetricsSnapshot> {
    let _pass = ctx.metrics_tick.try_enter()?;
    let custom = match worker.collect_metrics(ctx).await {
        Ok(custom) => custom,
        Err(e) => {
            ctx.metrics.record_warning();
            ctx.report(&e, "collect metrics").await;
            BTreeMap::new()
        }
    };
    let snapshot = ctx.metrics.snapshot(&ctx.name, custom, ctx.clock.now());
    if let Err(e) = ctx.store.insert_metrics(&snapshot).await {
        ctx.report(&anyhow::Error::new(e), "persist metrics").await;
    }
    tracing::debug!(
        agent = %ctx.name,
        "📊 [{}] {} ok / {} err / {:.1} MB",
        ctx.name, snapshot.success_count, snapshot.error_count, snapshot.memory_usage_mb
    );
    ctx.events.publish(AgentEvent::Metrics(snapshot.clone()));
    Some(snapshot)
}
