//! Command failure → in-process retry → dead letter → replay.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use warden_agent::{Agent, AgentContext, AgentServices, Worker};
use warden_core::clock::{Clock, ManualClock};
use warden_core::config::WardenConfig;
use warden_core::events::EventBus;
use warden_core::traits::Store;
use warden_core::types::{AgentState, DeadLetterFilter, DeadLetterStatus};
use warden_resilience::{DeadLetterPolicy, DeadLetterQueue, ErrorHandler, EscalationPolicy};
use warden_store::MemoryStore;

/// Scores messages against a backend that can be switched off.
#[derive(Default)]
struct Scorer {
    backend_up: AtomicBool,
    scored: Mutex<Vec<u64>>,
}

impl Scorer {
    fn score(&self, id: u64) -> anyhow::Result<u64> {
        if !self.backend_up.load(Ordering::SeqCst) {
            anyhow::bail!("database timeout");
        }
        self.scored.lock().unwrap().push(id);
        Ok(id * 10)
    }
}

#[async_trait]
impl Worker for Scorer {
    type Command = u64;
    type Output = u64;

    async fn handle_command(&self, ctx: &AgentContext, id: u64) -> anyhow::Result<u64> {
        ctx.run_resilient(
            &format!("score-{id}"),
            "score_message",
            json!({ "message_id": id }),
            move || async move { self.score(id) },
        )
        .await
    }

    async fn replay(&self, _ctx: &AgentContext, operation: &str, payload: &Value) -> anyhow::Result<()> {
        match operation {
            "score_message" => {
                let id = payload["message_id"]
                    .as_u64()
                    .context("payload has no message_id")?;
                self.score(id).map(|_| ())
            }
            other => anyhow::bail!("unknown operation '{other}'"),
        }
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    dlq: Arc<DeadLetterQueue>,
    agent: Agent<Scorer>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let events = EventBus::default();
    let config = WardenConfig::default();
    let handler = Arc::new(
        ErrorHandler::new(store.clone(), EscalationPolicy::default(), events.clone())
            .with_clock(clock.clone()),
    );
    let dlq = Arc::new(
        DeadLetterQueue::new(
            store.clone(),
            DeadLetterPolicy::from_config(&config.dead_letter),
            events.clone(),
        )
        .with_clock(clock.clone())
        .with_error_handler(handler.clone()),
    );
    let services = AgentServices {
        store: store.clone(),
        handler,
        events,
        clock: clock.clone(),
        dlq: Some(dlq.clone()),
        config,
    };
    let agent = Agent::new("scorer", Scorer::default(), &services);
    Harness {
        store,
        clock,
        dlq,
        agent,
    }
}

#[tokio::test(start_paused = true)]
async fn failed_command_is_dead_lettered_then_replayed() {
    let h = harness();
    h.agent.start().await.unwrap();
    assert_eq!(h.dlq.registered_agents(), vec!["scorer".to_string()]);

    let err = h.agent.handle_command(42).await.unwrap_err();
    assert_eq!(err.to_string(), "database timeout");
    assert!(h.agent.context().retry().in_flight().is_empty());

    let entries = h.dlq.list(&DeadLetterFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.agent, "scorer");
    assert_eq!(entry.operation, "score_message");
    assert_eq!(entry.payload, json!({ "message_id": 42 }));
    assert_eq!(entry.status, DeadLetterStatus::Pending);
    assert_eq!(entry.error.message, "database timeout");

    // One record from the exhausted retry, one from command dispatch.
    let errors = h.store.list_errors(Some("scorer"), 0).await.unwrap();
    let operations: Vec<&Value> = errors.iter().map(|e| &e.context["operation"]).collect();
    assert_eq!(operations, vec!["handle_command", "score_message (final retry)"]);

    h.agent.worker().backend_up.store(true, Ordering::SeqCst);
    h.clock.advance(Duration::from_secs(30));
    assert_eq!(h.dlq.process_due().await.unwrap().attempted, 0);

    h.clock.advance(Duration::from_secs(30));
    let report = h.dlq.process_due().await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(*h.agent.worker().scored.lock().unwrap(), vec![42]);
    assert_eq!(
        h.dlq.get(&entry.id).await.unwrap().unwrap().status,
        DeadLetterStatus::Resolved
    );

    h.agent.stop().await.unwrap();
    assert!(h.dlq.registered_agents().is_empty());
}

#[tokio::test(start_paused = true)]
async fn replays_converge_to_failed_and_can_be_requeued() {
    let h = harness();
    h.agent.start().await.unwrap();
    assert!(h.agent.handle_command(7).await.is_err());
    let id = h.dlq.list(&DeadLetterFilter::default()).await.unwrap()[0].id.clone();

    for secs in [60, 120, 240] {
        h.clock.advance(Duration::from_secs(secs));
        h.dlq.process_due().await.unwrap();
    }
    let entry = h.dlq.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, DeadLetterStatus::Failed);
    assert_eq!(entry.retry_count, entry.max_retries);

    let alerts = h.store.list_alerts(Some("scorer"), 0).await.unwrap();
    assert!(
        alerts
            .iter()
            .any(|a| a.context["operation"] == "score_message (dead letter failed)")
    );

    h.agent.worker().backend_up.store(true, Ordering::SeqCst);
    let fresh = h.dlq.requeue(&id).await.unwrap();
    assert_eq!(h.dlq.process_due().await.unwrap().resolved, 1);
    assert_eq!(*h.agent.worker().scored.lock().unwrap(), vec![7]);
    assert_eq!(
        h.dlq.get(&fresh.id).await.unwrap().unwrap().status,
        DeadLetterStatus::Resolved
    );

    // The failed entry stays on record.
    let original = h.dlq.get(&id).await.unwrap().unwrap();
    assert_eq!(original.status, DeadLetterStatus::Failed);
    assert_eq!(original.retry_count, original.max_retries);
    h.agent.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn entries_wait_while_the_owning_agent_is_down() {
    let h = harness();
    h.agent.start().await.unwrap();
    assert!(h.agent.handle_command(1).await.is_err());
    h.agent.stop().await.unwrap();
    assert_eq!(h.agent.state(), AgentState::Stopped);

    h.clock.advance(Duration::from_secs(3_600));
    assert_eq!(h.dlq.process_due().await.unwrap().attempted, 0);
    let stats = h.dlq.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    let entry = &h.dlq.list(&DeadLetterFilter::default()).await.unwrap()[0];
    assert!(entry.is_due(h.clock.now()));
}
