//! Escalation sink for blocked entities.
//!
//! When the cycle controller or the scheduler cannot make forward progress,
//! it publishes an [`EscalationRecord`] to the configured sink. The sink is
//! a passive collaborator: it receives records and does not itself resolve
//! escalations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::RunId;

/// A record of an entity that requires a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    /// Identifier of the blocked entity (run, phase or execution).
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub reason: String,
    /// What was already tried, in order.
    pub attempted_approaches: Vec<String>,
    /// What the engine needs from a human to proceed.
    pub required_human_input: String,
    pub created_at: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn new(entity_id: &str, reason: &str, required_human_input: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            run_id: None,
            reason: reason.to_string(),
            attempted_approaches: Vec::new(),
            required_human_input: required_human_input.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_attempts(mut self, attempts: Vec<String>) -> Self {
        self.attempted_approaches = attempts;
        self
    }
}

/// Receives escalation records when automatic progress halts.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn escalate(&self, record: EscalationRecord);
}

/// Forwards escalation records over an mpsc channel to an external consumer.
pub struct ChannelSink {
    tx: mpsc::Sender<EscalationRecord>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<EscalationRecord>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EscalationSink for ChannelSink {
    async fn escalate(&self, record: EscalationRecord) {
        // A closed receiver means nobody is listening; dropping the record
        // is the only option left for a passive sink.
        self.tx.send(record).await.ok();
    }
}

/// Discards every record. Useful for tests and fire-and-forget runs.
pub struct NullSink;

#[async_trait]
impl EscalationSink for NullSink {
    async fn escalate(&self, _record: EscalationRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_records() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ChannelSink::new(tx);
        let run_id = RunId::new();

        sink.escalate(
            EscalationRecord::new("run/05", "repair budget exhausted", "retry or skip")
                .with_run(run_id)
                .with_attempts(vec!["attempt 1: missing field".into()]),
        )
        .await;

        let record = rx.recv().await.unwrap();
        assert_eq!(record.entity_id, "run/05");
        assert_eq!(record.run_id, Some(run_id));
        assert_eq!(record.attempted_approaches.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_sink_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = ChannelSink::new(tx);
        // Must not panic.
        sink.escalate(EscalationRecord::new("x", "y", "z")).await;
    }
}
