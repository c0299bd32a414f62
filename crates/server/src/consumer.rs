//! Sandbox-run event consumer.
//!
//! Projects the at-least-once sandbox lifecycle stream onto the durable
//! `sandbox_runs` ledger. Exactly-once effect comes from idempotent writes:
//! inserts treat duplicates as success, updates are keyed by sandbox id.
//! Messages are acknowledged only after their effect is durable; malformed
//! payloads are skipped so they never block progress.

use crate::events::{EventStream, StreamMessage};
use cistern_core::events::{
    SANDBOX_CREATED, SANDBOX_KILLED, SANDBOX_PAUSED, SANDBOX_RESUMED, SandboxEvent,
};
use cistern_metadata::models::NewSandboxRun;
use cistern_metadata::{MetadataError, MetadataStore, SandboxRunRepo};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;

/// Messages fetched per batch.
const BATCH_SIZE: usize = 100;

/// Blocking time of one group read.
const BLOCK_TIME: Duration = Duration::from_secs(5);

/// Pending age after which messages are claimed from crashed peers.
const CLAIM_TIME: Duration = Duration::from_secs(300);

/// Messages claimed per sweep.
const CLAIM_BATCH: usize = 10;

/// The sandbox-run ledger consumer.
pub struct Consumer {
    stream: Arc<dyn EventStream>,
    db: Arc<dyn MetadataStore>,
    consumer_id: String,
}

impl Consumer {
    /// Create a consumer with a `<host>-<yyyymmddHHMMSS>` consumer name.
    pub fn new(stream: Arc<dyn EventStream>, db: Arc<dyn MetadataStore>) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "api".to_string());
        let stamp = OffsetDateTime::now_utc()
            .format(format_description!(
                "[year][month][day][hour][minute][second]"
            ))
            .unwrap_or_default();

        Self {
            stream,
            db,
            consumer_id: format!("{host}-{stamp}"),
        }
    }

    /// The consumer's name within the group.
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Run until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tracing::info!(consumer_id = %self.consumer_id, "Starting sandbox runs consumer");

        if let Err(e) = self.stream.ensure_group().await {
            tracing::error!(error = %e, "Failed to create consumer group");
            return;
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    tracing::info!(consumer_id = %self.consumer_id, "Sandbox runs consumer stopping");
                    return;
                }
                _ = self.process_batch() => {}
            }
        }
    }

    /// Read and process one batch, then reclaim stale pending messages.
    /// Returns how many messages were applied.
    pub async fn process_batch(&self) -> usize {
        let mut processed = 0;

        let messages = match self
            .stream
            .read_batch(&self.consumer_id, BATCH_SIZE, BLOCK_TIME)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read from stream");
                return 0;
            }
        };

        for message in messages {
            match self.process_message(&message).await {
                Ok(()) => {
                    if let Err(e) = self.stream.ack(&message.id).await {
                        tracing::error!(message_id = %message.id, error = %e, "Failed to ack message");
                    } else {
                        processed += 1;
                    }
                }
                Err(e) => {
                    // No ack: the message will be redelivered.
                    tracing::error!(
                        message_id = %message.id,
                        error = %e,
                        "Failed to process message"
                    );
                }
            }
        }

        processed += self.claim_pending().await;
        processed
    }

    /// Claim and process messages stuck pending on crashed consumers.
    async fn claim_pending(&self) -> usize {
        let claimed = match self
            .stream
            .claim_idle(&self.consumer_id, CLAIM_TIME, CLAIM_BATCH)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to claim pending messages");
                return 0;
            }
        };

        let mut processed = 0;
        for message in claimed {
            if self.process_message(&message).await.is_ok()
                && self.stream.ack(&message.id).await.is_ok()
            {
                processed += 1;
            }
        }
        processed
    }

    async fn process_message(&self, message: &StreamMessage) -> Result<(), MetadataError> {
        let payload = match &message.payload {
            Some(payload) => payload,
            // Skip malformed messages; they must not block progress.
            None => return Ok(()),
        };

        let event: SandboxEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(
                    message_id = %message.id,
                    error = %e,
                    "Skipping unparseable event payload"
                );
                return Ok(());
            }
        };

        self.handle_event(event).await
    }

    async fn handle_event(&self, event: SandboxEvent) -> Result<(), MetadataError> {
        match event.event_type.as_str() {
            SANDBOX_CREATED => self.handle_created(event).await,
            SANDBOX_KILLED => self.handle_killed(event).await,
            SANDBOX_PAUSED => self.handle_paused(event).await,
            SANDBOX_RESUMED => self.handle_resumed(event).await,
            other => {
                tracing::debug!(event_type = %other, "Ignoring unknown event type");
                Ok(())
            }
        }
    }

    fn new_run(event: &SandboxEvent) -> NewSandboxRun {
        NewSandboxRun {
            sandbox_id: event.sandbox_id.clone(),
            team_id: event.sandbox_team_id,
            template_id: event.sandbox_template_id.clone(),
            build_id: event.sandbox_build_id.clone().filter(|id| !id.is_empty()),
            metadata: None,
            volume_id: None,
            volume_mount_path: None,
            timeout_at: None,
        }
    }

    async fn handle_created(&self, event: SandboxEvent) -> Result<(), MetadataError> {
        tracing::debug!(sandbox_id = %event.sandbox_id, "Processing sandbox created event");

        match self.db.create_sandbox_run(&Self::new_run(&event)).await {
            Ok(()) => Ok(()),
            // Redelivery: the row already exists.
            Err(MetadataError::AlreadyExists(_)) => {
                tracing::debug!(sandbox_id = %event.sandbox_id, "Sandbox run already exists, skipping");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_killed(&self, event: SandboxEvent) -> Result<(), MetadataError> {
        tracing::debug!(sandbox_id = %event.sandbox_id, "Processing sandbox killed event");

        let end_reason = event.end_reason().unwrap_or("killed").to_string();
        self.db
            .end_sandbox_run(&event.sandbox_id, &end_reason)
            .await?;
        Ok(())
    }

    async fn handle_paused(&self, event: SandboxEvent) -> Result<(), MetadataError> {
        tracing::debug!(sandbox_id = %event.sandbox_id, "Processing sandbox paused event");

        self.db
            .update_sandbox_run_status(&event.sandbox_id, "paused")
            .await?;
        Ok(())
    }

    /// Resume mints a new sandbox id, so a resumed event inserts a new row;
    /// on redelivery it falls back to flipping the status.
    async fn handle_resumed(&self, event: SandboxEvent) -> Result<(), MetadataError> {
        tracing::debug!(sandbox_id = %event.sandbox_id, "Processing sandbox resumed event");

        match self.db.create_sandbox_run(&Self::new_run(&event)).await {
            Ok(()) => Ok(()),
            Err(MetadataError::AlreadyExists(_)) => {
                self.db
                    .update_sandbox_run_status(&event.sandbox_id, "running")
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
