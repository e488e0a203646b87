use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::NotifierSettings;
use crate::models::{MatchFoundPayload, NotificationRecord};
use crate::services::audit::AuditLog;
use crate::services::records::{RecordStore, RecordStoreError};

/// Errors that can occur during outbound delivery
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Delivery attempts exhausted after {0} tries")]
    DeliveryExhausted(u32),

    #[error("Record store error: {0}")]
    StoreError(#[from] RecordStoreError),

    #[error("Notifier worker is not running")]
    WorkerGone,
}

/// Outbound transport for match-found events
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send(&self, payload: &MatchFoundPayload) -> Result<(), NotifierError>;
}

/// Webhook transport posting JSON to the downstream consumer
pub struct WebhookTransport {
    client: Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: String, request_timeout: Duration) -> Result<Self, NotifierError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NotifierError::DeliveryFailure(e.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl DeliveryTransport for WebhookTransport {
    async fn send(&self, payload: &MatchFoundPayload) -> Result<(), NotifierError> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", &payload.idempotency_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| NotifierError::DeliveryFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifierError::DeliveryFailure(format!(
                "Consumer returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Delivers exactly one observable notification per terminal proposal
///
/// Records are durably written as Pending before the caller's `enqueue`
/// returns; actual delivery is background work with exponential backoff.
/// Exhausted records land in the dead-letter set for manual replay. The
/// idempotency key (the match id) lets the consumer discard duplicates, so
/// transport-level at-least-once yields an observably exactly-once effect.
pub struct Notifier {
    tx: mpsc::UnboundedSender<NotificationRecord>,
    store: Arc<dyn RecordStore>,
}

#[derive(Clone)]
struct Worker {
    transport: Arc<dyn DeliveryTransport>,
    store: Arc<dyn RecordStore>,
    audit: Option<Arc<AuditLog>>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl Notifier {
    /// Create the notifier and spawn its delivery worker
    pub fn spawn(
        transport: Arc<dyn DeliveryTransport>,
        store: Arc<dyn RecordStore>,
        audit: Option<Arc<AuditLog>>,
        settings: &NotifierSettings,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<NotificationRecord>();
        let worker = Worker {
            transport,
            store: Arc::clone(&store),
            audit,
            max_attempts: settings.max_attempts.max(1),
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
        };

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let worker = worker.clone();
                tokio::spawn(async move {
                    worker.deliver_with_retry(record).await;
                });
            }
            tracing::debug!("Notifier channel closed, worker exiting");
        });

        Arc::new(Self { tx, store })
    }

    /// Queue a record for delivery, durably when the store allows it
    ///
    /// A store failure degrades durability but never drops the record: the
    /// worker still receives it and only a crash before delivery would lose
    /// it. Delivery itself is fire-and-forget from the caller's perspective.
    pub async fn enqueue(&self, record: NotificationRecord) -> Result<(), NotifierError> {
        match self.store.is_delivered(&record.idempotency_key).await {
            Ok(true) => {
                tracing::debug!(
                    idempotency_key = %record.idempotency_key,
                    "Notification already delivered, skipping"
                );
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Record store check failed, queueing anyway: {}", e);
            }
        }

        if let Err(e) = self.store.put_pending(&record).await {
            tracing::error!(
                idempotency_key = %record.idempotency_key,
                "Failed to persist pending record, delivering without durability: {}",
                e
            );
        }
        self.tx.send(record).map_err(|_| NotifierError::WorkerGone)
    }

    /// Re-queue pending records left over from a previous run
    pub async fn resume(&self) -> Result<usize, NotifierError> {
        let pending = self.store.load_pending().await?;
        let count = pending.len();
        for record in pending {
            self.tx.send(record).map_err(|_| NotifierError::WorkerGone)?;
        }
        if count > 0 {
            tracing::info!("Resuming {} pending notification deliveries", count);
        }
        Ok(count)
    }
}

impl Worker {
    async fn deliver_with_retry(&self, mut record: NotificationRecord) {
        // A resumed record may have been delivered by a racing worker
        match self.store.is_delivered(&record.idempotency_key).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Record store check failed, delivering anyway: {}", e);
            }
        }

        for attempt in 0..self.max_attempts {
            record.attempts = attempt + 1;

            match self.transport.send(&record.payload).await {
                Ok(()) => {
                    self.audit_attempt(&record, true, None).await;
                    if let Err(e) = self.store.mark_delivered(&record).await {
                        tracing::error!(
                            idempotency_key = %record.idempotency_key,
                            "Delivered but failed to persist delivery state: {}",
                            e
                        );
                    }
                    tracing::info!(
                        match_id = %record.match_id,
                        attempts = record.attempts,
                        "Notification delivered"
                    );
                    return;
                }
                Err(e) => {
                    self.audit_attempt(&record, false, Some(&e.to_string())).await;
                    tracing::warn!(
                        match_id = %record.match_id,
                        attempt = record.attempts,
                        max_attempts = self.max_attempts,
                        "Delivery attempt failed: {}",
                        e
                    );
                    if attempt + 1 < self.max_attempts {
                        tokio::time::sleep(self.backoff_base * 2u32.pow(attempt)).await;
                    }
                }
            }
        }

        // Exhausted: retain for operator replay
        if let Err(e) = self.store.mark_failed(&record).await {
            tracing::error!("Failed to dead-letter record {}: {}", record.idempotency_key, e);
        }
        tracing::error!(
            match_id = %record.match_id,
            attempts = self.max_attempts,
            "Notification delivery exhausted, record dead-lettered"
        );
    }

    async fn audit_attempt(&self, record: &NotificationRecord, succeeded: bool, error: Option<&str>) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit
                .append_delivery_attempt(record.match_id, record.attempts, succeeded, error)
                .await
            {
                tracing::warn!("Failed to audit delivery attempt: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchCriteria, MatchProposal, Participant};
    use crate::services::records::MemoryRecordStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record() -> NotificationRecord {
        let p = |id: &str| {
            Participant::new(
                id.to_string(),
                format!("session-{}", id),
                format!("user-{}", id),
                "female".to_string(),
                "en".to_string(),
                MatchCriteria {
                    language: "en".to_string(),
                    fluency: 5,
                    topics: vec!["music".to_string()],
                    dating: false,
                },
            )
        };
        let proposal =
            MatchProposal::new(vec![p("a"), p("b")], 0.8, chrono::Duration::seconds(30));
        NotificationRecord::for_proposal(&proposal, Utc::now())
    }

    /// Transport that fails a configured number of times before succeeding
    struct FlakyTransport {
        failures: AtomicU32,
        sent: AtomicU32,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                sent: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl DeliveryTransport for FlakyTransport {
        async fn send(&self, _: &MatchFoundPayload) -> Result<(), NotifierError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(NotifierError::DeliveryFailure("unavailable".into()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings(max_attempts: u32) -> NotifierSettings {
        NotifierSettings {
            max_attempts,
            backoff_base_ms: 1,
            request_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_delivers_after_transient_failures() {
        let transport = Arc::new(FlakyTransport::new(2));
        let store = Arc::new(MemoryRecordStore::new());
        let notifier = Notifier::spawn(
            transport.clone(),
            store.clone(),
            None,
            &settings(5),
        );

        let rec = record();
        let key = rec.idempotency_key.clone();
        notifier.enqueue(rec).await.unwrap();

        // Worker runs in the background; poll until the record settles
        for _ in 0..100 {
            if store.is_delivered(&key).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(store.is_delivered(&key).await.unwrap());
        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_dead_letters_the_record() {
        let transport = Arc::new(FlakyTransport::new(u32::MAX));
        let store = Arc::new(MemoryRecordStore::new());
        let notifier = Notifier::spawn(transport, store.clone(), None, &settings(2));

        notifier.enqueue(record()).await.unwrap();

        for _ in 0..100 {
            if !store.load_failed().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let failed = store.load_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(store.load_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_observably_once() {
        let transport = Arc::new(FlakyTransport::new(0));
        let store = Arc::new(MemoryRecordStore::new());
        let notifier = Notifier::spawn(
            transport.clone(),
            store.clone(),
            None,
            &settings(3),
        );

        let rec = record();
        let key = rec.idempotency_key.clone();
        notifier.enqueue(rec.clone()).await.unwrap();

        for _ in 0..100 {
            if store.is_delivered(&key).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Second enqueue for the same key (e.g. crash-restart replay)
        notifier.enqueue(rec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
        assert_eq!(store.delivered_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_requeues_pending_records() {
        let store = Arc::new(MemoryRecordStore::new());
        let rec = record();
        let key = rec.idempotency_key.clone();
        store.put_pending(&rec).await.unwrap();

        let transport = Arc::new(FlakyTransport::new(0));
        let notifier = Notifier::spawn(
            transport,
            store.clone(),
            None,
            &settings(3),
        );

        let resumed = notifier.resume().await.unwrap();
        assert_eq!(resumed, 1);

        for _ in 0..100 {
            if store.is_delivered(&key).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.is_delivered(&key).await.unwrap());
    }

    /// Store whose pending writes always fail; everything else delegates
    struct WriteFailingStore {
        inner: MemoryRecordStore,
    }

    #[async_trait]
    impl RecordStore for WriteFailingStore {
        async fn put_pending(&self, _: &NotificationRecord) -> Result<(), RecordStoreError> {
            Err(serde_json::from_str::<u32>("x").unwrap_err().into())
        }

        async fn mark_delivered(&self, record: &NotificationRecord) -> Result<(), RecordStoreError> {
            self.inner.mark_delivered(record).await
        }

        async fn mark_failed(&self, record: &NotificationRecord) -> Result<(), RecordStoreError> {
            self.inner.mark_failed(record).await
        }

        async fn is_delivered(&self, idempotency_key: &str) -> Result<bool, RecordStoreError> {
            self.inner.is_delivered(idempotency_key).await
        }

        async fn load_pending(&self) -> Result<Vec<NotificationRecord>, RecordStoreError> {
            self.inner.load_pending().await
        }

        async fn load_failed(&self) -> Result<Vec<NotificationRecord>, RecordStoreError> {
            self.inner.load_failed().await
        }
    }

    #[tokio::test]
    async fn test_store_write_failure_does_not_drop_the_record() {
        let transport = Arc::new(FlakyTransport::new(0));
        let store = Arc::new(WriteFailingStore {
            inner: MemoryRecordStore::new(),
        });
        let notifier = Notifier::spawn(transport.clone(), store, None, &settings(3));

        // The pending write fails, but the record must still reach the worker
        notifier.enqueue(record()).await.unwrap();

        for _ in 0..100 {
            if transport.sent.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);
    }
}
