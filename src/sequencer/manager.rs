/// Live event distribution.
///
/// Each subscriber gets its own bounded channel of framed events. A
/// subscriber whose channel is full when a broadcast arrives is cut loose:
/// a terminal error frame is offered and the channel closes. Replay is the
/// caller's job (websocket handler), live delivery starts here.
use crate::error::PdsResult;
use crate::metrics;
use crate::sequencer::frames::{
    encode_error_frame, AccountEvt, CommitEvt, ErrorFrame, IdentityEvt, SeqEvent,
};
use crate::sequencer::persister::{DbPersister, PersistedEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Per-subscriber channel capacity before drop-on-slow kicks in
const SUBSCRIBER_BUFFER: usize = 512;

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// How long persisted events are kept before retention cleanup
    pub retention: chrono::Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            retention: chrono::Duration::days(14),
        }
    }
}

struct Subscriber {
    ident: String,
    tx: mpsc::Sender<Arc<PersistedEvent>>,
}

/// The event manager: persists, then broadcasts.
pub struct Sequencer {
    persister: DbPersister,
    config: SequencerConfig,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

/// Removes the subscriber when dropped
pub struct SubscriptionGuard {
    id: u64,
    sequencer: Arc<Sequencer>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.sequencer.remove_subscriber(self.id);
    }
}

impl Sequencer {
    pub fn new(persister: DbPersister, config: SequencerConfig) -> Self {
        Self {
            persister,
            config,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn persister(&self) -> &DbPersister {
        &self.persister
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Persist a commit event and fan it out.
    pub async fn sequence_commit(&self, evt: CommitEvt) -> PdsResult<i64> {
        self.sequence(SeqEvent::Commit(evt)).await
    }

    /// Persist an identity event and fan it out.
    pub async fn sequence_identity(&self, evt: IdentityEvt) -> PdsResult<i64> {
        self.sequence(SeqEvent::Identity(evt)).await
    }

    /// Persist an account event and fan it out.
    pub async fn sequence_account(&self, evt: AccountEvt) -> PdsResult<i64> {
        self.sequence(SeqEvent::Account(evt)).await
    }

    async fn sequence(&self, event: SeqEvent) -> PdsResult<i64> {
        let message_type = event.message_type();
        let stored = self.persister.persist(event).await?;
        metrics::EVENTS_SEQUENCED
            .with_label_values(&[message_type])
            .inc();

        self.broadcast(Arc::new(stored.clone()));
        Ok(stored.seq)
    }

    /// Register a live subscriber. Events sequenced after this call flow to
    /// the returned channel; dropping the guard (or the receiver) detaches.
    pub fn subscribe(
        self: &Arc<Self>,
        ident: impl Into<String>,
    ) -> (mpsc::Receiver<Arc<PersistedEvent>>, SubscriptionGuard) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ident = ident.into();

        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .insert(id, Subscriber { ident, tx });
        metrics::FIREHOSE_SUBSCRIBERS.inc();

        (
            rx,
            SubscriptionGuard {
                id,
                sequencer: Arc::clone(self),
            },
        )
    }

    fn remove_subscriber(&self, id: u64) {
        let removed = self
            .subscribers
            .lock()
            .expect("subscriber map poisoned")
            .remove(&id);
        if removed.is_some() {
            metrics::FIREHOSE_SUBSCRIBERS.dec();
        }
    }

    fn broadcast(&self, event: Arc<PersistedEvent>) {
        let mut dropped = Vec::new();

        {
            let subscribers = self.subscribers.lock().expect("subscriber map poisoned");
            for (id, sub) in subscribers.iter() {
                match sub.tx.try_send(Arc::clone(&event)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(ident = %sub.ident, "subscriber too slow, dropping");
                        // best effort terminal frame; the channel is full, so
                        // this usually fails and the close does the talking
                        if let Ok(frame) = encode_error_frame(&ErrorFrame {
                            error: "ConsumerTooSlow".to_string(),
                            message: Some("client not keeping up".to_string()),
                        }) {
                            let _ = sub.tx.try_send(Arc::new(PersistedEvent {
                                seq: event.seq,
                                frame,
                            }));
                        }
                        dropped.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dropped.push(*id);
                    }
                }
            }
        }

        for id in dropped {
            self.remove_subscriber(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::sequencer::frames::decode_event_frame;

    async fn test_sequencer() -> Arc<Sequencer> {
        let pool = crate::db::create_test_pool().await.unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let persister = DbPersister::new(Db::new(pool)).await.unwrap();
        Arc::new(Sequencer::new(persister, SequencerConfig::default()))
    }

    fn identity_evt(did: &str) -> IdentityEvt {
        IdentityEvt {
            seq: 0,
            did: did.to_string(),
            handle: None,
            time: String::new(),
        }
    }

    #[tokio::test]
    async fn test_live_subscriber_sees_events_in_order() {
        let sequencer = test_sequencer().await;
        let (mut rx, _guard) = sequencer.subscribe("test-consumer");

        for _ in 0..3 {
            sequencer
                .sequence_identity(identity_evt("did:plc:a"))
                .await
                .unwrap();
        }

        for expected in 1..=3i64 {
            let evt = rx.recv().await.unwrap();
            assert_eq!(evt.seq, expected);
            assert_eq!(decode_event_frame(&evt.frame).unwrap().seq(), expected);
        }
    }

    #[tokio::test]
    async fn test_detached_subscriber_does_not_block_sequencing() {
        let sequencer = test_sequencer().await;
        let (rx, guard) = sequencer.subscribe("goner");
        drop(rx);
        drop(guard);

        let seq = sequencer
            .sequence_identity(identity_evt("did:plc:a"))
            .await
            .unwrap();
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped() {
        let sequencer = test_sequencer().await;
        let (mut rx, _guard) = sequencer.subscribe("slowpoke");

        // never read: fill the channel past capacity
        for _ in 0..(SUBSCRIBER_BUFFER + 10) {
            sequencer
                .sequence_identity(identity_evt("did:plc:a"))
                .await
                .unwrap();
        }

        // drain; the stream must end (channel closed on drop)
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
            assert!(count <= SUBSCRIBER_BUFFER + 1, "channel never closed");
        }
        assert!(count >= SUBSCRIBER_BUFFER);
    }
}
