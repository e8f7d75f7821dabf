use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval_at};

use crate::engine::Core;
use crate::entity::{Entity, EntityKey, EntityType};
use crate::error::EngineError;
use crate::remote::wait_for_shutdown;

#[derive(Debug, Default)]
struct Bucket {
    order: VecDeque<String>,
    queued: HashSet<String>,
}

/// Pending mark-read intents, deduplicated per entity type and id and
/// flushed in the order they were first queued.
#[derive(Debug, Default)]
pub struct ReadTracker {
    pending: BTreeMap<EntityType, Bucket>,
}

impl ReadTracker {
    pub fn enqueue(&mut self, key: EntityKey) {
        let bucket = self.pending.entry(key.kind).or_default();
        if bucket.queued.insert(key.id.clone()) {
            bucket.order.push_back(key.id);
        }
    }

    pub fn pop_round(&mut self) -> Vec<EntityKey> {
        let mut popped = Vec::with_capacity(self.pending.len());
        for (kind, bucket) in self.pending.iter_mut() {
            if let Some(id) = bucket.order.pop_front() {
                bucket.queued.remove(&id);
                popped.push(EntityKey::new(*kind, id));
            }
        }
        self.pending.retain(|_, bucket| !bucket.order.is_empty());
        popped
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(|bucket| bucket.order.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Core {
    pub(crate) async fn enqueue_mark(&self, key: EntityKey) {
        if self.marks.send(key).await.is_err() {
            tracing::debug!("mark-read queue closed, dropping intent");
        }
    }

    pub(crate) async fn mark(&self, key: &EntityKey) -> Result<(), EngineError> {
        let target = self.cache.lookup(key);
        if target.is_nil() {
            return Ok(());
        }
        let state = target.read_state().clone();
        if state.latest.is_empty() {
            tracing::debug!(entity = %target.qualified_name(), "nothing to mark");
            return Ok(());
        }
        let result = match self.room_of(&target) {
            Ok((kind, room)) => self
                .api
                .set_read_marker(kind, &room, &state.latest)
                .await
                .map_err(EngineError::from),
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            tracing::warn!(entity = %target.qualified_name(), %error, "mark failed");
            self.out.warn(&error.to_string());
            return Err(error);
        }

        // Messages that arrived while the call was in flight stay unread.
        self.cache.mutate_read_state(key, |current| {
            let arrived = current.unread.saturating_sub(state.unread);
            current.mark_read(state.latest.clone());
            current.unread = arrived;
        });
        tracing::debug!(entity = %target.qualified_name(), at = %state.latest, "marked read");
        Ok(())
    }
}

pub(crate) async fn flush_loop(
    core: Arc<Core>,
    mut intents: mpsc::Receiver<EntityKey>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = core.settings.mark_interval;
    let mut tick = interval_at(tokio::time::Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending = ReadTracker::default();

    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            intent = intents.recv() => match intent {
                Some(key) => pending.enqueue(key),
                None => break,
            },
            _ = tick.tick() => {
                for key in pending.pop_round() {
                    // Failures are reported by `mark` and not retried.
                    let _ = core.mark(&key).await;
                }
            }
        }
    }
    if !pending.is_empty() {
        tracing::debug!(dropped = pending.len(), "mark-read flush stopped with pending intents");
    }
}
