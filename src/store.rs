//! In-memory working copy of the durable offline queue.
//!
//! The store hydrates once from the raw string the shell read out of local
//! storage and from then on is the single source of truth. Corrupt or missing
//! stored data never fails hydration, it just yields an empty queue.

use uuid::Uuid;

use crate::queue::{QueueEntry, QueueError};
use crate::{UnixTimeMs, MAX_QUEUE_ENTRIES};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStore {
    entries: Vec<QueueEntry>,
    hydrated: bool,
}

impl QueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges the stored snapshot under anything enqueued while the read was
    /// in flight. Stored entries are older, so they keep their place at the
    /// front of the line.
    pub fn hydrate(&mut self, raw: Option<&str>) {
        if self.hydrated {
            tracing::warn!("ignoring repeated queue hydration");
            return;
        }
        self.hydrated = true;

        let mut stored = raw.map(Self::decode).unwrap_or_default();
        if !self.entries.is_empty() {
            stored.append(&mut self.entries);
        }
        self.entries = stored;
    }

    fn decode(raw: &str) -> Vec<QueueEntry> {
        match serde_json::from_str(raw) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(%error, "discarding corrupt offline queue");
                Vec::new()
            }
        }
    }

    /// The canonical serialized form written back to storage.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.entries)
    }

    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    #[must_use]
    pub fn entry(&self, id: &Uuid) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.id == *id)
    }

    pub fn entry_mut(&mut self, id: &Uuid) -> Option<&mut QueueEntry> {
        self.entries.iter_mut().find(|e| e.id == *id)
    }

    /// Appends in arrival order. Replay walks the same order, oldest first.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<(), QueueError> {
        if self.entries.len() >= MAX_QUEUE_ENTRIES {
            return Err(QueueError::Full {
                max: MAX_QUEUE_ENTRIES,
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<QueueEntry> {
        let index = self.entries.iter().position(|e| e.id == *id)?;
        Some(self.entries.remove(index))
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.action.is_dispatchable() && !e.is_dead_lettered())
            .count()
    }

    #[must_use]
    pub fn unsupported_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.action.is_dispatchable())
            .count()
    }

    #[must_use]
    pub fn dead_letter_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_dead_lettered()).count()
    }

    /// Ids of entries eligible for delivery right now, oldest first.
    #[must_use]
    pub fn dispatchable_ids(&self, now: UnixTimeMs) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|e| e.is_dispatchable(now))
            .map(|e| e.id)
            .collect()
    }
}
