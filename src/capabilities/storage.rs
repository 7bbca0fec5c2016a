use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::OFFLINE_QUEUE_KEY;

const MAX_KEY_LEN: usize = 128;

/// A validated local-storage key. Keys are non-empty, trimmed, and free of
/// control characters so they survive every shell's storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(raw: &str) -> Result<Self, StorageError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StorageError::InvalidKey {
                key: raw.to_string(),
                reason: "key must not be empty".to_string(),
            });
        }
        if trimmed.len() > MAX_KEY_LEN {
            return Err(StorageError::InvalidKey {
                key: raw.to_string(),
                reason: format!("key exceeds {MAX_KEY_LEN} bytes"),
            });
        }
        if trimmed.chars().any(char::is_control) {
            return Err(StorageError::InvalidKey {
                key: raw.to_string(),
                reason: "key must not contain control characters".to_string(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The one key this core owns.
    #[must_use]
    pub fn offline_queue() -> Self {
        Self(OFFLINE_QUEUE_KEY.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageOperation {
    Get { key: StorageKey },
    Set { key: StorageKey, value: String },
}

impl Operation for StorageOperation {
    type Output = StorageResult;
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("storage quota exceeded writing key {key}")]
    QuotaExceeded { key: String },

    #[error("invalid storage key {key}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("storage io error: {message}")]
    Io { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StorageOutput {
    /// `None` when the key has never been written.
    Value(Option<String>),
    Written,
}

pub type StorageResult = Result<StorageOutput, StorageError>;

pub struct Storage<Ev> {
    context: CapabilityContext<StorageOperation, Ev>,
}

impl<Ev> Clone for Storage<Ev> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}

impl<Ev> Capability<Ev> for Storage<Ev> {
    type Operation = StorageOperation;
    type MappedSelf<MappedEv> = Storage<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Storage::new(self.context.map_event(f))
    }
}

impl<Ev> Storage<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<StorageOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn get<F>(&self, key: StorageKey, make_event: F)
    where
        F: FnOnce(StorageResult) -> Ev + Send + 'static,
    {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            let response = ctx.request_from_shell(StorageOperation::Get { key }).await;
            ctx.update_app(make_event(response));
        });
    }

    pub fn set<F>(&self, key: StorageKey, value: String, make_event: F)
    where
        F: FnOnce(StorageResult) -> Ev + Send + 'static,
    {
        let ctx = self.context.clone();
        self.context.spawn(async move {
            let response = ctx
                .request_from_shell(StorageOperation::Set { key, value })
                .await;
            ctx.update_app(make_event(response));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_keys_are_trimmed() {
        let key = StorageKey::new("  offlineQueue  ").unwrap();
        assert_eq!(key.as_str(), "offlineQueue");
    }

    #[test]
    fn empty_and_whitespace_keys_are_rejected() {
        assert!(StorageKey::new("").is_err());
        assert!(StorageKey::new("   ").is_err());
    }

    #[test]
    fn overlong_keys_are_rejected() {
        let long = "k".repeat(MAX_KEY_LEN + 1);
        assert!(StorageKey::new(&long).is_err());
        assert!(StorageKey::new(&"k".repeat(MAX_KEY_LEN)).is_ok());
    }

    #[test]
    fn control_characters_are_rejected() {
        assert!(StorageKey::new("queue\nkey").is_err());
        assert!(StorageKey::new("queue\0key").is_err());
    }

    #[test]
    fn offline_queue_key_matches_constant() {
        assert_eq!(StorageKey::offline_queue().as_str(), OFFLINE_QUEUE_KEY);
        assert_eq!(
            StorageKey::new(OFFLINE_QUEUE_KEY).unwrap(),
            StorageKey::offline_queue()
        );
    }
}
