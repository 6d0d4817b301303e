//! Immutable checkpoint records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::budget::Budget;
use crate::storage::StorageError;

/// What caused a checkpoint to be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTag {
    SessionInit,
    PreModification,
    PostModification,
    SessionClose,
}

impl CheckpointTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionInit => "session_init",
            Self::PreModification => "pre_modification",
            Self::PostModification => "post_modification",
            Self::SessionClose => "session_close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub budget_id: Uuid,
    pub version: u64,
    /// Position in the chain, starting at 0.
    pub sequence: u64,
    pub tag: CheckpointTag,
    pub snapshot: Budget,
    /// Hex SHA-256 of the snapshot's JSON encoding.
    pub digest: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Storage id; zero padding keeps id order equal to chain order.
    pub fn storage_id(budget_id: Uuid, sequence: u64) -> String {
        format!("{}/{:010}", budget_id, sequence)
    }

    pub fn id(&self) -> String {
        Self::storage_id(self.budget_id, self.sequence)
    }

    /// Whether the stored digest still matches the snapshot.
    pub fn verify(&self) -> Result<bool, StorageError> {
        Ok(digest(&self.snapshot)? == self.digest)
    }
}

pub fn digest(budget: &Budget) -> Result<String, StorageError> {
    let bytes = serde_json::to_vec(budget)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
