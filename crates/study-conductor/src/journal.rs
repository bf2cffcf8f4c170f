//! Hash-chained transition journal
//!
//! Every status change is appended with the SHA-256 of the previous entry, so
//! a state file that was edited or truncated in the middle fails
//! [`Journal::verify_integrity`] on resume.

use crate::error::ConductorError;
use crate::lifecycle::InstanceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use study_graph::InstanceId;

const GENESIS: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub tick: u64,
    pub at: DateTime<Utc>,
    pub instance: InstanceId,
    pub from: InstanceStatus,
    pub to: InstanceStatus,
    pub reason: String,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transition, chaining it to the last entry
    pub fn append(
        &mut self,
        tick: u64,
        instance: &InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
        reason: impl Into<String>,
    ) -> &JournalEntry {
        let prev_hash = self
            .entries
            .last()
            .map_or_else(|| GENESIS.to_string(), |e| e.hash.clone());
        let mut entry = JournalEntry {
            seq: self.entries.len() as u64,
            tick,
            at: Utc::now(),
            instance: instance.clone(),
            from,
            to,
            reason: reason.into(),
            prev_hash,
            hash: String::new(),
        };
        entry.hash = compute_hash(&entry);
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    #[must_use]
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries touching one instance, oldest first
    pub fn history<'j>(&'j self, instance: &'j InstanceId) -> impl Iterator<Item = &'j JournalEntry> + 'j {
        self.entries.iter().filter(move |e| &e.instance == instance)
    }

    /// Walk the chain and recompute every hash
    ///
    /// # Errors
    /// [`ConductorError::JournalCorrupted`] naming the first bad entry.
    pub fn verify_integrity(&self) -> Result<(), ConductorError> {
        let mut prev = GENESIS.to_string();
        for (expected_seq, entry) in self.entries.iter().enumerate() {
            if entry.seq != expected_seq as u64
                || entry.prev_hash != prev
                || entry.hash != compute_hash(entry)
            {
                return Err(ConductorError::JournalCorrupted { seq: expected_seq as u64 });
            }
            prev.clone_from(&entry.hash);
        }
        Ok(())
    }
}

fn compute_hash(entry: &JournalEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry.seq.to_le_bytes());
    hasher.update(entry.tick.to_le_bytes());
    hasher.update(entry.at.to_rfc3339().as_bytes());
    hasher.update([0]);
    hasher.update(entry.instance.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(entry.from.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(entry.to.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(entry.reason.as_bytes());
    hasher.update([0]);
    hasher.update(entry.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    fn journal() -> Journal {
        let mut j = Journal::new();
        let a = InstanceId::from("a");
        j.append(0, &a, Pending, Ready, "no dependencies");
        j.append(1, &a, Ready, Submitted, "job 1");
        j.append(2, &a, Submitted, Finished, "completed");
        j
    }

    #[test]
    fn test_chain_verifies() {
        let j = journal();
        assert_eq!(j.len(), 3);
        assert_eq!(j.entries()[0].prev_hash, GENESIS);
        assert_eq!(j.entries()[1].prev_hash, j.entries()[0].hash);
        j.verify_integrity().unwrap();
    }

    #[test]
    fn test_tampered_reason_detected() {
        let mut j = journal();
        j.entries[1].reason = "edited".into();
        assert!(matches!(
            j.verify_integrity(),
            Err(ConductorError::JournalCorrupted { seq: 1 })
        ));
    }

    #[test]
    fn test_dropped_entry_detected() {
        let mut j = journal();
        j.entries.remove(1);
        assert!(matches!(
            j.verify_integrity(),
            Err(ConductorError::JournalCorrupted { seq: 1 })
        ));
    }

    #[test]
    fn test_survives_serialization() {
        let j = journal();
        let text = serde_json::to_string(&j).unwrap();
        let back: Journal = serde_json::from_str(&text).unwrap();
        back.verify_integrity().unwrap();
        assert_eq!(back.history(&InstanceId::from("a")).count(), 3);
    }
}
