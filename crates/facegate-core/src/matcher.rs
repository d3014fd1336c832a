//! 1:1 verification, 1:N identification and enrollment over a [`SimilarityIndex`].
//!
//! The engine keeps its own per-identity sample store next to the index.
//! Lock order is always identity store first, index second; identification
//! touches only the index.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::embedding::Embedding;
use crate::error::{Error, Result};
use crate::index::{IndexConfig, SimilarityIndex, SlotId};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Minimum confidence for a match, in [0, 1].
    pub similarity_threshold: f32,
    /// Refuse to enroll a face whose best match belongs to another identity.
    pub reject_duplicate_faces: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            reject_duplicate_faces: false,
        }
    }
}

/// Outcome of a 1:1 verification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    pub confidence: f32,
    pub identity_existed: bool,
    /// Slot inserted by the auto-enrollment path, if taken.
    pub enrolled_slot: Option<SlotId>,
}

/// One identification hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub identity: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub identity: String,
    pub samples: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct IdentityRecord {
    samples: Vec<(SlotId, Embedding)>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct MatchingEngine {
    index: SimilarityIndex,
    records: RwLock<HashMap<String, IdentityRecord>>,
    config: MatchConfig,
}

impl MatchingEngine {
    /// Take ownership of `index`, rebuilding identity records from its live slots.
    pub fn new(index: SimilarityIndex, config: MatchConfig) -> Self {
        let now = Utc::now();
        let mut records: HashMap<String, IdentityRecord> = HashMap::new();
        for (slot, identity, embedding) in index.entries() {
            records
                .entry(identity)
                .or_insert_with(|| IdentityRecord {
                    samples: Vec::new(),
                    created_at: now,
                    updated_at: now,
                })
                .samples
                .push((slot, embedding));
        }
        Self {
            index,
            records: RwLock::new(records),
            config,
        }
    }

    /// Load an index snapshot and build an engine over it.
    pub fn load(path: &Path, index_config: IndexConfig, config: MatchConfig) -> Result<Self> {
        Ok(Self::new(SimilarityIndex::load(path, index_config)?, config))
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }

    pub fn verify(&self, claimed: &str, embedding: &Embedding) -> Result<MatchResult> {
        self.verify_with_threshold(claimed, embedding, self.config.similarity_threshold)
    }

    /// Verify `embedding` against `claimed`. An identity with no samples is
    /// enrolled with this embedding and reported as a full-confidence match.
    pub fn verify_with_threshold(
        &self,
        claimed: &str,
        embedding: &Embedding,
        threshold: f32,
    ) -> Result<MatchResult> {
        self.index.check_embedding(embedding)?;

        if let Some(result) = self
            .records
            .read()
            .get(claimed)
            .map(|record| self.score(record, embedding, threshold))
        {
            return Ok(result);
        }

        let mut records = self.records.write();
        // Another caller may have enrolled it between the two locks.
        if let Some(record) = records.get(claimed) {
            return Ok(self.score(record, embedding, threshold));
        }
        let slot = self.insert_locked(&mut records, claimed, embedding, threshold)?;
        tracing::info!(identity = claimed, slot = slot.get(), "auto-enrolled unknown identity");

        Ok(MatchResult {
            matched: true,
            confidence: 1.0,
            identity_existed: false,
            enrolled_slot: Some(slot),
        })
    }

    /// Nearest-of-set: the closest enrolled sample decides.
    fn score(&self, record: &IdentityRecord, embedding: &Embedding, threshold: f32) -> MatchResult {
        let metric = self.index.metric();
        let nearest = record
            .samples
            .iter()
            .map(|(_, sample)| metric.distance(sample.values(), embedding.values()))
            .fold(f32::INFINITY, f32::min);
        let confidence = metric.confidence(nearest);
        MatchResult {
            matched: confidence >= threshold,
            confidence,
            identity_existed: true,
            enrolled_slot: None,
        }
    }

    pub fn identify(&self, embedding: &Embedding, k: usize) -> Result<Vec<Candidate>> {
        self.identify_with_threshold(embedding, k, self.config.similarity_threshold)
    }

    /// Best `k` identities at or above `threshold`, most confident first.
    /// An empty result means no enrolled identity matched.
    pub fn identify_with_threshold(
        &self,
        embedding: &Embedding,
        k: usize,
        threshold: f32,
    ) -> Result<Vec<Candidate>> {
        let metric = self.index.metric();
        let candidates: Vec<Candidate> = self
            .index
            .search_identities(embedding, k)?
            .into_iter()
            .map(|hit| Candidate {
                identity: hit.identity,
                confidence: metric.confidence(hit.distance),
            })
            .filter(|c| c.confidence >= threshold)
            .collect();
        tracing::debug!(k, found = candidates.len(), "identify");
        Ok(candidates)
    }

    /// Add a sample for `identity`, creating the identity if needed.
    pub fn enroll(&self, identity: &str, embedding: &Embedding) -> Result<SlotId> {
        self.index.check_embedding(embedding)?;
        let mut records = self.records.write();
        let threshold = self.config.similarity_threshold;
        let slot = self.insert_locked(&mut records, identity, embedding, threshold)?;
        tracing::info!(identity, slot = slot.get(), "sample enrolled");
        Ok(slot)
    }

    fn insert_locked(
        &self,
        records: &mut HashMap<String, IdentityRecord>,
        identity: &str,
        embedding: &Embedding,
        threshold: f32,
    ) -> Result<SlotId> {
        if self.config.reject_duplicate_faces {
            if let Some(best) = self.index.search_identities(embedding, 1)?.into_iter().next() {
                let confidence = self.index.metric().confidence(best.distance);
                if best.identity != identity && confidence >= threshold {
                    tracing::warn!(
                        identity,
                        existing = %best.identity,
                        confidence,
                        "enrollment rejected: face already enrolled"
                    );
                    return Err(Error::DuplicateFace {
                        existing: best.identity,
                    });
                }
            }
        }

        let slot = self.index.insert(embedding.clone(), identity)?;
        let now = Utc::now();
        let record = records
            .entry(identity.to_string())
            .or_insert_with(|| IdentityRecord {
                samples: Vec::new(),
                created_at: now,
                updated_at: now,
            });
        record.samples.push((slot, embedding.clone()));
        record.updated_at = now;
        Ok(slot)
    }

    /// Remove one sample. An identity left without samples returns to unknown.
    pub fn discard_sample(&self, identity: &str, slot: SlotId) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(identity) else {
            return false;
        };
        let before = record.samples.len();
        record.samples.retain(|(s, _)| *s != slot);
        if record.samples.len() == before {
            return false;
        }
        record.updated_at = Utc::now();
        if record.samples.is_empty() {
            records.remove(identity);
        }
        self.index.remove_slot(slot);
        tracing::info!(identity, slot = slot.get(), "sample discarded");
        true
    }

    pub fn remove_identity(&self, identity: &str) -> bool {
        let mut records = self.records.write();
        if records.remove(identity).is_none() {
            return false;
        }
        self.index.remove_identity(identity);
        true
    }

    pub fn rebuild(&self) -> usize {
        self.index.rebuild()
    }

    pub fn snapshot(&self, path: &Path) -> Result<()> {
        self.index.snapshot(path)
    }

    pub fn identity(&self, identity: &str) -> Option<IdentitySummary> {
        self.records.read().get(identity).map(|r| IdentitySummary {
            identity: identity.to_string(),
            samples: r.samples.len(),
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }

    pub fn identity_count(&self) -> usize {
        self.records.read().len()
    }

    pub fn sample_count(&self) -> usize {
        self.index.len()
    }
}
