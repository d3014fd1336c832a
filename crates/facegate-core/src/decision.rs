//! Verification and identification decisions: match AND live.
//!
//! Every request extracts the embedding first, so a frame without a single
//! face never reaches the liveness scorer or the index. Liveness scoring and
//! matching then run side by side on the blocking pool. Work handed to the
//! pool finishes even if the awaiting future is dropped, so an index
//! mutation that has started always completes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::embedding::Embedding;
use crate::error::{Error, Result};
use crate::extractor::EmbeddingExtractor;
use crate::frame::Frame;
use crate::index::SlotId;
use crate::liveness::{LivenessResult, LivenessScorer, DEFAULT_LIVENESS_THRESHOLD};
use crate::matcher::{Candidate, MatchResult, MatchingEngine};

/// What happens to an auto-enrolled sample when the same request fails liveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoEnrollPolicy {
    /// The sample stays enrolled.
    #[default]
    Keep,
    /// The sample is discarded and the identity returns to unknown.
    RollbackOnSpoof,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub liveness_threshold: f32,
    pub auto_enroll_policy: AutoEnrollPolicy,
    /// Store the embedding as another sample after a verified match of a known identity.
    pub append_on_verified: bool,
    /// Frames with a longer side are downscaled before any processing.
    pub max_image_size: u32,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            liveness_threshold: DEFAULT_LIVENESS_THRESHOLD,
            auto_enroll_policy: AutoEnrollPolicy::Keep,
            append_on_verified: false,
            max_image_size: 2048,
        }
    }
}

/// Per-call threshold overrides. `None` falls back to the configured value.
#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyOptions {
    pub liveness_threshold: Option<f32>,
    pub similarity_threshold: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationDecision {
    pub verified: bool,
    pub matched: bool,
    pub confidence: f32,
    pub liveness_passed: bool,
    pub auto_enrolled: bool,
    pub identity_existed_before: bool,
    pub auto_enroll_rolled_back: bool,
    pub liveness: LivenessResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentificationDecision {
    /// Most confident first. Empty when nobody matched.
    pub candidates: Vec<Candidate>,
    pub liveness_passed: bool,
    pub liveness: LivenessResult,
}

/// Run `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Fail with `DeadlineExceeded` if `fut` has not resolved within `limit`.
pub async fn with_deadline<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(?limit, "deadline exceeded");
            Err(Error::DeadlineExceeded(limit))
        }
    }
}

pub struct DecisionEngine {
    extractor: Arc<dyn EmbeddingExtractor>,
    scorer: Arc<LivenessScorer>,
    matcher: Arc<MatchingEngine>,
    config: DecisionConfig,
}

impl DecisionEngine {
    /// Fails with `DimensionMismatch` if the extractor and the index disagree.
    pub fn new(
        extractor: Arc<dyn EmbeddingExtractor>,
        scorer: Arc<LivenessScorer>,
        matcher: Arc<MatchingEngine>,
        config: DecisionConfig,
    ) -> Result<Self> {
        let expected = matcher.index().dimension();
        if extractor.dimension() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: extractor.dimension(),
            });
        }
        Ok(Self {
            extractor,
            scorer,
            matcher,
            config,
        })
    }

    pub fn matcher(&self) -> &Arc<MatchingEngine> {
        &self.matcher
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Downscale and embed. Errors here end the request.
    async fn prepare(&self, frame: Frame) -> Result<(Arc<Frame>, Embedding)> {
        let extractor = Arc::clone(&self.extractor);
        let max_side = self.config.max_image_size;
        blocking(move || {
            let frame = frame.limit_size(max_side);
            let embedding = extractor.extract(&frame)?;
            Ok((Arc::new(frame), embedding))
        })
        .await
    }

    async fn score(&self, frame: Arc<Frame>) -> Result<LivenessResult> {
        let scorer = Arc::clone(&self.scorer);
        blocking(move || scorer.score(&frame)).await
    }

    pub async fn verify_and_check_liveness(
        &self,
        claimed: &str,
        frame: Frame,
    ) -> Result<VerificationDecision> {
        self.verify_with(claimed, frame, VerifyOptions::default()).await
    }

    pub async fn verify_with(
        &self,
        claimed: &str,
        frame: Frame,
        options: VerifyOptions,
    ) -> Result<VerificationDecision> {
        let liveness_threshold = options
            .liveness_threshold
            .unwrap_or(self.config.liveness_threshold);
        let similarity_threshold = options
            .similarity_threshold
            .unwrap_or(self.matcher.config().similarity_threshold);

        let (frame, embedding) = self.prepare(frame).await?;

        let matching = {
            let matcher = Arc::clone(&self.matcher);
            let claimed = claimed.to_string();
            let embedding = embedding.clone();
            blocking(move || {
                matcher.verify_with_threshold(&claimed, &embedding, similarity_threshold)
            })
        };
        let (liveness, matched) = tokio::join!(self.score(frame), matching);
        let matched: MatchResult = matched?;

        let liveness = match liveness {
            Ok(liveness) => liveness,
            Err(err) => {
                self.after_liveness_failure(claimed, &matched).await?;
                return Err(err);
            }
        };
        let liveness_passed = liveness.is_live(liveness_threshold);
        let auto_enroll_rolled_back = if liveness_passed {
            false
        } else {
            self.after_liveness_failure(claimed, &matched).await?
        };

        let verified = matched.matched && liveness_passed;
        if verified && matched.identity_existed && self.config.append_on_verified {
            self.append_sample(claimed, embedding).await?;
        }

        let decision = VerificationDecision {
            verified,
            matched: matched.matched,
            confidence: matched.confidence,
            liveness_passed,
            auto_enrolled: matched.enrolled_slot.is_some() && !auto_enroll_rolled_back,
            identity_existed_before: matched.identity_existed,
            auto_enroll_rolled_back,
            liveness,
        };
        tracing::info!(
            identity = claimed,
            verified,
            matched = decision.matched,
            confidence = decision.confidence,
            liveness = liveness.overall,
            auto_enrolled = decision.auto_enrolled,
            "verification decided"
        );
        Ok(decision)
    }

    /// Apply the auto-enroll policy. Returns whether a sample was rolled back.
    async fn after_liveness_failure(&self, claimed: &str, matched: &MatchResult) -> Result<bool> {
        let Some(slot) = matched.enrolled_slot else {
            return Ok(false);
        };
        if self.config.auto_enroll_policy != AutoEnrollPolicy::RollbackOnSpoof {
            return Ok(false);
        }
        let matcher = Arc::clone(&self.matcher);
        let identity = claimed.to_string();
        let discarded = blocking(move || Ok(matcher.discard_sample(&identity, slot))).await?;
        if discarded {
            tracing::warn!(
                identity = claimed,
                slot = slot.get(),
                "liveness failed, auto-enrollment rolled back"
            );
        }
        Ok(discarded)
    }

    async fn append_sample(&self, claimed: &str, embedding: Embedding) -> Result<()> {
        let matcher = Arc::clone(&self.matcher);
        let identity = claimed.to_string();
        match blocking(move || matcher.enroll(&identity, &embedding)).await {
            Ok(_) => Ok(()),
            // The match already stands; a refused extra sample does not undo it.
            Err(Error::DuplicateFace { existing }) => {
                tracing::warn!(identity = claimed, %existing, "verified sample not appended");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Best `k` identities for the face in `frame`, with its liveness verdict.
    pub async fn identify(
        &self,
        frame: Frame,
        k: usize,
        options: VerifyOptions,
    ) -> Result<IdentificationDecision> {
        let liveness_threshold = options
            .liveness_threshold
            .unwrap_or(self.config.liveness_threshold);
        let similarity_threshold = options
            .similarity_threshold
            .unwrap_or(self.matcher.config().similarity_threshold);

        let (frame, embedding) = self.prepare(frame).await?;
        let search = {
            let matcher = Arc::clone(&self.matcher);
            blocking(move || matcher.identify_with_threshold(&embedding, k, similarity_threshold))
        };
        let (liveness, candidates) = tokio::join!(self.score(frame), search);
        let liveness = liveness?;
        let candidates = candidates?;

        tracing::info!(
            k,
            found = candidates.len(),
            best = candidates.first().map(|c| c.identity.as_str()),
            liveness = liveness.overall,
            "identification decided"
        );
        Ok(IdentificationDecision {
            candidates,
            liveness_passed: liveness.is_live(liveness_threshold),
            liveness,
        })
    }

    /// Explicitly enroll the face in `frame` under `identity`. No liveness gate.
    pub async fn enroll(&self, identity: &str, frame: Frame) -> Result<SlotId> {
        let (_, embedding) = self.prepare(frame).await?;
        let matcher = Arc::clone(&self.matcher);
        let identity = identity.to_string();
        blocking(move || matcher.enroll(&identity, &embedding)).await
    }

    /// Liveness only, for callers that do not match.
    pub async fn liveness(&self, frame: Frame) -> Result<LivenessResult> {
        let max_side = self.config.max_image_size;
        let scorer = Arc::clone(&self.scorer);
        blocking(move || scorer.score(&frame.limit_size(max_side))).await
    }
}
