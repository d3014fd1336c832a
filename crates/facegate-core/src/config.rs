//! Grouped configuration and the default component wiring.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::decision::{DecisionConfig, DecisionEngine};
use crate::detector::{DetectorConfig, FaceDetector, SkinToneDetector};
use crate::error::Result;
use crate::extractor::GradientHistogramExtractor;
use crate::index::{IndexConfig, SimilarityIndex};
use crate::liveness::LivenessScorer;
use crate::matcher::{MatchConfig, MatchingEngine};

/// Every tunable of the core. Missing sections take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub index: IndexConfig,
    pub matching: MatchConfig,
    pub detector: DetectorConfig,
    pub decision: DecisionConfig,
}

impl CoreConfig {
    /// Load the snapshot at `snapshot` if one exists, otherwise start empty.
    pub fn open_matcher(&self, snapshot: Option<&Path>) -> Result<MatchingEngine> {
        match snapshot {
            Some(path) if path.exists() => {
                let matcher =
                    MatchingEngine::load(path, self.index.clone(), self.matching.clone())?;
                tracing::info!(
                    path = %path.display(),
                    identities = matcher.identity_count(),
                    samples = matcher.sample_count(),
                    "index loaded"
                );
                Ok(matcher)
            }
            _ => Ok(MatchingEngine::new(
                SimilarityIndex::new(self.index.clone()),
                self.matching.clone(),
            )),
        }
    }

    /// Wire the gradient-histogram extractor and liveness scorer around `detector`.
    pub fn build_with_detector(
        &self,
        detector: Arc<dyn FaceDetector>,
        matcher: Arc<MatchingEngine>,
    ) -> Result<DecisionEngine> {
        let extractor =
            GradientHistogramExtractor::new(Arc::clone(&detector), self.detector.clone());
        let scorer = LivenessScorer::new(detector, self.detector.clone());
        DecisionEngine::new(
            Arc::new(extractor),
            Arc::new(scorer),
            matcher,
            self.decision.clone(),
        )
    }

    /// [`build_with_detector`](Self::build_with_detector) with a [`SkinToneDetector`].
    pub fn build(&self, matcher: Arc<MatchingEngine>) -> Result<DecisionEngine> {
        self.build_with_detector(Arc::new(SkinToneDetector::default()), matcher)
    }
}
