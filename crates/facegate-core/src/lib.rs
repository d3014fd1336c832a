//! Face verification core: embedding extraction, passive liveness scoring,
//! a persisted similarity index and the decision logic that combines them.

pub mod config;
pub mod decision;
pub mod detector;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod frame;
pub mod index;
pub mod liveness;
pub mod matcher;

pub use config::CoreConfig;
pub use decision::{
    with_deadline, AutoEnrollPolicy, DecisionConfig, DecisionEngine, IdentificationDecision,
    VerificationDecision, VerifyOptions,
};
pub use detector::{
    locate_face, DetectorConfig, FaceDetector, FaceRegion, FullFrameDetector, SkinToneDetector,
};
pub use embedding::{Embedding, Metric};
pub use error::{Error, Result};
pub use extractor::{EmbeddingExtractor, GradientHistogramExtractor};
pub use frame::Frame;
pub use index::{IndexConfig, Neighbor, SimilarityIndex, SlotId};
pub use liveness::{LivenessResult, LivenessScorer};
pub use matcher::{Candidate, IdentitySummary, MatchConfig, MatchResult, MatchingEngine};
