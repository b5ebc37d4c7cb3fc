//! Purely functional detection utilities consumed by the loop

pub mod bias;
pub mod metacog;
pub mod mismatch;
pub mod triggers;

pub use bias::{
    DetectedPattern, PatternKind, detect_concreteness_bias, detect_confirmation_bias, detect_first_reason_stopping,
    detect_missing_alternatives, detect_overconfidence, detect_palliative_fix, detect_proximity_bias, evidence_block,
    parse_confidence, run_detection_pass,
};
pub use metacog::{
    Fallacy, InferenceChain, InferenceValidity, MetacognitiveCheck, ThinkingMode, ThinkingModeAssessment,
    inference_depth_score, run_metacognitive_check,
};
pub use mismatch::{MismatchReport, detect_claim_result_mismatch};
pub use triggers::{TriggerContext, TriggerDecision, TriggerMode, detect_high_stakes, should_trigger_verification};
