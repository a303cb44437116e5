//! State machines driven by the orchestration layer.

pub mod metadata_sm;
