//! PromptForge Core - Diagram Prompt Compiler
//!
//! # The Five Laws (Non-Negotiable)
//! 1. File Names Never Reach The Model
//! 2. Logos Are Referenced By Description, Never By Name
//! 3. Composition Is Deterministic
//! 4. Evaluation Decides, Generation Proposes
//! 5. Every Run Leaves A Manifest

pub mod assets;
pub mod composer;
pub mod config;
pub mod controller;
pub mod error;
pub mod evaluation;
pub mod generation;
pub mod hashing;
pub mod output;
pub mod pipeline;
pub mod spec;
pub mod templates;

pub use assets::{AssetCache, AssetCatalog, AssetOptions, AssetRegistry, AssetSummary, ImageFormat, LogoAsset};
pub use composer::{compose, compose_raw, ComposeOptions, PromptBundle, ReferenceImage};
pub use config::AppConfig;
pub use controller::{FeedbackController, RunRecord, RunState, TerminalState};
pub use error::{
    AssetError, ComposeError, ConfigError, GenerationError, OutputError, PipelineError, SpecError,
    TemplateError,
};
pub use evaluation::{
    CandidateEvaluator, FidelityEvaluator, FidelityScore, FidelityViolation, ViolationKind,
    ViolationSeverity,
};
pub use generation::{
    AspectRatio, CancelToken, Candidate, GenerationClient, GenerationParams, Generator,
    HttpImageProvider, ImageProvider,
};
pub use hashing::{canonical_json, compute_input_hash, compute_manifest_hash, sha256_hex};
pub use output::RunStore;
pub use pipeline::{
    validate_logos, GenerateRequest, LogoReport, Pipeline, RawGenerateRequest, RunOutcome,
};
pub use spec::DiagramSpec;
pub use templates::Template;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
