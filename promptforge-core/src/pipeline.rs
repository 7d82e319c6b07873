//! Generation Pipeline - Single Entry Point
//!
//! CRITICAL: every run goes load -> drive -> persist. A run record is
//! written for every terminal state, FATAL included.

use log::{error, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::assets::{AssetCache, AssetCatalog, AssetOptions, AssetRegistry, AssetSummary};
use crate::composer::ComposeOptions;
use crate::config::AppConfig;
use crate::controller::{ControllerOptions, FeedbackController, RunRecord, RunState};
use crate::error::{OutputError, PipelineError};
use crate::evaluation::CandidateEvaluator;
use crate::generation::{AspectRatio, CancelToken, GenerationParams, Generator};
use crate::output::{validate_run_name, PersistedRun, RunStore};
use crate::spec::DiagramSpec;
use crate::templates::Template;

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub spec_path: PathBuf,
    pub template_path: PathBuf,
    pub logos_dir: PathBuf,
    pub branding_path: Option<PathBuf>,
    /// Values for non-reserved template placeholders.
    pub values: BTreeMap<String, String>,
    pub run_name: String,
}

#[derive(Debug, Clone)]
pub struct RawGenerateRequest {
    pub prompt_path: PathBuf,
    pub logo_files: Vec<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub branding_path: Option<PathBuf>,
    pub run_name: String,
    pub count: Option<usize>,
    pub aspect_ratio: Option<AspectRatio>,
    pub size: Option<String>,
    /// When false the run gets exactly one attempt.
    pub feedback: bool,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub record: RunRecord,
    pub persisted: PersistedRun,
}

impl RunOutcome {
    pub fn state(&self) -> RunState {
        self.record.state
    }

    pub fn exit_code(&self) -> u8 {
        self.record.state.exit_code()
    }
}

/// The generation pipeline - single entry point for all runs
pub struct Pipeline<G, E> {
    config: AppConfig,
    cache: AssetCache,
    store: RunStore,
    generator: G,
    evaluator: E,
    cancel: CancelToken,
}

impl<G: Generator, E: CandidateEvaluator> Pipeline<G, E> {
    pub fn new(config: AppConfig, generator: G, evaluator: E) -> Self {
        let cache = AssetCache::new(config.asset_options());
        let store = RunStore::new(config.output.dir.clone());
        Self { config, cache, store, generator, evaluator, cancel: CancelToken::new() }
    }

    pub fn with_store(mut self, store: RunStore) -> Self {
        self.store = store;
        self
    }

    /// Token that aborts in-flight runs when cancelled.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Run the feedback loop for a diagram spec.
    pub fn generate(&self, request: &GenerateRequest) -> Result<RunOutcome, PipelineError> {
        validate_run_name(&request.run_name)?;
        require_file(&request.spec_path, "spec")?;
        require_file(&request.template_path, "template")?;
        if !request.logos_dir.is_dir() {
            return Err(PipelineError::InvalidInput(format!(
                "logo directory {} does not exist",
                request.logos_dir.display()
            )));
        }

        let spec = DiagramSpec::load(&request.spec_path)?;
        let template = Template::load(&request.template_path)?;
        let registry = self.cache.load(&request.logos_dir)?;
        let branding = read_optional(request.branding_path.as_deref(), "branding")?;

        info!(
            run = request.run_name.as_str(),
            spec = spec.name(),
            logos = registry.len();
            "Inputs loaded"
        );

        let options = ControllerOptions {
            max_attempts: self.config.generation.max_attempts,
            params: self.config.generation_params()?,
            compose: ComposeOptions { values: request.values.clone(), branding, leak_guard: 0 },
            strengthen_on_retry: self.config.generation.strengthen_on_retry,
            raw: false,
        };
        self.run(&request.run_name, &spec, &template, &registry, &options)
    }

    /// Run from a raw prompt file and an explicit list of logos.
    pub fn generate_raw(&self, request: &RawGenerateRequest) -> Result<RunOutcome, PipelineError> {
        validate_run_name(&request.run_name)?;
        require_file(&request.prompt_path, "prompt")?;
        if request.logo_files.is_empty() {
            return Err(PipelineError::InvalidInput("at least one logo is required".to_string()));
        }

        let template = Template::load(&request.prompt_path)?;
        let catalog = match &request.catalog_path {
            Some(path) => {
                require_file(path, "catalog")?;
                AssetCatalog::load(path)?
            }
            None => AssetCatalog::default(),
        };
        let registry =
            AssetRegistry::from_files(&request.logo_files, &catalog, &self.config.asset_options())?;
        let branding = read_optional(request.branding_path.as_deref(), "branding")?;

        let defaults = self.config.generation_params()?;
        let params = GenerationParams {
            count: request.count.unwrap_or(defaults.count).max(1),
            aspect_ratio: request.aspect_ratio.unwrap_or(defaults.aspect_ratio),
            size: request.size.clone().unwrap_or(defaults.size),
        };
        let options = ControllerOptions {
            max_attempts: if request.feedback { self.config.generation.max_attempts } else { 1 },
            params,
            compose: ComposeOptions { values: BTreeMap::new(), branding, leak_guard: 0 },
            strengthen_on_retry: request.feedback && self.config.generation.strengthen_on_retry,
            raw: true,
        };

        let spec = DiagramSpec::empty(&request.run_name);
        self.run(&request.run_name, &spec, &template, &registry, &options)
    }

    fn run(
        &self,
        run_name: &str,
        spec: &DiagramSpec,
        template: &Template,
        registry: &AssetRegistry,
        options: &ControllerOptions,
    ) -> Result<RunOutcome, PipelineError> {
        if self.store.run_dir(run_name)?.exists() {
            return Err(OutputError::RunExists(run_name.to_string()).into());
        }
        let controller = FeedbackController::new(&self.generator, &self.evaluator)
            .with_cancel(self.cancel.clone());
        let mut record = controller.drive(run_name, spec, template, registry, options);
        let persisted = match self.store.persist(&mut record, registry) {
            Ok(persisted) => persisted,
            Err(source) => {
                error!(
                    run = run_name,
                    state = record.state.as_str(),
                    reason = source.to_string();
                    "Run output could not be written"
                );
                for candidate in record.attempts.iter().flat_map(|a| a.candidates.iter()) {
                    error!(
                        candidate = candidate.id.as_str(),
                        content_hash = candidate.content_hash.as_str(),
                        accepted = candidate.accepted;
                        "Unpersisted candidate"
                    );
                }
                return Err(PipelineError::Persist { record: Box::new(record), source });
            }
        };

        info!(
            run = run_name,
            state = record.state.as_str(),
            attempts = record.attempt_count();
            "Run finished"
        );
        Ok(RunOutcome { record, persisted })
    }
}

/// What `validate-logos` reports. Logical names only.
#[derive(Debug, Clone, Serialize)]
pub struct LogoReport {
    pub count: usize,
    pub aggregate_hash: String,
    pub logos: Vec<AssetSummary>,
}

/// Validate a logo directory without generating anything. Needs no provider.
pub fn validate_logos(dir: &Path, options: &AssetOptions) -> Result<LogoReport, PipelineError> {
    if !dir.is_dir() {
        return Err(PipelineError::InvalidInput(format!(
            "logo directory {} does not exist",
            dir.display()
        )));
    }
    let registry = AssetRegistry::load_dir(dir, options)?;
    info!(count = registry.len(); "Logo directory validated");
    Ok(LogoReport {
        count: registry.len(),
        aggregate_hash: registry.aggregate_hash().to_string(),
        logos: registry.summaries(),
    })
}

fn require_file(path: &Path, what: &str) -> Result<(), PipelineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PipelineError::InvalidInput(format!("{} file {} does not exist", what, path.display())))
    }
}

fn read_optional(path: Option<&Path>, what: &str) -> Result<Option<String>, PipelineError> {
    let Some(path) = path else {
        return Ok(None);
    };
    require_file(path, what)?;
    fs::read_to_string(path)
        .map(|text| Some(text.trim_end().to_string()))
        .map_err(|e| PipelineError::InvalidInput(format!("cannot read {} file: {}", what, e)))
}
