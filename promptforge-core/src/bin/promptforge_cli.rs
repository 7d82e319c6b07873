//! PromptForge CLI - Diagram generation front end
//!
//! Commands: generate, generate-raw, validate-logos
//! Outputs JSON to stdout, logs to stderr.
//! Exit codes: 0 accepted, 1 exhausted, 2 fatal, 3 invalid invocation

use clap::{Parser, Subcommand};
use log::{debug, error, info, LevelFilter};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use promptforge_core::{
    validate_logos, AppConfig, AspectRatio, FidelityEvaluator, GenerateRequest, GenerationClient,
    HttpImageProvider, Pipeline, PipelineError, RawGenerateRequest, RunOutcome,
};

const EXIT_INVALID_INVOCATION: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "promptforge-cli", version)]
#[command(about = "PromptForge CLI - Diagram Prompt Compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Root directory for run output (overrides the config)
    #[arg(short, long, global = true)]
    output_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a diagram from a spec and a template
    Generate {
        /// Diagram spec (.json, .yaml or .yml)
        #[arg(short, long)]
        spec: PathBuf,

        /// Prompt template file
        #[arg(short, long)]
        template: PathBuf,

        /// Directory of logo images
        #[arg(short, long)]
        logos: PathBuf,

        /// Optional branding text file
        #[arg(short, long)]
        branding: Option<PathBuf>,

        /// Template value as key=value (repeatable)
        #[arg(long = "var", value_parser = parse_key_value)]
        vars: Vec<(String, String)>,

        #[arg(short, long)]
        run_name: String,
    },

    /// Generate from a raw prompt file and explicit logo files
    GenerateRaw {
        /// Raw prompt file
        #[arg(short, long)]
        prompt: PathBuf,

        /// Logo image (repeatable)
        #[arg(long = "logo", required = true)]
        logos: Vec<PathBuf>,

        #[arg(short, long)]
        run_name: String,

        /// Candidates per attempt
        #[arg(long)]
        count: Option<usize>,

        /// Aspect ratio such as 16:9
        #[arg(long)]
        aspect_ratio: Option<AspectRatio>,

        /// Provider size hint such as 2K
        #[arg(long)]
        size: Option<String>,

        /// Disable the evaluate-and-retry loop
        #[arg(long)]
        no_feedback: bool,

        /// Catalog of logo descriptions and aliases
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Optional branding text file
        #[arg(short, long)]
        branding: Option<PathBuf>,
    },

    /// Validate a logo directory and print a summary
    ValidateLogos {
        #[arg(short, long)]
        logos: PathBuf,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    Ok((key.to_string(), value.to_string()))
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { EXIT_INVALID_INVOCATION } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let log_level = LevelFilter::from_str(&cli.log_level).unwrap_or_else(|_| {
        eprintln!("Invalid log level: {}. Using 'warn' instead.", cli.log_level);
        LevelFilter::Warn
    });
    env_logger::Builder::from_env(env_logger::Env::default())
        .filter_level(log_level)
        .init();

    info!(log_level:?; "Starting PromptForge");
    let command = &cli.command;
    debug!(command:?; "Parsed arguments");

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            let mut value = serde_json::json!({
                "success": false,
                "error": e.to_string(),
            });
            // Candidate hashes stay recoverable when only the write failed.
            if let PipelineError::Persist { record, .. } = &e {
                value["run"] = serde_json::to_value(record).unwrap_or_default();
            }
            print_json(&value);
            e.exit_code()
        }
    };
    ExitCode::from(code)
}

fn run(cli: &Cli) -> Result<u8, PipelineError> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.output_dir {
        config.output.dir = dir.clone();
    }

    match &cli.command {
        Commands::ValidateLogos { logos } => {
            let report = validate_logos(logos, &config.asset_options())?;
            print_json(&serde_json::json!({
                "success": true,
                "count": report.count,
                "aggregate_hash": report.aggregate_hash,
                "logos": report.logos,
            }));
            Ok(0)
        }

        Commands::Generate { spec, template, logos, branding, vars, run_name } => {
            let pipeline = build_pipeline(config)?;
            let request = GenerateRequest {
                spec_path: spec.clone(),
                template_path: template.clone(),
                logos_dir: logos.clone(),
                branding_path: branding.clone(),
                values: vars.iter().cloned().collect::<BTreeMap<_, _>>(),
                run_name: run_name.clone(),
            };
            let outcome = pipeline.generate(&request)?;
            Ok(report(&outcome))
        }

        Commands::GenerateRaw {
            prompt,
            logos,
            run_name,
            count,
            aspect_ratio,
            size,
            no_feedback,
            catalog,
            branding,
        } => {
            let pipeline = build_pipeline(config)?;
            let request = RawGenerateRequest {
                prompt_path: prompt.clone(),
                logo_files: logos.clone(),
                catalog_path: catalog.clone(),
                branding_path: branding.clone(),
                run_name: run_name.clone(),
                count: *count,
                aspect_ratio: *aspect_ratio,
                size: size.clone(),
                feedback: !no_feedback,
            };
            let outcome = pipeline.generate_raw(&request)?;
            Ok(report(&outcome))
        }
    }
}

fn build_pipeline(
    config: AppConfig,
) -> Result<Pipeline<GenerationClient<HttpImageProvider>, FidelityEvaluator>, PipelineError> {
    let provider = HttpImageProvider::from_env(&config.provider)
        .map_err(|e| PipelineError::Provider(e.to_string()))?;
    let client = GenerationClient::new(provider, config.retry_policy());
    Ok(Pipeline::new(config, client, FidelityEvaluator::new()))
}

fn report(outcome: &RunOutcome) -> u8 {
    let record = &outcome.record;
    let accepted = record.accepted().map(|c| {
        serde_json::json!({
            "id": c.id,
            "artifact": c.artifact,
            "content_hash": c.content_hash,
        })
    });
    print_json(&serde_json::json!({
        "success": outcome.exit_code() == 0,
        "run_id": record.run_id,
        "run_name": record.run_name,
        "state": record.state.as_str(),
        "attempts": record.attempt_count(),
        "terminal": record.terminal,
        "accepted": accepted,
        "run_dir": outcome.persisted.dir,
        "manifest": outcome.persisted.manifest_path,
        "manifest_hash": outcome.persisted.manifest_hash,
    }));
    outcome.exit_code()
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("failed to render output: {}", e),
    }
}
