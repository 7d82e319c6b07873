//! Generation Client - Narrow Provider Contract
//!
//! One request in, one image or one error out. Transient failures are
//! retried with exponential backoff; a permanent rejection only drops the
//! candidate it belongs to.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

use crate::assets::ImageFormat;
use crate::composer::{PromptBundle, ReferenceImage};
use crate::config::ProviderConfig;
use crate::error::{ConfigError, GenerationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    pub fn ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(':')
            .ok_or_else(|| format!("expected W:H, got '{}'", s))?;
        let width: u32 = w.trim().parse().map_err(|_| format!("invalid width in '{}'", s))?;
        let height: u32 = h.trim().parse().map_err(|_| format!("invalid height in '{}'", s))?;
        if width == 0 || height == 0 {
            return Err(format!("aspect ratio parts must be non-zero, got '{}'", s));
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(value: AspectRatio) -> Self {
        value.to_string()
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub count: usize,
    pub aspect_ratio: AspectRatio,
    pub size: String,
}

/// What a provider sees for one candidate.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    pub prompt: &'a str,
    pub images: &'a [ReferenceImage],
    pub aspect_ratio: AspectRatio,
    pub size: &'a str,
    pub candidate_index: usize,
}

/// Provider metadata, kept opaque apart from the model name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub metadata: ProviderMetadata,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error("invalid response: {0}")]
    Invalid(String),
}

/// The external image-synthesis capability.
pub trait ImageProvider: Send + Sync {
    fn generate_image(&self, request: &ProviderRequest<'_>) -> Result<ProviderImage, ProviderError>;
}

/// One provider output for a prompt bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub index: usize,
    pub bytes: Arc<[u8]>,
    pub mime_type: String,
    pub format: Option<ImageFormat>,
    pub aspect_ratio: AspectRatio,
    pub size: String,
    pub metadata: ProviderMetadata,
}

impl Candidate {
    pub fn extension(&self) -> &str {
        self.format.map(|f| f.extension()).unwrap_or("bin")
    }
}

/// Result of one fan-out. Both lists are ordered by candidate index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationBatch {
    pub candidates: Vec<Candidate>,
    pub failures: Vec<GenerationError>,
}

/// Shared cancellation flag, checked before each request and during backoff.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based): base * 2^(attempt-2), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Seam between the feedback controller and the provider.
pub trait Generator {
    fn generate(
        &self,
        bundle: &PromptBundle,
        params: &GenerationParams,
        cancel: &CancelToken,
    ) -> GenerationBatch;
}

pub struct GenerationClient<P> {
    provider: P,
    retry: RetryPolicy,
}

impl<P: ImageProvider> GenerationClient<P> {
    pub fn new(provider: P, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn request_with_retry(
        &self,
        bundle: &PromptBundle,
        params: &GenerationParams,
        index: usize,
        cancel: &CancelToken,
    ) -> Result<Candidate, GenerationError> {
        let request = ProviderRequest {
            prompt: &bundle.text,
            images: &bundle.images,
            aspect_ratio: params.aspect_ratio,
            size: &params.size,
            candidate_index: index,
        };
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_reason = String::new();
        let mut timed_out = false;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                sleep_unless_cancelled(self.retry.delay_for(attempt), cancel);
                warn!(candidate = index, attempt = attempt, max = max_attempts; "Retrying provider request");
            }
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled { index });
            }

            match self.provider.generate_image(&request) {
                Ok(image) => return to_candidate(image, params, index),
                Err(ProviderError::Transient(reason)) => {
                    debug!(candidate = index, reason = reason.as_str(); "Transient provider failure");
                    last_reason = reason;
                    timed_out = false;
                }
                Err(ProviderError::Timeout(reason)) => {
                    debug!(candidate = index, reason = reason.as_str(); "Provider request timed out");
                    last_reason = reason;
                    timed_out = true;
                }
                Err(ProviderError::Permanent(reason)) => {
                    return Err(GenerationError::Permanent { index, reason });
                }
                Err(ProviderError::Invalid(reason)) => {
                    return Err(GenerationError::InvalidResponse { index, reason });
                }
            }
        }

        if timed_out {
            Err(GenerationError::Timeout { index, attempts: max_attempts, reason: last_reason })
        } else {
            Err(GenerationError::Transient { index, attempts: max_attempts, reason: last_reason })
        }
    }
}

impl<P: ImageProvider> Generator for GenerationClient<P> {
    /// Request `params.count` candidates concurrently.
    fn generate(
        &self,
        bundle: &PromptBundle,
        params: &GenerationParams,
        cancel: &CancelToken,
    ) -> GenerationBatch {
        let results: Vec<Result<Candidate, GenerationError>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..params.count)
                .map(|index| {
                    scope.spawn(move || self.request_with_retry(bundle, params, index, cancel))
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(index, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(GenerationError::InvalidResponse {
                            index,
                            reason: "provider worker panicked".to_string(),
                        })
                    })
                })
                .collect()
        });

        let mut batch = GenerationBatch::default();
        for result in results {
            match result {
                Ok(candidate) => batch.candidates.push(candidate),
                Err(e) => {
                    warn!(candidate = e.index(); "{}", e);
                    batch.failures.push(e);
                }
            }
        }
        batch
    }
}

fn to_candidate(
    image: ProviderImage,
    params: &GenerationParams,
    index: usize,
) -> Result<Candidate, GenerationError> {
    if image.bytes.is_empty() {
        return Err(GenerationError::InvalidResponse {
            index,
            reason: "empty image payload".to_string(),
        });
    }
    let format = ImageFormat::sniff(&image.bytes).or_else(|| ImageFormat::from_mime_type(&image.mime_type));
    Ok(Candidate {
        index,
        bytes: image.bytes.into(),
        mime_type: image.mime_type,
        format,
        aspect_ratio: params.aspect_ratio,
        size: params.size.clone(),
        metadata: image.metadata,
    })
}

fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + total;
    let slice = Duration::from_millis(50);
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(slice));
    }
}

// --- HTTP provider ---

/// JSON-over-HTTP image provider.
#[derive(Clone)]
pub struct HttpImageProvider {
    api_key: String,
    api_url: Url,
    model: Option<String>,
    client: Client,
}

impl fmt::Debug for HttpImageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpImageProvider")
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl HttpImageProvider {
    pub fn new(api_key: String, config: &ProviderConfig) -> Result<Self, ConfigError> {
        let api_url = Url::parse(&config.api_url).map_err(|e| ConfigError::Invalid {
            field: "provider.api_url",
            reason: e.to_string(),
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "provider",
                reason: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self { api_key, api_url, model: config.model.clone(), client })
    }

    /// Read the API key from the environment variable named in the config.
    pub fn from_env(config: &ProviderConfig) -> Result<Self, ConfigError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| ConfigError::Invalid {
            field: "provider.api_key_env",
            reason: format!("{} environment variable not set", config.api_key_env),
        })?;
        Self::new(api_key, config)
    }
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    prompt: &'a str,
    aspect_ratio: String,
    size: &'a str,
    reference_images: Vec<ApiReferenceImage>,
}

/// Reference images are sent by position only; logo names stay local.
#[derive(Debug, Serialize)]
struct ApiReferenceImage {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    images: Vec<ApiImage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    block_reason: Option<String>,
    #[serde(flatten)]
    attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ApiImage {
    data: String,
    #[serde(default = "default_mime_type")]
    mime_type: String,
}

fn default_mime_type() -> String {
    "image/png".to_string()
}

impl ImageProvider for HttpImageProvider {
    fn generate_image(&self, request: &ProviderRequest<'_>) -> Result<ProviderImage, ProviderError> {
        let body = ApiRequest {
            model: self.model.as_deref(),
            prompt: request.prompt,
            aspect_ratio: request.aspect_ratio.to_string(),
            size: request.size,
            reference_images: request
                .images
                .iter()
                .map(|image| ApiReferenceImage {
                    mime_type: image.format.mime_type(),
                    data: STANDARD.encode(&image.bytes),
                })
                .collect(),
        };

        let response = self
            .client
            .post(self.api_url.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(format!("request timed out: {}", e))
                } else {
                    ProviderError::Transient(format!("HTTP request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let api: ApiResponse = response
                .json()
                .map_err(|e| ProviderError::Invalid(format!("failed to parse response: {}", e)))?;
            return parse_image(api);
        }

        if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            Err(ProviderError::Transient(format!("provider returned {}", status.as_u16())))
        } else {
            let text = response.text().unwrap_or_else(|_| "unknown error".to_string());
            Err(ProviderError::Permanent(format!("provider returned {}: {}", status.as_u16(), text)))
        }
    }
}

fn parse_image(api: ApiResponse) -> Result<ProviderImage, ProviderError> {
    if api.blocked {
        return Err(ProviderError::Permanent(
            api.block_reason.unwrap_or_else(|| "blocked by provider".to_string()),
        ));
    }
    let image = api
        .images
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Permanent("provider returned no image".to_string()))?;
    let bytes = STANDARD
        .decode(image.data.as_bytes())
        .map_err(|e| ProviderError::Invalid(format!("image payload is not base64: {}", e)))?;

    Ok(ProviderImage {
        bytes,
        mime_type: image.mime_type,
        metadata: ProviderMetadata { model: api.model, attributes: api.attributes },
    })
}
