//! Fidelity Evaluation - Checks Produce Typed Violations
//!
//! Checks produce structured violations.
//! The controller decides what to do with them.
//!
//! How a check "sees" the image is delegated to an oracle. The default
//! oracle reads provider metadata; OCR, a vision model or a human reviewer
//! can be plugged in instead.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::thread;

use crate::assets::{image_dimensions, AssetRegistry};
use crate::generation::Candidate;
use crate::spec::{DiagramSpec, Layout};

pub const DEFAULT_ASPECT_TOLERANCE: f64 = 0.02;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    FilenameLeak,
    LogoMissing,
    LogoMisused,
    LayoutViolation,
    /// The evaluator itself failed; the candidate was never judged.
    EvaluationFailed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FidelityViolation {
    pub kind: ViolationKind,
    pub severity: ViolationSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    /// Logical logo name, never a file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default)]
    pub remediation: Vec<String>,
}

impl FidelityViolation {
    fn new(kind: ViolationKind, severity: ViolationSeverity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            component_id: None,
            asset: None,
            expected: None,
            actual: None,
            remediation: vec![],
        }
    }
}

/// The violation set for one candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FidelityScore {
    pub violations: Vec<FidelityViolation>,
}

impl FidelityScore {
    pub fn clean() -> Self {
        Self::default()
    }

    /// Clean means no violations of any severity. Warnings still block
    /// acceptance; severity only orders candidates in `rank`.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Error)
            .count()
    }

    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    /// Lower is better.
    pub fn rank(&self) -> (usize, usize) {
        (self.error_count(), self.violations.len())
    }
}

// --- Oracles ---

/// Text visible in a candidate. `None` means "cannot tell".
pub trait TextOracle: Send + Sync {
    fn visible_text(&self, candidate: &Candidate) -> Option<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedLogo {
    pub logo: String,
    #[serde(default)]
    pub component_id: Option<String>,
}

pub trait LogoOracle: Send + Sync {
    fn detect_logos(&self, candidate: &Candidate) -> Option<Vec<DetectedLogo>>;
}

pub trait LayoutOracle: Send + Sync {
    fn observed_layout(&self, candidate: &Candidate) -> Option<Layout>;
}

/// Reads `rendered_text`, `detected_logos` and `layout` from provider metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataOracle;

impl TextOracle for MetadataOracle {
    fn visible_text(&self, candidate: &Candidate) -> Option<Vec<String>> {
        match candidate.metadata.attributes.get("rendered_text")? {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl LogoOracle for MetadataOracle {
    fn detect_logos(&self, candidate: &Candidate) -> Option<Vec<DetectedLogo>> {
        let value = candidate.metadata.attributes.get("detected_logos")?;
        serde_json::from_value(value.clone()).ok()
    }
}

impl LayoutOracle for MetadataOracle {
    fn observed_layout(&self, candidate: &Candidate) -> Option<Layout> {
        let value = candidate.metadata.attributes.get("layout")?;
        serde_json::from_value(value.clone()).ok()
    }
}

// --- Checks ---

pub trait FidelityCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(
        &self,
        candidate: &Candidate,
        spec: &DiagramSpec,
        registry: &AssetRegistry,
    ) -> Vec<FidelityViolation>;
}

const IMAGE_EXTENSIONS: [&str; 3] = [".png", ".jpg", ".jpeg"];

pub struct FilenameLeakCheck {
    oracle: Arc<dyn TextOracle>,
}

impl FilenameLeakCheck {
    pub fn new(oracle: Arc<dyn TextOracle>) -> Self {
        Self { oracle }
    }
}

impl FidelityCheck for FilenameLeakCheck {
    fn name(&self) -> &'static str {
        "filename_leak"
    }

    fn check(
        &self,
        candidate: &Candidate,
        _spec: &DiagramSpec,
        registry: &AssetRegistry,
    ) -> Vec<FidelityViolation> {
        let Some(lines) = self.oracle.visible_text(candidate) else {
            return vec![];
        };
        let text = lines.join("\n");

        let mut violations: Vec<_> = registry
            .scan_for_leaks(&text)
            .into_iter()
            .map(|asset| {
                let mut v = FidelityViolation::new(
                    ViolationKind::FilenameLeak,
                    ViolationSeverity::Error,
                    format!("File name of logo '{}' is visible in the image", asset),
                );
                v.asset = Some(asset);
                v.remediation = vec!["Reinforce the instruction against rendering file names".to_string()];
                v
            })
            .collect();

        if violations.is_empty() {
            let lower = text.to_lowercase();
            if let Some(ext) = IMAGE_EXTENSIONS.iter().find(|ext| lower.contains(*ext)) {
                let mut v = FidelityViolation::new(
                    ViolationKind::FilenameLeak,
                    ViolationSeverity::Error,
                    "Image file name text is visible in the image",
                );
                v.actual = Some(format!("text containing '{}'", ext));
                v.remediation = vec!["Reinforce the instruction against rendering file names".to_string()];
                violations.push(v);
            }
        }
        violations
    }
}

/// Covers both LOGO_MISSING and LOGO_MISUSED.
pub struct LogoPresenceCheck {
    oracle: Arc<dyn LogoOracle>,
}

impl LogoPresenceCheck {
    pub fn new(oracle: Arc<dyn LogoOracle>) -> Self {
        Self { oracle }
    }
}

impl FidelityCheck for LogoPresenceCheck {
    fn name(&self) -> &'static str {
        "logo_presence"
    }

    fn check(
        &self,
        candidate: &Candidate,
        spec: &DiagramSpec,
        _registry: &AssetRegistry,
    ) -> Vec<FidelityViolation> {
        let Some(detected) = self.oracle.detect_logos(candidate) else {
            return vec![];
        };
        let mut violations = vec![];

        for (component, logo) in spec.logo_components() {
            let present = detected.iter().any(|d| {
                d.logo == logo && d.component_id.as_deref().map_or(true, |id| id == component.id)
            });
            if !present {
                let mut v = FidelityViolation::new(
                    ViolationKind::LogoMissing,
                    ViolationSeverity::Error,
                    format!("Logo for '{}' is missing", component.label),
                );
                v.component_id = Some(component.id.clone());
                v.asset = Some(logo.to_string());
                v.remediation = vec!["Make the logo requirement for this component more explicit".to_string()];
                violations.push(v);
            }
        }

        for d in &detected {
            match d.component_id.as_deref() {
                Some(id) => {
                    let expected = spec.component(id).and_then(|c| c.logo_name.as_deref());
                    if expected != Some(d.logo.as_str()) {
                        let mut v = FidelityViolation::new(
                            ViolationKind::LogoMisused,
                            ViolationSeverity::Error,
                            format!("Wrong logo attached to component '{}'", id),
                        );
                        v.component_id = Some(id.to_string());
                        v.asset = Some(d.logo.clone());
                        v.expected = Some(expected.unwrap_or("no logo").to_string());
                        v.actual = Some(d.logo.clone());
                        violations.push(v);
                    }
                }
                None => {
                    let used = spec.logo_components().any(|(_, logo)| logo == d.logo);
                    if !used {
                        let mut v = FidelityViolation::new(
                            ViolationKind::LogoMisused,
                            ViolationSeverity::Warning,
                            format!("Logo '{}' appears but no component uses it", d.logo),
                        );
                        v.asset = Some(d.logo.clone());
                        violations.push(v);
                    }
                }
            }
        }
        violations
    }
}

pub struct LayoutCheck {
    oracle: Arc<dyn LayoutOracle>,
    tolerance: f64,
}

impl LayoutCheck {
    pub fn new(oracle: Arc<dyn LayoutOracle>, tolerance: f64) -> Self {
        Self { oracle, tolerance }
    }
}

impl FidelityCheck for LayoutCheck {
    fn name(&self) -> &'static str {
        "layout"
    }

    fn check(
        &self,
        candidate: &Candidate,
        spec: &DiagramSpec,
        _registry: &AssetRegistry,
    ) -> Vec<FidelityViolation> {
        let mut violations = vec![];

        if let Some((width, height)) = image_dimensions(&candidate.bytes).filter(|(w, h)| *w > 0 && *h > 0) {
            let expected = candidate.aspect_ratio.ratio();
            let actual = width as f64 / height as f64;
            if ((actual - expected) / expected).abs() > self.tolerance {
                let mut v = FidelityViolation::new(
                    ViolationKind::LayoutViolation,
                    ViolationSeverity::Error,
                    "Aspect ratio mismatch",
                );
                v.expected = Some(candidate.aspect_ratio.to_string());
                v.actual = Some(format!("{}x{} ({:.3})", width, height, actual));
                v.remediation = vec!["Request the declared aspect ratio explicitly".to_string()];
                violations.push(v);
            }
        }

        // A spec without components declares no layout of its own.
        if !spec.components().is_empty() {
            if let Some(observed) = self.oracle.observed_layout(candidate) {
                let declared = spec.constraints().layout;
                if observed != declared {
                    let mut v = FidelityViolation::new(
                        ViolationKind::LayoutViolation,
                        ViolationSeverity::Error,
                        "Declared layout not honored",
                    );
                    v.expected = Some(declared.as_str().to_string());
                    v.actual = Some(observed.as_str().to_string());
                    violations.push(v);
                }
            }
        }
        violations
    }
}

/// Seam between the feedback controller and candidate scoring.
pub trait CandidateEvaluator: Sync {
    fn evaluate(&self, candidate: &Candidate, spec: &DiagramSpec, registry: &AssetRegistry) -> FidelityScore;
}

/// Evaluator orchestrates checks
pub struct FidelityEvaluator {
    checks: Vec<Box<dyn FidelityCheck>>,
}

impl FidelityEvaluator {
    /// All checks backed by provider metadata.
    pub fn new() -> Self {
        let oracle = Arc::new(MetadataOracle);
        Self::with_oracles(oracle.clone(), oracle.clone(), oracle)
    }

    pub fn with_oracles(
        text: Arc<dyn TextOracle>,
        logos: Arc<dyn LogoOracle>,
        layout: Arc<dyn LayoutOracle>,
    ) -> Self {
        Self {
            checks: vec![
                Box::new(FilenameLeakCheck::new(text)),
                Box::new(LogoPresenceCheck::new(logos)),
                Box::new(LayoutCheck::new(layout, DEFAULT_ASPECT_TOLERANCE)),
            ],
        }
    }

    pub fn with_checks(checks: Vec<Box<dyn FidelityCheck>>) -> Self {
        Self { checks }
    }

    pub fn add_check(&mut self, check: Box<dyn FidelityCheck>) {
        self.checks.push(check);
    }
}

impl CandidateEvaluator for FidelityEvaluator {
    fn evaluate(&self, candidate: &Candidate, spec: &DiagramSpec, registry: &AssetRegistry) -> FidelityScore {
        let mut violations = vec![];
        for check in &self.checks {
            let found = check.check(candidate, spec, registry);
            if !found.is_empty() {
                debug!(check = check.name(), candidate = candidate.index, count = found.len(); "Violations found");
            }
            violations.extend(found);
        }
        FidelityScore { violations }
    }
}

impl Default for FidelityEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Score a batch concurrently. Scores are returned in candidate order.
pub fn evaluate_batch<E: CandidateEvaluator + ?Sized>(
    evaluator: &E,
    candidates: &[Candidate],
    spec: &DiagramSpec,
    registry: &AssetRegistry,
) -> Vec<FidelityScore> {
    thread::scope(|scope| {
        let handles: Vec<_> = candidates
            .iter()
            .map(|c| scope.spawn(move || evaluator.evaluate(c, spec, registry)))
            .collect();
        handles
            .into_iter()
            .zip(candidates)
            .map(|(handle, c)| {
                handle.join().unwrap_or_else(|_| {
                    warn!(candidate = c.index; "Evaluation panicked");
                    let mut v = FidelityViolation::new(
                        ViolationKind::EvaluationFailed,
                        ViolationSeverity::Error,
                        format!("Evaluation of candidate {} panicked", c.index),
                    );
                    v.remediation = vec!["Review this candidate manually".to_string()];
                    FidelityScore { violations: vec![v] }
                })
            })
            .collect()
    })
}
