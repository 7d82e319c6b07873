//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use promptforge_core::generation::{GenerationBatch, ProviderMetadata};
use promptforge_core::{
    CancelToken, Candidate, GenerationError, GenerationParams, Generator, ImageFormat, PromptBundle,
};

/// Minimal PNG header with the given dimensions, padded to `len` bytes.
pub fn png_bytes(width: u32, height: u32, len: usize) -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&13u32.to_be_bytes());
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&width.to_be_bytes());
    bytes.extend_from_slice(&height.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    if bytes.len() < len {
        bytes.resize(len, 0);
    }
    bytes
}

pub fn write(dir: &Path, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

pub const SPEC: &str = r#"{
    "name": "lakehouse",
    "description": "Ingest into the lakehouse",
    "components": [
        {"id": "A", "label": "A", "type": "service", "logo_name": "dbx"},
        {"id": "B", "label": "B", "type": "store"}
    ],
    "connections": [{"from_id": "A", "to_id": "B", "label": "writes"}],
    "constraints": {"layout": "left-to-right"}
}"#;

pub const CATALOG: &str = r#"{"descriptions": {"dbx": "red icon"}}"#;

pub const TEMPLATE: &str = "Draw a clean architecture diagram.\n{logo_section}\n{diagram_section}\n";

/// Metadata of a candidate that passes every check for `SPEC`.
pub fn clean_attributes() -> Value {
    serde_json::json!({
        "rendered_text": ["A", "B", "writes"],
        "detected_logos": [{"logo": "dbx", "component_id": "A"}],
        "layout": "left-to-right"
    })
}

/// Metadata of a candidate that shows the logo's file name.
pub fn leaking_attributes() -> Value {
    serde_json::json!({
        "rendered_text": ["dbx.png", "A", "B"],
        "detected_logos": [{"logo": "dbx", "component_id": "A"}],
        "layout": "left-to-right"
    })
}

/// Metadata of a candidate that dropped the required logo.
pub fn missing_logo_attributes() -> Value {
    serde_json::json!({
        "rendered_text": ["A", "B"],
        "detected_logos": [],
        "layout": "left-to-right"
    })
}

/// Generator that replays one batch of candidate metadata per attempt and
/// records every bundle it was asked to render.
pub struct ScriptedGenerator {
    attempts: Mutex<VecDeque<Vec<Value>>>,
    seen: Mutex<Vec<PromptBundle>>,
    cancel_after_call: Option<CancelToken>,
}

impl ScriptedGenerator {
    pub fn new(attempts: Vec<Vec<Value>>) -> Self {
        Self {
            attempts: Mutex::new(attempts.into_iter().collect()),
            seen: Mutex::new(vec![]),
            cancel_after_call: None,
        }
    }

    /// Cancel `token` as soon as the first batch has been produced.
    pub fn cancelling(mut self, token: CancelToken) -> Self {
        self.cancel_after_call = Some(token);
        self
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn bundles(&self) -> Vec<PromptBundle> {
        self.seen.lock().unwrap().clone()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(
        &self,
        bundle: &PromptBundle,
        params: &GenerationParams,
        _cancel: &CancelToken,
    ) -> GenerationBatch {
        self.seen.lock().unwrap().push(bundle.clone());
        let script = self.attempts.lock().unwrap().pop_front().unwrap_or_default();

        let mut batch = GenerationBatch::default();
        if script.is_empty() {
            batch.failures.push(GenerationError::Permanent {
                index: 0,
                reason: "no image".to_string(),
            });
        }
        for (index, attributes) in script.into_iter().enumerate() {
            let attributes: BTreeMap<String, Value> = serde_json::from_value(attributes).unwrap();
            batch.candidates.push(Candidate {
                index,
                bytes: png_bytes(1600, 900, 64 + index).into(),
                mime_type: "image/png".to_string(),
                format: Some(ImageFormat::Png),
                aspect_ratio: params.aspect_ratio,
                size: params.size.clone(),
                metadata: ProviderMetadata { model: Some("fake".to_string()), attributes },
            });
        }

        if let Some(token) = &self.cancel_after_call {
            token.cancel();
        }
        batch
    }
}
