//! Template System - Placeholders Are Contracts
//!
//! A template declares its insertion points with `{name}` markers. The
//! reserved sections are always satisfiable; every other name must be
//! supplied by the caller or rendering fails naming every gap at once.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::error::{ComposeError, TemplateError};
use crate::hashing::sha256_hex;

pub const LOGO_SECTION: &str = "logo_section";
pub const DIAGRAM_SECTION: &str = "diagram_section";
pub const BRANDING_SECTION: &str = "branding_section";

/// Placeholders the composer always fills.
pub const RESERVED_PLACEHOLDERS: [&str; 3] = [LOGO_SECTION, DIAGRAM_SECTION, BRANDING_SECTION];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

/// Immutable prompt template with its derived placeholder set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    raw: String,
    segments: Vec<Segment>,
    placeholders: BTreeSet<String>,
    hash: String,
}

impl Template {
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let raw = fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        if raw.trim().is_empty() {
            return Err(TemplateError::Empty);
        }
        let segments = scan(raw);
        let placeholders = segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder(name) => Some(name.clone()),
                Segment::Literal(_) => None,
            })
            .collect();
        Ok(Self {
            raw: raw.to_string(),
            segments,
            placeholders,
            hash: sha256_hex(raw.as_bytes()),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Every placeholder name found in the template.
    pub fn placeholders(&self) -> &BTreeSet<String> {
        &self.placeholders
    }

    /// Non-reserved placeholders the caller has to supply.
    pub fn required_values(&self) -> impl Iterator<Item = &str> {
        self.placeholders
            .iter()
            .map(String::as_str)
            .filter(|p| !RESERVED_PLACEHOLDERS.contains(p))
    }

    /// Names with no value in `values`, sorted.
    pub fn missing(&self, values: &BTreeMap<String, String>) -> Vec<String> {
        self.placeholders
            .iter()
            .filter(|p| !values.contains_key(*p))
            .cloned()
            .collect()
    }

    /// Substitute every placeholder in one pass. Substituted text is never
    /// rescanned, so a value containing `{x}` stays literal.
    pub fn render(&self, values: &BTreeMap<String, String>) -> Result<String, ComposeError> {
        let missing = self.missing(values);
        if !missing.is_empty() {
            return Err(ComposeError::UnresolvedPlaceholder(missing));
        }

        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    if let Some(value) = values.get(name) {
                        out.push_str(value);
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Split template text into literals and `{name}` placeholders.
/// `{{` and `}}` escape literal braces; any other brace is kept as-is.
fn scan(raw: &str) -> Vec<Segment> {
    let mut segments = vec![];
    let mut literal = String::new();
    let mut rest = raw;

    while let Some(c) = rest.chars().next() {
        if rest.starts_with("{{") {
            literal.push('{');
            rest = &rest[2..];
            continue;
        }
        if rest.starts_with("}}") {
            literal.push('}');
            rest = &rest[2..];
            continue;
        }
        if c == '{' {
            if let Some(end) = rest[1..].find('}') {
                let name = &rest[1..=end];
                if is_placeholder_name(name) {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name.to_string()));
                    rest = &rest[end + 2..];
                    continue;
                }
            }
        }
        literal.push(c);
        rest = &rest[c.len_utf8()..];
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
