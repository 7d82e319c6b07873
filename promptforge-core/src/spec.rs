//! Diagram Specs - Validated at the Load Boundary
//!
//! A `DiagramSpec` is parsed once, checked once, and never mutated. Logo
//! names are not resolved here; that happens at composition time against
//! the asset registry.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::SpecError;
use crate::hashing::sha256_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecFormat {
    Json,
    Yaml,
}

impl SpecFormat {
    pub fn from_path(path: &Path) -> Result<Self, SpecError> {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase) {
            Some(ext) if ext == "json" => Ok(Self::Json),
            Some(ext) if ext == "yaml" || ext == "yml" => Ok(Self::Yaml),
            Some(ext) => Err(SpecError::UnsupportedFormat(ext)),
            None => Err(SpecError::UnsupportedFormat("(no extension)".to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStyle {
    #[default]
    Solid,
    Dashed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Backward,
    Both,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    #[default]
    LeftToRight,
    TopToBottom,
    Concentric,
    Layered,
}

impl Layout {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeftToRight => "left-to-right",
            Self::TopToBottom => "top-to-bottom",
            Self::Concentric => "concentric",
            Self::Layered => "layered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub logo_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from_id: String,
    pub to_id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub style: ConnectionStyle,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub layout: Layout,
    #[serde(default = "default_background")]
    pub background: String,
    #[serde(default = "default_label_style")]
    pub label_style: String,
    #[serde(default = "default_spacing")]
    pub spacing: String,
}

fn default_background() -> String {
    "white".to_string()
}

fn default_label_style() -> String {
    "clean sans-serif".to_string()
}

fn default_spacing() -> String {
    "comfortable".to_string()
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            background: default_background(),
            label_style: default_label_style(),
            spacing: default_spacing(),
        }
    }
}

/// Raw document shape. Required fields are `Option` so a missing one is
/// reported by name instead of as a generic parse error.
#[derive(Debug, Deserialize)]
struct RawSpec {
    name: Option<String>,
    description: Option<String>,
    components: Option<Vec<RawComponent>>,
    #[serde(default)]
    connections: Vec<RawConnection>,
    #[serde(default)]
    constraints: Constraints,
}

#[derive(Debug, Deserialize)]
struct RawComponent {
    id: Option<String>,
    label: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    logo_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConnection {
    from_id: Option<String>,
    to_id: Option<String>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    style: ConnectionStyle,
    #[serde(default)]
    direction: Direction,
}

/// Immutable, validated diagram specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagramSpec {
    name: String,
    description: String,
    components: Vec<Component>,
    connections: Vec<Connection>,
    constraints: Constraints,
    #[serde(skip)]
    source_hash: String,
}

impl DiagramSpec {
    /// Load and validate a spec file. The format follows the extension.
    pub fn load(path: &Path) -> Result<Self, SpecError> {
        let format = SpecFormat::from_path(path)?;
        let source = fs::read_to_string(path)
            .map_err(|e| SpecError::Parse(format!("cannot read spec: {}", e)))?;
        Self::load_str(&source, format)
    }

    /// Parse and validate an in-memory spec document.
    pub fn load_str(source: &str, format: SpecFormat) -> Result<Self, SpecError> {
        let raw: RawSpec = match format {
            SpecFormat::Json => serde_json::from_str(source)
                .map_err(|e| SpecError::Parse(e.to_string()))?,
            SpecFormat::Yaml => serde_yaml::from_str(source)
                .map_err(|e| SpecError::Parse(e.to_string()))?,
        };
        Self::from_raw(raw, sha256_hex(source.as_bytes()))
    }

    /// A spec with no components, used when composing from a raw prompt.
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            components: vec![],
            connections: vec![],
            constraints: Constraints::default(),
            source_hash: sha256_hex(name.as_bytes()),
        }
    }

    fn from_raw(raw: RawSpec, source_hash: String) -> Result<Self, SpecError> {
        let name = required(raw.name, "name")?;
        let description = raw
            .description
            .ok_or_else(|| SpecError::MissingField("description".to_string()))?;
        let raw_components = raw
            .components
            .ok_or_else(|| SpecError::MissingField("components".to_string()))?;

        let mut components = Vec::with_capacity(raw_components.len());
        let mut seen = HashSet::new();
        for (i, c) in raw_components.into_iter().enumerate() {
            let id = required(c.id, &format!("components[{}].id", i))?;
            let label = required(c.label, &format!("components[{}].label", i))?;
            let kind = required(c.kind, &format!("components[{}].type", i))?;
            if !seen.insert(id.clone()) {
                return Err(SpecError::DuplicateComponent(id));
            }
            components.push(Component {
                id,
                label,
                kind,
                logo_name: c.logo_name.filter(|l| !l.trim().is_empty()),
                description: c.description,
            });
        }

        let mut connections = Vec::with_capacity(raw.connections.len());
        for (i, c) in raw.connections.into_iter().enumerate() {
            let from_id = required(c.from_id, &format!("connections[{}].from_id", i))?;
            let to_id = required(c.to_id, &format!("connections[{}].to_id", i))?;
            for (end, id) in [("from_id", &from_id), ("to_id", &to_id)] {
                if !seen.contains(id) {
                    return Err(SpecError::DanglingConnection {
                        index: i,
                        end,
                        id: id.clone(),
                    });
                }
            }
            connections.push(Connection {
                from_id,
                to_id,
                label: c.label,
                style: c.style,
                direction: c.direction,
            });
        }

        Ok(Self {
            name,
            description,
            components,
            connections,
            constraints: raw.constraints,
            source_hash,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// SHA-256 of the source document bytes.
    pub fn source_hash(&self) -> &str {
        &self.source_hash
    }

    pub fn component(&self, id: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.id == id)
    }

    /// Components carrying a logo, in declaration order.
    pub fn logo_components(&self) -> impl Iterator<Item = (&Component, &str)> {
        self.components
            .iter()
            .filter_map(|c| c.logo_name.as_deref().map(|l| (c, l)))
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, SpecError> {
    match value {
        None => Err(SpecError::MissingField(field.to_string())),
        Some(v) if v.trim().is_empty() => Err(SpecError::EmptyField(field.to_string())),
        Some(v) => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "name": "lakehouse",
        "description": "Data platform overview",
        "components": [
            {"id": "a", "label": "Ingest", "type": "service", "logo_name": "dbx"},
            {"id": "b", "label": "Warehouse", "type": "store"}
        ],
        "connections": [
            {"from_id": "a", "to_id": "b", "label": "batches", "style": "dashed"}
        ],
        "constraints": {"layout": "top-to-bottom"}
    }"#;

    #[test]
    fn test_load_valid_json() {
        let spec = DiagramSpec::load_str(VALID, SpecFormat::Json).unwrap();
        assert_eq!(spec.name(), "lakehouse");
        assert_eq!(spec.components().len(), 2);
        assert_eq!(spec.connections()[0].style, ConnectionStyle::Dashed);
        assert_eq!(spec.connections()[0].direction, Direction::Forward);
        assert_eq!(spec.constraints().layout, Layout::TopToBottom);
        assert_eq!(spec.constraints().background, "white");
        assert_eq!(spec.logo_components().count(), 1);
    }

    #[test]
    fn test_load_yaml() {
        let yaml = "name: n\ndescription: d\ncomponents:\n  - id: a\n    label: A\n    type: svc\n";
        let spec = DiagramSpec::load_str(yaml, SpecFormat::Yaml).unwrap();
        assert_eq!(spec.components()[0].label, "A");
        assert!(spec.connections().is_empty());
    }

    #[test]
    fn test_partial_constraints_take_defaults() {
        let doc = r#"{"name": "n", "description": "d",
            "components": [{"id": "a", "label": "A", "type": "svc"}],
            "constraints": {"background": "slate"}}"#;
        let spec = DiagramSpec::load_str(doc, SpecFormat::Json).unwrap();
        let constraints = spec.constraints();
        assert_eq!(constraints.background, "slate");
        assert_eq!(constraints.label_style, "clean sans-serif");
        assert_eq!(constraints.spacing, "comfortable");
        assert_eq!(constraints.layout, Layout::default());
    }

    #[test]
    fn test_missing_field_named() {
        let doc = r#"{"name": "n", "description": "d", "components": [{"id": "a", "type": "svc"}]}"#;
        let err = DiagramSpec::load_str(doc, SpecFormat::Json).unwrap_err();
        assert_eq!(err, SpecError::MissingField("components[0].label".to_string()));

        let doc = r#"{"description": "d", "components": []}"#;
        let err = DiagramSpec::load_str(doc, SpecFormat::Json).unwrap_err();
        assert_eq!(err, SpecError::MissingField("name".to_string()));
    }

    #[test]
    fn test_duplicate_component_rejected() {
        let doc = r#"{"name": "n", "description": "d", "components": [
            {"id": "a", "label": "A", "type": "svc"},
            {"id": "a", "label": "B", "type": "svc"}
        ]}"#;
        let err = DiagramSpec::load_str(doc, SpecFormat::Json).unwrap_err();
        assert_eq!(err, SpecError::DuplicateComponent("a".to_string()));
    }

    #[test]
    fn test_dangling_connection_rejected() {
        let doc = r#"{"name": "n", "description": "d",
            "components": [{"id": "a", "label": "A", "type": "svc"}],
            "connections": [{"from_id": "a", "to_id": "ghost"}]}"#;
        let err = DiagramSpec::load_str(doc, SpecFormat::Json).unwrap_err();
        assert_eq!(
            err,
            SpecError::DanglingConnection { index: 0, end: "to_id", id: "ghost".to_string() }
        );
    }

    #[test]
    fn test_self_loop_allowed() {
        let doc = r#"{"name": "n", "description": "d",
            "components": [{"id": "a", "label": "A", "type": "svc"}],
            "connections": [{"from_id": "a", "to_id": "a"}]}"#;
        assert!(DiagramSpec::load_str(doc, SpecFormat::Json).is_ok());
    }

    #[test]
    fn test_unknown_extension() {
        let err = SpecFormat::from_path(Path::new("diagram.txt")).unwrap_err();
        assert_eq!(err, SpecError::UnsupportedFormat("txt".to_string()));
    }

    #[test]
    fn test_source_hash_stable() {
        let a = DiagramSpec::load_str(VALID, SpecFormat::Json).unwrap();
        let b = DiagramSpec::load_str(VALID, SpecFormat::Json).unwrap();
        assert_eq!(a.source_hash(), b.source_hash());
    }
}
