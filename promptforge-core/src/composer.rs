//! Prompt Composition - Deterministic, Leak-Checked
//!
//! CRITICAL: every composed prompt passes the registry leak scan before it
//! is returned. No partially substituted or leaking text leaves this module.

use log::{debug, warn};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::assets::{AssetRegistry, ImageFormat, LogoAsset};
use crate::error::{ComposeError, SpecError};
use crate::hashing::{compute_input_hash, sha256_hex};
use crate::spec::{Connection, Constraints, DiagramSpec, Direction};
use crate::templates::{Template, BRANDING_SECTION, DIAGRAM_SECTION, LOGO_SECTION, RESERVED_PLACEHOLDERS};
use crate::ENGINE_VERSION;

const FILE_NAME_RULE: &str = "Never render text derived from a file name; logos appear only as images.";

/// Highest reinforcement level; higher requests render the same text.
pub const MAX_LEAK_GUARD: u8 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeOptions {
    /// Values for non-reserved placeholders.
    pub values: BTreeMap<String, String>,
    pub branding: Option<String>,
    /// 0 is the standard instruction; each level adds reinforcement.
    pub leak_guard: u8,
}

/// A logo image submitted alongside the prompt text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub name: String,
    pub bytes: Arc<[u8]>,
    pub hash: String,
    pub format: ImageFormat,
}

impl From<&LogoAsset> for ReferenceImage {
    fn from(asset: &LogoAsset) -> Self {
        Self {
            name: asset.name.clone(),
            bytes: Arc::clone(&asset.bytes),
            hash: asset.hash.clone(),
            format: asset.format,
        }
    }
}

/// One fully assembled request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptBundle {
    pub text: String,
    pub images: Vec<ReferenceImage>,
    /// Hash of the inputs: spec, template, values, logos, branding.
    pub input_hash: String,
    /// Hash of the final text.
    pub prompt_hash: String,
    pub leak_guard: u8,
}

/// Compose a prompt from a diagram spec.
pub fn compose(
    spec: &DiagramSpec,
    template: &Template,
    registry: &AssetRegistry,
    options: &ComposeOptions,
) -> Result<PromptBundle, ComposeError> {
    let mut placements = vec![];
    for (component, logo) in spec.logo_components() {
        let asset = registry.get(logo).ok_or_else(|| SpecError::UnknownLogo {
            component: component.id.clone(),
            logo: logo.to_string(),
        })?;
        placements.push((component.label.as_str(), asset));
    }

    let (unique, numbers) = number_images(placements.iter().map(|(_, asset)| *asset));
    let logo_section = render_logo_section(
        placements
            .iter()
            .zip(numbers)
            .map(|((label, asset), number)| (Some(*label), *asset, number)),
        options.leak_guard,
    );
    let diagram_section = render_diagram_section(spec);

    finish(
        spec.source_hash(),
        template,
        registry,
        options,
        logo_section,
        diagram_section,
        &unique,
    )
}

/// Compose from a raw prompt. Every registered logo is attached, one
/// logo line per distinct image.
pub fn compose_raw(
    template: &Template,
    registry: &AssetRegistry,
    options: &ComposeOptions,
) -> Result<PromptBundle, ComposeError> {
    let (unique, _) = number_images(registry.assets());
    let logo_section = render_logo_section(
        unique.iter().enumerate().map(|(i, asset)| (None, *asset, i + 1)),
        options.leak_guard,
    );
    finish("", template, registry, options, logo_section, String::new(), &unique)
}

/// Deduplicate by content hash in first-reference order. Also returns the
/// 1-based image number of every input asset, so prompt text can only
/// point at images that are actually sent.
fn number_images<'a>(
    assets: impl Iterator<Item = &'a LogoAsset>,
) -> (Vec<&'a LogoAsset>, Vec<usize>) {
    let mut unique: Vec<&LogoAsset> = vec![];
    let mut numbers = vec![];
    for asset in assets {
        let number = match unique.iter().position(|u| u.hash == asset.hash) {
            Some(i) => i + 1,
            None => {
                unique.push(asset);
                unique.len()
            }
        };
        numbers.push(number);
    }
    (unique, numbers)
}

fn finish(
    spec_hash: &str,
    template: &Template,
    registry: &AssetRegistry,
    options: &ComposeOptions,
    logo_section: String,
    diagram_section: String,
    unique: &[&LogoAsset],
) -> Result<PromptBundle, ComposeError> {
    let mut values = options.values.clone();
    for reserved in RESERVED_PLACEHOLDERS {
        if values.contains_key(reserved) {
            warn!(placeholder = reserved; "Ignoring caller value for reserved placeholder");
        }
    }
    values.insert(LOGO_SECTION.to_string(), logo_section);
    values.insert(DIAGRAM_SECTION.to_string(), diagram_section);
    values.insert(BRANDING_SECTION.to_string(), options.branding.clone().unwrap_or_default());

    let text = template.render(&values)?;

    if let Some(asset) = registry.scan_for_leaks(&text).into_iter().next() {
        return Err(ComposeError::Leakage { asset });
    }

    let images: Vec<ReferenceImage> = unique.iter().map(|a| ReferenceImage::from(*a)).collect();

    let asset_hashes: Vec<&str> = images.iter().map(|i| i.hash.as_str()).collect();
    let input_hash = compute_input_hash(
        spec_hash,
        &template_key(template, &options.values),
        &asset_hashes,
        options.branding.as_deref(),
        ENGINE_VERSION,
    );
    let prompt_hash = sha256_hex(text.as_bytes());

    debug!(
        input_hash = input_hash.as_str(),
        images = images.len(),
        leak_guard = options.leak_guard;
        "Prompt composed"
    );

    Ok(PromptBundle {
        text,
        images,
        input_hash,
        prompt_hash,
        leak_guard: options.leak_guard.min(MAX_LEAK_GUARD),
    })
}

/// Template hash combined with caller values, so differing values never
/// share an input hash.
fn template_key(template: &Template, values: &BTreeMap<String, String>) -> String {
    if values.is_empty() {
        return template.hash().to_string();
    }
    let mut buf = template.hash().to_string();
    for (k, v) in values {
        let _ = write!(buf, "\n{}={}", k, v);
    }
    sha256_hex(buf.as_bytes())
}

/// Entries are (component label, asset, image number). Uncatalogued logos
/// are pointed at by image number instead of a description.
fn render_logo_section<'a>(
    entries: impl Iterator<Item = (Option<&'a str>, &'a LogoAsset, usize)>,
    leak_guard: u8,
) -> String {
    let mut out = String::new();
    for (label, asset, number) in entries {
        let _ = match (label, asset.catalogued) {
            (Some(label), true) => writeln!(out, "- Use the {} for {}.", asset.description, label),
            (Some(label), false) => {
                writeln!(out, "- Use the logo shown in reference image {} for {}.", number, label)
            }
            (None, true) => {
                writeln!(out, "- Reference image {} shows the {}.", number, asset.description)
            }
            (None, false) => writeln!(out, "- Reference image {} shows a logo to include.", number),
        };
    }
    if out.is_empty() {
        return out;
    }

    out.push_str(FILE_NAME_RULE);
    if leak_guard >= 1 {
        out.push_str(
            "\nIMPORTANT: Do not write file names, file extensions or folder paths anywhere in the image.",
        );
    }
    if leak_guard >= 2 {
        out.push_str(
            "\nThe only words allowed in the image are the component and connection labels given in this prompt.",
        );
    }
    out
}

fn render_diagram_section(spec: &DiagramSpec) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Diagram: {}", spec.name());
    if !spec.description().trim().is_empty() {
        let _ = writeln!(out, "{}", spec.description().trim());
    }

    out.push_str("\nComponents:\n");
    for (i, c) in spec.components().iter().enumerate() {
        let _ = write!(out, "{}. {} ({})", i + 1, c.label, c.kind);
        if c.logo_name.is_some() {
            out.push_str(", shown with its logo");
        }
        if let Some(description) = c.description.as_deref().filter(|d| !d.trim().is_empty()) {
            let _ = write!(out, ": {}", description.trim());
        }
        out.push('\n');
    }

    if !spec.connections().is_empty() {
        out.push_str("\nConnections:\n");
        for connection in spec.connections() {
            let _ = writeln!(out, "- {}", describe_connection(spec, connection));
        }
    }

    out.push('\n');
    out.push_str(&describe_constraints(spec.constraints()));
    out
}

fn describe_connection(spec: &DiagramSpec, connection: &Connection) -> String {
    let label_of = |id: &str| {
        spec.component(id)
            .map(|c| c.label.clone())
            .unwrap_or_else(|| id.to_string())
    };
    let from = label_of(&connection.from_id);
    let to = label_of(&connection.to_id);
    let line = match connection.style {
        crate::spec::ConnectionStyle::Solid => "solid line",
        crate::spec::ConnectionStyle::Dashed => "dashed line",
    };
    let mut text = match connection.direction {
        Direction::Forward => format!("{} with an arrow from {} to {}", line, from, to),
        Direction::Backward => format!("{} with an arrow from {} to {}", line, to, from),
        Direction::Both => format!("{} with arrows both ways between {} and {}", line, from, to),
        Direction::None => format!("{} without arrowheads between {} and {}", line, from, to),
    };
    if let Some(label) = connection.label.as_deref().filter(|l| !l.trim().is_empty()) {
        let _ = write!(text, ", labeled \"{}\"", label.trim());
    }
    text
}

fn describe_constraints(constraints: &Constraints) -> String {
    format!(
        "Layout: {}. Background: {}. Labels: {}. Spacing: {}.",
        constraints.layout.as_str(),
        constraints.background,
        constraints.label_style,
        constraints.spacing
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::test_support::png_bytes;
    use crate::assets::AssetOptions;
    use crate::spec::SpecFormat;
    use std::fs;
    use tempfile::TempDir;

    fn registry(files: &[(&str, Vec<u8>)], catalog: &str) -> (TempDir, AssetRegistry) {
        let dir = TempDir::new().unwrap();
        for (name, bytes) in files {
            fs::write(dir.path().join(name), bytes).unwrap();
        }
        fs::write(dir.path().join("catalog.json"), catalog).unwrap();
        let registry = AssetRegistry::load_dir(dir.path(), &AssetOptions::default()).unwrap();
        (dir, registry)
    }

    fn spec(doc: &str) -> DiagramSpec {
        DiagramSpec::load_str(doc, SpecFormat::Json).unwrap()
    }

    const TWO_COMPONENTS: &str = r#"{"name": "flow", "description": "Simple flow",
        "components": [
            {"id": "A", "label": "A", "type": "service", "logo_name": "dbx"},
            {"id": "B", "label": "B", "type": "store"}
        ],
        "connections": [{"from_id": "A", "to_id": "B", "label": "writes"}]}"#;

    #[test]
    fn test_logo_description_used_never_file_name() {
        let (_dir, registry) = registry(
            &[("dbx.png", png_bytes(1, 1, 32))],
            r#"{"descriptions": {"dbx": "red icon"}}"#,
        );
        let template = Template::parse("{logo_section}{diagram_section}").unwrap();
        let bundle = compose(&spec(TWO_COMPONENTS), &template, &registry, &ComposeOptions::default())
            .unwrap();

        assert!(bundle.text.contains("Use the red icon for A."));
        assert!(!bundle.text.contains("dbx.png"));
        assert!(!bundle.text.contains('/'));
        assert!(!bundle.text.contains('\\'));
        assert_eq!(bundle.images.len(), 1);
        assert_eq!(bundle.images[0].name, "dbx");
    }

    #[test]
    fn test_unknown_logo_is_spec_error() {
        let (_dir, registry) = registry(&[("other.png", png_bytes(1, 1, 32))], "{}");
        let template = Template::parse("{diagram_section}").unwrap();
        let err = compose(&spec(TWO_COMPONENTS), &template, &registry, &ComposeOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            ComposeError::Spec(SpecError::UnknownLogo {
                component: "A".to_string(),
                logo: "dbx".to_string()
            })
        );
    }

    #[test]
    fn test_leak_from_template_text_detected() {
        let (_dir, registry) = registry(
            &[("dbx.png", png_bytes(1, 1, 32)), ("acme_logo.png", png_bytes(1, 1, 32))],
            r#"{"descriptions": {"dbx": "red icon", "acme": "blue wave"}}"#,
        );
        let template = Template::parse("Place acme_logo.png in the corner.\n{logo_section}").unwrap();
        let err = compose(&spec(TWO_COMPONENTS), &template, &registry, &ComposeOptions::default())
            .unwrap_err();
        assert_eq!(err, ComposeError::Leakage { asset: "acme".to_string() });
    }

    #[test]
    fn test_unresolved_placeholders_fail_atomically() {
        let (_dir, registry) = registry(
            &[("dbx.png", png_bytes(1, 1, 32))],
            r#"{"descriptions": {"dbx": "red icon"}}"#,
        );
        let template = Template::parse("{audience} {logo_section} {tone}").unwrap();
        let err = compose(&spec(TWO_COMPONENTS), &template, &registry, &ComposeOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            ComposeError::UnresolvedPlaceholder(vec!["audience".to_string(), "tone".to_string()])
        );
    }

    #[test]
    fn test_deterministic_output_and_hash() {
        let (_dir, registry) = registry(
            &[("dbx.png", png_bytes(1, 1, 32))],
            r#"{"descriptions": {"dbx": "red icon"}}"#,
        );
        let template = Template::parse("{branding_section}\n{diagram_section}\n{logo_section}").unwrap();
        let options = ComposeOptions { branding: Some("Acme colors".to_string()), ..Default::default() };
        let s = spec(TWO_COMPONENTS);

        let a = compose(&s, &template, &registry, &options).unwrap();
        let b = compose(&s, &template, &registry, &options).unwrap();
        assert_eq!(a, b);
        assert!(a.text.starts_with("Acme colors\n"));

        let unbranded = compose(&s, &template, &registry, &ComposeOptions::default()).unwrap();
        assert_ne!(a.input_hash, unbranded.input_hash);
    }

    #[test]
    fn test_diagram_section_preserves_order() {
        let doc = r#"{"name": "order", "description": "",
            "components": [
                {"id": "z", "label": "Zulu", "type": "svc"},
                {"id": "a", "label": "Alpha", "type": "svc"}
            ],
            "connections": [
                {"from_id": "z", "to_id": "a", "style": "dashed", "direction": "both"}
            ],
            "constraints": {"layout": "concentric"}}"#;
        let text = render_diagram_section(&spec(doc));
        let zulu = text.find("1. Zulu (svc)").unwrap();
        let alpha = text.find("2. Alpha (svc)").unwrap();
        assert!(zulu < alpha);
        assert!(text.contains("dashed line with arrows both ways between Zulu and Alpha"));
        assert!(text.contains("Layout: concentric."));
    }

    #[test]
    fn test_leak_guard_strengthens_instruction() {
        let (_dir, registry) = registry(
            &[("dbx.png", png_bytes(1, 1, 32))],
            r#"{"descriptions": {"dbx": "red icon"}}"#,
        );
        let template = Template::parse("{logo_section}").unwrap();
        let s = spec(TWO_COMPONENTS);
        let plain = compose(&s, &template, &registry, &ComposeOptions::default()).unwrap();
        let strong = compose(
            &s,
            &template,
            &registry,
            &ComposeOptions { leak_guard: 5, ..Default::default() },
        )
        .unwrap();

        assert!(!plain.text.contains("IMPORTANT"));
        assert!(strong.text.contains("IMPORTANT"));
        assert!(strong.text.contains("The only words allowed"));
        assert_eq!(strong.leak_guard, MAX_LEAK_GUARD);
        assert_eq!(plain.input_hash, strong.input_hash);
        assert_ne!(plain.prompt_hash, strong.prompt_hash);
    }

    #[test]
    fn test_reference_images_deduplicated_by_hash() {
        let doc = r#"{"name": "dup", "description": "d",
            "components": [
                {"id": "a", "label": "One", "type": "svc", "logo_name": "first"},
                {"id": "b", "label": "Two", "type": "svc", "logo_name": "second"},
                {"id": "c", "label": "Three", "type": "svc", "logo_name": "first"}
            ]}"#;
        let (_dir, registry) = registry(
            &[("first.png", png_bytes(4, 4, 40)), ("second.png", png_bytes(4, 4, 40))],
            r#"{"descriptions": {"first": "green leaf", "second": "green leaf twin"}}"#,
        );
        let template = Template::parse("{logo_section}").unwrap();
        let bundle = compose(&spec(doc), &template, &registry, &ComposeOptions::default()).unwrap();
        assert_eq!(bundle.images.len(), 1);
        assert_eq!(bundle.images[0].name, "first");
    }

    #[test]
    fn test_compose_raw_lists_every_logo() {
        let (_dir, registry) = registry(
            &[("alpha.png", png_bytes(1, 1, 32)), ("beta.jpg", vec![0xFF, 0xD8, 0xFF, 0xD9])],
            r#"{"descriptions": {"alpha": "orange circle", "beta": "black square"}}"#,
        );
        let template = Template::parse("Architecture poster.\n{logo_section}").unwrap();
        let bundle = compose_raw(&template, &registry, &ComposeOptions::default()).unwrap();
        assert!(bundle.text.contains("Reference image 1 shows the orange circle."));
        assert!(bundle.text.contains("Reference image 2 shows the black square."));
        assert_eq!(bundle.images.len(), 2);
    }

    #[test]
    fn test_compose_raw_numbers_only_sent_images() {
        let shared = png_bytes(4, 4, 48);
        let (_dir, registry) = registry(
            &[
                ("alpha.png", shared.clone()),
                ("beta.png", shared),
                ("gamma.png", png_bytes(4, 4, 49)),
            ],
            r#"{"descriptions": {"alpha": "green hexagon", "beta": "green hexagon copy", "gamma": "purple star"}}"#,
        );
        let template = Template::parse("{logo_section}").unwrap();
        let bundle = compose_raw(&template, &registry, &ComposeOptions::default()).unwrap();

        assert_eq!(bundle.images.len(), 2);
        assert_eq!(bundle.images[0].name, "alpha");
        assert_eq!(bundle.images[1].name, "gamma");
        assert!(bundle.text.contains("Reference image 1 shows the green hexagon."));
        assert!(bundle.text.contains("Reference image 2 shows the purple star."));
        assert!(!bundle.text.contains("Reference image 3"));
        assert!(!bundle.text.contains("copy"));
    }

    #[test]
    fn test_uncatalogued_logo_points_at_its_image_number() {
        let doc = r#"{"name": "mixed", "description": "d",
            "components": [
                {"id": "a", "label": "Ingest", "type": "svc", "logo_name": "first"},
                {"id": "b", "label": "Mirror", "type": "svc", "logo_name": "second"},
                {"id": "c", "label": "Store", "type": "svc", "logo_name": "third"}
            ]}"#;
        let shared = png_bytes(4, 4, 40);
        let (_dir, registry) = registry(
            &[
                ("first.png", shared.clone()),
                ("second.png", shared),
                ("third.png", png_bytes(4, 4, 41)),
            ],
            r#"{"descriptions": {"first": "green leaf"}}"#,
        );
        let template = Template::parse("{logo_section}").unwrap();
        let bundle = compose(&spec(doc), &template, &registry, &ComposeOptions::default()).unwrap();

        assert_eq!(bundle.images.len(), 2);
        assert!(bundle.text.contains("Use the green leaf for Ingest."));
        assert!(bundle.text.contains("Use the logo shown in reference image 1 for Mirror."));
        assert!(bundle.text.contains("Use the logo shown in reference image 2 for Store."));
        assert!(!bundle.text.contains("third"));
    }
}
