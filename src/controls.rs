//! Control descriptions
//!
//! A [`ControlSpec`] says how to recognise one control, never where it lives:
//! no frame index or page position is ever part of it. The table is plain
//! configuration and can be loaded from JSON when the portal's markup drifts.

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::driver::Locator;
use crate::error::{Error, Result};
use crate::model::Field;

/// How to find a single control
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlSpec {
    /// Accessible label (fields) or accessible name (buttons), matched case-insensitively
    #[serde(with = "pattern")]
    pub label_pattern: Regex,
    /// CSS selectors tried in order once label matching fails everywhere
    #[serde(default)]
    pub fallback_selectors: Vec<String>,
    /// Buttons only: visible text the button contains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_contains: Option<String>,
}

impl ControlSpec {
    /// Build a spec from a label pattern and fallback selectors
    pub fn new(label_pattern: &str, fallback_selectors: &[&str]) -> Result<Self> {
        Ok(Self {
            label_pattern: compile_pattern(label_pattern)?,
            fallback_selectors: fallback_selectors.iter().map(|s| s.to_string()).collect(),
            text_contains: None,
        })
    }

    /// Add the button text fallback
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_contains = Some(text.into());
        self
    }

    /// Locators for a form field, in priority order
    pub fn field_locators(&self) -> Vec<Locator> {
        std::iter::once(Locator::Label(self.label_pattern.clone()))
            .chain(self.fallback_selectors.iter().cloned().map(Locator::Css))
            .collect()
    }

    /// Locators for a button, in priority order
    pub fn button_locators(&self) -> Vec<Locator> {
        let role = Locator::Role {
            role: "button".into(),
            name: self.label_pattern.clone(),
        };
        std::iter::once(role)
            .chain(self.text_contains.iter().cloned().map(Locator::ButtonText))
            .chain(self.fallback_selectors.iter().cloned().map(Locator::Css))
            .collect()
    }
}

/// Compile a user-supplied pattern as case-insensitive.
///
/// Patterns also run inside the page as JavaScript `RegExp`s, so syntax that
/// only the Rust engine accepts is refused here.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    check_portable(pattern)?;
    Ok(RegexBuilder::new(pattern).case_insensitive(true).build()?)
}

fn check_portable(pattern: &str) -> Result<()> {
    let refuse = |what: &str| {
        Err(Error::Config(format!(
            "pattern '{}' uses {}, which the page cannot evaluate",
            pattern, what
        )))
    };

    let mut chars = pattern.chars().peekable();
    let mut in_class = false;
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(esc @ ('A' | 'z' | 'p' | 'P')) = chars.next() {
                    return refuse(&format!("\\{}", esc));
                }
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '(' if !in_class && chars.peek() == Some(&'?') => {
                chars.next();
                if chars.peek() != Some(&':') {
                    return refuse("an inline flag or named group");
                }
            }
            _ => {}
        }
    }
    Ok(())
}

mod pattern {
    use super::*;

    pub fn serialize<S: Serializer>(re: &Regex, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(re.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Regex, D::Error> {
        let raw = String::deserialize(d)?;
        compile_pattern(&raw).map_err(serde::de::Error::custom)
    }
}

/// The control table: one spec per form field plus the search button
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlTable {
    pub nombre: ControlSpec,
    pub paterno: ControlSpec,
    pub materno: ControlSpec,
    pub curp: ControlSpec,
    pub search_button: ControlSpec,
}

impl ControlTable {
    /// Spec for a query field
    pub fn field(&self, field: Field) -> &ControlSpec {
        match field {
            Field::Nombre => &self.nombre,
            Field::Paterno => &self.paterno,
            Field::Materno => &self.materno,
            Field::Curp => &self.curp,
        }
    }

    /// Parse a table from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("control table: {}", e)))
    }

    /// Load a table from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        tracing::info!("Loaded control table from {}", path.display());
        Self::from_json(&json)
    }

    /// Table matching the public credential portal as last observed
    pub fn portal_default() -> Self {
        fn spec(label: &str, selectors: &[&str]) -> ControlSpec {
            ControlSpec {
                label_pattern: compile_pattern(label).expect("Invalid built-in control pattern"),
                fallback_selectors: selectors.iter().map(|s| s.to_string()).collect(),
                text_contains: None,
            }
        }

        Self {
            nombre: spec(
                r"Nombre\(s\)*",
                &["input#nombre", "input[formcontrolname=\"nombre\"]"],
            ),
            paterno: spec(
                "Primer Apellido",
                &["input#primerApellido", "input[formcontrolname=\"primerApellido\"]"],
            ),
            materno: spec(
                "Segundo Apellido",
                &["input#segundoApellido", "input[formcontrolname=\"segundoApellido\"]"],
            ),
            curp: spec("CURP", &["input#curp", "input[formcontrolname=\"curp\"]"]),
            search_button: spec("buscar", &["button[type=\"submit\"]"]).with_text("Buscar"),
        }
    }
}

impl Default for ControlTable {
    fn default() -> Self {
        Self::portal_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_locators_label_first() {
        let spec = ControlSpec::new("CURP", &["input#curp", "input[name=curp]"]).unwrap();
        let locators = spec.field_locators();
        assert_eq!(locators.len(), 3);
        assert!(matches!(&locators[0], Locator::Label(re) if re.is_match("curp del titular")));
        assert!(matches!(&locators[1], Locator::Css(s) if s == "input#curp"));
        assert!(matches!(&locators[2], Locator::Css(s) if s == "input[name=curp]"));
    }

    #[test]
    fn test_button_locators_role_then_text_then_css() {
        let spec = ControlSpec::new("buscar", &["button.search"])
            .unwrap()
            .with_text("Buscar");
        let kinds: Vec<_> = spec.button_locators().iter().map(Locator::describe).collect();
        assert_eq!(
            kinds,
            vec![
                "role=button[name=/buscar/i]".to_string(),
                "button:has-text(\"Buscar\")".to_string(),
                "css=button.search".to_string(),
            ]
        );
    }

    #[test]
    fn test_patterns_are_case_insensitive() {
        let table = ControlTable::portal_default();
        assert!(table.curp.label_pattern.is_match("curp"));
        assert!(table.nombre.label_pattern.is_match("NOMBRE(S)"));
        assert!(table.search_button.label_pattern.is_match("Buscar"));
    }

    #[test]
    fn test_table_from_json() {
        let json = r##"{
            "nombre": { "labelPattern": "Nombre", "fallbackSelectors": ["#n"] },
            "paterno": { "labelPattern": "Paterno" },
            "materno": { "labelPattern": "Materno" },
            "curp": { "labelPattern": "CURP", "fallbackSelectors": ["#c", "[name=curp]"] },
            "searchButton": { "labelPattern": "consultar", "textContains": "Consultar" }
        }"##;
        let table = ControlTable::from_json(json).unwrap();
        assert_eq!(table.field(Field::Curp).fallback_selectors, vec!["#c", "[name=curp]"]);
        assert!(table.paterno.fallback_selectors.is_empty());
        assert_eq!(table.search_button.text_contains.as_deref(), Some("Consultar"));
        assert!(table.nombre.label_pattern.is_match("nombre"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let json = r#"{
            "nombre": { "labelPattern": "(unclosed" },
            "paterno": { "labelPattern": "a" },
            "materno": { "labelPattern": "a" },
            "curp": { "labelPattern": "a" },
            "searchButton": { "labelPattern": "a" }
        }"#;
        let err = ControlTable::from_json(json).unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(ControlSpec::new("(", &[]).is_err());
    }

    #[test]
    fn test_json_roundtrip_keeps_patterns() {
        let table = ControlTable::portal_default();
        let json = serde_json::to_string(&table).unwrap();
        let back = ControlTable::from_json(&json).unwrap();
        assert_eq!(back.curp.label_pattern.as_str(), table.curp.label_pattern.as_str());
        assert_eq!(back.search_button.text_contains.as_deref(), Some("Buscar"));
    }

    #[test]
    fn test_rust_only_syntax_rejected() {
        for pattern in [r"(?i)curp", r"(?P<n>curp)", r"(?<n>curp)", r"\ACURP\z", r"\p{L}+"] {
            let err = ControlSpec::new(pattern, &[]).unwrap_err();
            assert_eq!(err.kind(), "config", "{}", pattern);
        }

        let json = r#"{
            "nombre": { "labelPattern": "(?i)nombre" },
            "paterno": { "labelPattern": "a" },
            "materno": { "labelPattern": "a" },
            "curp": { "labelPattern": "a" },
            "searchButton": { "labelPattern": "a" }
        }"#;
        assert!(ControlTable::from_json(json).is_err());
    }

    #[test]
    fn test_portable_syntax_accepted() {
        for pattern in [r"Nombre\(s\)*", r"(?:primer|1er) apellido", r"^buscar$", r"[(?]x", r"\(\?i\)"] {
            assert!(ControlSpec::new(pattern, &[]).is_ok(), "{}", pattern);
        }
    }
}
