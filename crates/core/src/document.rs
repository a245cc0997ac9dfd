//! Retrievable documents and the catalog records they are built from

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum characters kept from long free-text drug fields
const LONG_FIELD_CHARS: usize = 200;

/// Kind of record a document was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Drug,
    Disease,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drug => write!(f, "drug"),
            Self::Disease => write!(f, "disease"),
        }
    }
}

/// Named text field used for retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextField {
    pub name: String,
    pub text: String,
}

/// Retrievable unit
///
/// Immutable once indexed. A rebuild creates new documents rather than
/// patching existing ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier
    pub id: String,
    pub kind: DocumentKind,
    /// Display name
    pub name: String,
    /// Fields indexed for retrieval, in order
    #[serde(default)]
    pub fields: Vec<TextField>,
    /// Structured metadata (manufacturer, warnings, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Document {
    /// Create a new document
    pub fn new(id: impl Into<String>, kind: DocumentKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            fields: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a retrieval field; blank text is ignored
    pub fn with_field(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.trim().is_empty() {
            self.fields.push(TextField {
                name: name.into(),
                text,
            });
        }
        self
    }

    /// Add metadata; blank values are ignored
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.trim().is_empty() {
            self.metadata.insert(key.into(), value);
        }
        self
    }

    /// Text of a named retrieval field
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.text.as_str())
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Name followed by every retrieval field, space separated
    pub fn retrieval_text(&self) -> String {
        let mut text = self.name.clone();
        for field in &self.fields {
            text.push(' ');
            text.push_str(&field.text);
        }
        text
    }
}

/// Drug record as exported by the public drug catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrugRecord {
    pub id: String,
    pub item_name: String,
    #[serde(default)]
    pub entp_name: Option<String>,
    #[serde(default)]
    pub efficacy: Option<String>,
    #[serde(default)]
    pub use_method: Option<String>,
    #[serde(default)]
    pub warning_info: Option<String>,
    #[serde(default)]
    pub caution_info: Option<String>,
    #[serde(default)]
    pub interaction: Option<String>,
    #[serde(default)]
    pub side_effects: Option<String>,
    #[serde(default)]
    pub storage_method: Option<String>,
}

impl From<DrugRecord> for Document {
    fn from(record: DrugRecord) -> Self {
        let opt = |v: Option<String>| v.unwrap_or_default();

        Document::new(record.id, DocumentKind::Drug, record.item_name)
            .with_field("efficacy", opt(record.efficacy))
            .with_field(
                "use_method",
                truncate_chars(&opt(record.use_method), LONG_FIELD_CHARS),
            )
            .with_field(
                "caution_info",
                truncate_chars(&opt(record.caution_info), LONG_FIELD_CHARS),
            )
            .with_metadata("manufacturer", opt(record.entp_name))
            .with_metadata("warning_info", opt(record.warning_info))
            .with_metadata("interaction", opt(record.interaction))
            .with_metadata("side_effects", opt(record.side_effects))
            .with_metadata("storage_method", opt(record.storage_method))
    }
}

/// Disease record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiseaseRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub name_en: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub causes: Option<String>,
    #[serde(default)]
    pub symptoms: Option<String>,
    #[serde(default)]
    pub diagnosis: Option<String>,
    #[serde(default)]
    pub treatment: Option<String>,
    #[serde(default)]
    pub prevention: Option<String>,
    #[serde(default)]
    pub related_drugs: Option<String>,
}

impl From<DiseaseRecord> for Document {
    fn from(record: DiseaseRecord) -> Self {
        let opt = |v: Option<String>| v.unwrap_or_default();

        Document::new(record.id, DocumentKind::Disease, record.name)
            .with_field("symptoms", opt(record.symptoms))
            .with_field("description", opt(record.description))
            .with_field("causes", opt(record.causes))
            .with_metadata("name_en", opt(record.name_en))
            .with_metadata("category", opt(record.category))
            .with_metadata("diagnosis", opt(record.diagnosis))
            .with_metadata("treatment", opt(record.treatment))
            .with_metadata("prevention", opt(record.prevention))
            .with_metadata("related_drugs", opt(record.related_drugs))
    }
}

/// Truncate to at most `max` characters on a char boundary
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
