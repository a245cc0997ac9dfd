//! Corpus loader
//!
//! Reads drug and disease records from JSON or YAML files. A file may hold a
//! bare array of records or a `{ "documents": [...] }` wrapper. Pointing the
//! loader at a directory loads every `.json`, `.yaml` and `.yml` file in it,
//! in file name order.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use medirag_core::{DiseaseRecord, Document, DrugRecord};

use crate::RagError;

/// Accepted file layouts
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordFile<T> {
    List(Vec<T>),
    Wrapped {
        #[serde(default)]
        #[allow(dead_code)]
        version: Option<String>,
        documents: Vec<T>,
    },
}

impl<T> RecordFile<T> {
    fn into_records(self) -> Vec<T> {
        match self {
            RecordFile::List(records) => records,
            RecordFile::Wrapped { documents, .. } => documents,
        }
    }
}

/// Loader for materialized corpus records
pub struct KnowledgeLoader;

impl KnowledgeLoader {
    /// Load drug records from a file or directory
    pub fn load_drugs(path: &Path) -> Result<Vec<Document>, RagError> {
        Self::load::<DrugRecord>(path)
    }

    /// Load disease records from a file or directory
    pub fn load_diseases(path: &Path) -> Result<Vec<Document>, RagError> {
        Self::load::<DiseaseRecord>(path)
    }

    fn load<T>(path: &Path) -> Result<Vec<Document>, RagError>
    where
        T: DeserializeOwned + Into<Document>,
    {
        if !path.exists() {
            return Err(RagError::Load(format!(
                "Corpus path does not exist: {}",
                path.display()
            )));
        }

        let files = if path.is_dir() {
            Self::list_files(path)?
        } else {
            vec![path.to_path_buf()]
        };

        let mut documents = Vec::new();
        for file in &files {
            let records: Vec<T> = Self::load_file(file)?;
            let before = documents.len();
            documents.extend(
                records
                    .into_iter()
                    .map(Into::into)
                    .filter(|doc: &Document| !doc.id.trim().is_empty()),
            );
            tracing::info!(
                file = %file.display(),
                documents = documents.len() - before,
                "Loaded corpus file"
            );
        }

        tracing::info!(
            path = %path.display(),
            total_documents = documents.len(),
            "Corpus loading complete"
        );

        Ok(documents)
    }

    fn list_files(dir: &Path) -> Result<Vec<PathBuf>, RagError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| RagError::Load(format!("Failed to read directory: {}", e)))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RagError::Load(format!("Failed to read entry: {}", e)))?;
            let path = entry.path();
            if path.is_file() && Self::is_supported(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn is_supported(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("json" | "yaml" | "yml")
        )
    }

    fn load_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, RagError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RagError::Load(format!("Failed to read {}: {}", path.display(), e)))?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed: RecordFile<T> = match extension {
            "json" => serde_json::from_str(&content)
                .map_err(|e| RagError::Load(format!("JSON parse error in {}: {}", path.display(), e)))?,
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| RagError::Load(format!("YAML parse error in {}: {}", path.display(), e)))?,
            _ => {
                return Err(RagError::Load(format!(
                    "Unsupported file type: {}",
                    extension
                )))
            },
        };

        Ok(parsed.into_records())
    }
}
