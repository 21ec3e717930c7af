//! Declaration documents: serializable declaration sets.
//!
//! Closures cannot be written to disk, so documents express derived sources
//! as `${{ dependency.path }}` templates and transforms as a `select` path.
//!
//! ```yaml
//! name: profile
//! sources:
//!   - source: /api/user
//!     key: user
//!   - source: /api/user/${{ user.id }}/posts
//!     requires: user
//!     key: user.posts
//!     refresh: 30
//! ```

use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sluice_types::Location;
use thiserror::Error;
use tracing::trace;

use crate::{
    binding::Consumer,
    declaration::{Declaration, DeclarationSet, Requirement},
    templates::{TemplateError, extract_template_expressions, is_template, select_path, split_dependency},
};

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to read declaration document {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON declaration document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML declaration document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("template source '{0}' must declare what it requires")]
    TemplateWithoutRequires(String),

    #[error("template source '{template}' refers to '{name}', which is not in its requires list")]
    UnknownReference { template: String, name: String },

    #[error("template source is malformed: {0}")]
    Template(#[from] TemplateError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeclarationDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub sources: Vec<DocumentEntry>,
}

/// A bare path or a full declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentEntry {
    Path(String),
    Declaration(DeclarationSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeclarationSpec {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// `null` entries refer to the keyless declaration.
    #[serde(default, deserialize_with = "deserialize_requires", skip_serializing_if = "Option::is_none")]
    pub requires: Option<Vec<Option<String>>>,
    /// Refresh interval in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<u64>,
    #[serde(default)]
    pub query: bool,
    /// Dot path applied to the payload before it is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RequiresField {
    One(String),
    Many(Vec<Option<String>>),
}

/// `requires: user`, `requires: [user, null]`, and `requires: null` are all accepted.
fn deserialize_requires<'de, D>(deserializer: D) -> Result<Option<Vec<Option<String>>>, D::Error>
where
    D: Deserializer<'de>,
{
    let field = Option::<RequiresField>::deserialize(deserializer)?;
    Ok(Some(match field {
        None => vec![None],
        Some(RequiresField::One(key)) => vec![Some(key)],
        Some(RequiresField::Many(keys)) => keys,
    }))
}

impl DeclarationSpec {
    pub fn to_declaration(&self) -> Result<Declaration, DocumentError> {
        let requires: Vec<Requirement> = self
            .requires
            .iter()
            .flatten()
            .map(|key| match key {
                Some(key) => Requirement::Key(key.clone()),
                None => Requirement::Default,
            })
            .collect();

        let mut declaration = if is_template(&self.source) {
            validate_template(&self.source, &requires)?;
            Declaration::template(self.source.clone())
        } else {
            Declaration::new(self.source.clone())
        };
        declaration.requires = requires;
        declaration.key = self.key.clone();
        declaration.refresh = self.refresh.map(Duration::from_secs);
        declaration.query = self.query;
        if let Some(path) = self.select.clone() {
            declaration = declaration.transform(move |value, _| select_path(&value, Some(&path)).unwrap_or(Value::Null));
        }
        Ok(declaration)
    }
}

fn validate_template(source: &str, requires: &[Requirement]) -> Result<(), DocumentError> {
    if requires.is_empty() {
        return Err(DocumentError::TemplateWithoutRequires(source.to_string()));
    }
    let expressions = extract_template_expressions(source);
    if expressions.len() != source.matches("${{").count() {
        return Err(TemplateError::Unterminated(source.to_string()).into());
    }
    for expression in expressions {
        let (name, _) = split_dependency(&expression);
        if !requires.iter().any(|requirement| requirement.name() == name) {
            return Err(DocumentError::UnknownReference {
                template: source.to_string(),
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

impl DeclarationDocument {
    pub fn to_declarations(&self) -> Result<DeclarationSet, DocumentError> {
        self.sources
            .iter()
            .map(|entry| match entry {
                DocumentEntry::Path(source) => Ok(Declaration::new(source.clone())),
                DocumentEntry::Declaration(spec) => spec.to_declaration(),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(DeclarationSet::from)
    }
}

/// Loads a declaration document, choosing the format from the file extension.
///
/// `.json` files are parsed as JSON; everything else as YAML.
pub fn load_declaration_document(path: impl AsRef<Path>) -> Result<DeclarationDocument, DocumentError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let is_json = path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    if is_json {
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// A consumer whose declarations come from a document.
#[derive(Debug)]
pub struct DocumentConsumer {
    name: String,
    declarations: DeclarationSet,
}

impl DocumentConsumer {
    pub fn new(document: &DeclarationDocument) -> Result<Self, DocumentError> {
        Ok(Self {
            name: document.name.clone().unwrap_or_else(|| "document".to_string()),
            declarations: document.to_declarations()?,
        })
    }
}

impl Consumer for DocumentConsumer {
    fn sources(&self, _location: &Location) -> DeclarationSet {
        self.declarations.clone()
    }

    fn on_data(&self, data: &Value) {
        trace!(consumer = %self.name, keys = data.as_object().map(|map| map.len()).unwrap_or(0), "document consumer updated");
    }
}
