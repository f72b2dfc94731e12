//! Evaluation cases and reference snippets
//!
//! A dataset is a JSON array of counterfactual edit cases. Each case
//! carries one requested rewrite plus paraphrase and neighborhood prompt
//! sets. The nested [`EditRequest`] is the only mutable part: target
//! construction rewrites `target_new` / `request_baseline` before the edit
//! is applied.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// A token-level edit target: surface string plus a benchmark identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetToken {
    pub str: String,
    pub id: String,
}

/// One requested factual rewrite
///
/// `prompt` is a template with a `{}` placeholder for the subject.
/// `target_new` and `request_baseline` are always populated before the
/// edit applicator runs; their source depends on the active objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRequest {
    pub subject: String,
    pub prompt: String,
    pub target_true: TargetToken,
    pub target_new: TargetToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_baseline: Option<String>,
}

impl EditRequest {
    /// The prompt with the subject substituted in
    pub fn full_prompt(&self) -> String {
        self.prompt.replace("{}", &self.subject)
    }
}

/// One evaluation case: rewrite plus generalization/specificity prompts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRecord {
    pub case_id: serde_json::Value,
    pub requested_rewrite: EditRequest,
    pub paraphrase_prompts: Vec<String>,
    pub neighborhood_prompts: Vec<String>,
}

impl CaseRecord {
    /// Case id rendered for file names (`case_<id>.json`)
    pub fn case_id_string(&self) -> String {
        match &self.case_id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A loaded evaluation dataset
#[derive(Debug, Clone)]
pub struct Dataset {
    cases: Vec<CaseRecord>,
}

impl Dataset {
    /// Load a dataset by registry name; unknown names are fatal
    ///
    /// `"cf"` is the counterfactual edit benchmark format. `limit`
    /// truncates to the first n cases.
    pub fn load(name: &str, path: &Path, limit: Option<usize>) -> Result<Self> {
        match name {
            "cf" => Self::load_cf(path, limit),
            other => bail!("unknown dataset name {other:?} (expected \"cf\")"),
        }
    }

    fn load_cf(path: &Path, limit: Option<usize>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dataset {}", path.display()))?;
        let mut cases: Vec<CaseRecord> = serde_json::from_str(&content)
            .with_context(|| format!("invalid dataset file {}", path.display()))?;
        if let Some(n) = limit {
            cases.truncate(n);
        }
        Ok(Self { cases })
    }

    pub fn cases(&self) -> &[CaseRecord] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

/// Reference essence texts per subject
///
/// Backs the essence-drift metric. Subjects without stored texts get
/// continuations generated from the unedited model and recorded here so
/// the post-edit evaluation scores against the same references.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnippetStore {
    pub names_to_samples: HashMap<String, Vec<String>>,
}

impl SnippetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON object of subject → texts; absent file is an empty store
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read snippets {}", p.display()))?;
                let names_to_samples = serde_json::from_str(&content)
                    .with_context(|| format!("invalid snippet file {}", p.display()))?;
                Ok(Self { names_to_samples })
            }
            _ => Ok(Self::new()),
        }
    }

    pub fn get(&self, subject: &str) -> Option<&Vec<String>> {
        self.names_to_samples.get(subject)
    }

    pub fn insert(&mut self, subject: String, texts: Vec<String>) {
        self.names_to_samples.insert(subject, texts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"[
        {
            "case_id": 0,
            "requested_rewrite": {
                "subject": "Eiffel Tower",
                "prompt": "The {} is located in",
                "target_true": {"str": " Paris", "id": "Q90"},
                "target_new": {"str": " Rome", "id": "Q220"}
            },
            "paraphrase_prompts": ["Where is the Eiffel Tower?"],
            "neighborhood_prompts": ["The Louvre is located in"]
        },
        {
            "case_id": 1,
            "requested_rewrite": {
                "subject": "Colosseum",
                "prompt": "The {} is located in",
                "target_true": {"str": " Rome", "id": "Q220"},
                "target_new": {"str": " Paris", "id": "Q90"}
            },
            "paraphrase_prompts": [],
            "neighborhood_prompts": []
        }
    ]"#;

    #[test]
    fn cf_dataset_loads_and_truncates() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{SAMPLE}").unwrap();

        let ds = Dataset::load("cf", file.path(), None).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(
            ds.cases()[0].requested_rewrite.full_prompt(),
            "The Eiffel Tower is located in"
        );

        let ds = Dataset::load("cf", file.path(), Some(1)).unwrap();
        assert_eq!(ds.len(), 1);
    }

    #[test]
    fn unknown_dataset_name_is_fatal() {
        let file = NamedTempFile::new().unwrap();
        assert!(Dataset::load("zsre", file.path(), None).is_err());
    }

    #[test]
    fn request_baseline_roundtrips_when_set() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{SAMPLE}").unwrap();
        let ds = Dataset::load("cf", file.path(), None).unwrap();

        let mut request = ds.cases()[0].requested_rewrite.clone();
        assert!(request.request_baseline.is_none());
        request.request_baseline = Some(" Paris".to_string());

        let json = serde_json::to_string(&request).unwrap();
        let back: EditRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_baseline.as_deref(), Some(" Paris"));
    }
}
