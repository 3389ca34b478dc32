use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a document came from. Closed set: pasted/uploaded text or a URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    Upload { label: String },
    Url { url: String },
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Upload { label } => write!(f, "upload:{label}"),
            Origin::Url { url } => write!(f, "{url}"),
        }
    }
}

/// Stable source identity: the same label or URL always maps to the same
/// document id, which is what makes re-ingestion a replace instead of a
/// silent duplicate.
pub fn source_id(origin: &Origin) -> String {
    let mut hasher = Sha256::new();
    hasher.update(match origin {
        Origin::Upload { label } => format!("upload\x00{label}"),
        Origin::Url { url } => format!("url\x00{url}"),
    });
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// A raw knowledge source. Immutable once created; re-ingesting the same
/// origin replaces its index entries wholesale.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub origin: Origin,
    pub raw_text: String,
    pub fetched_at: DateTime<Utc>,
}

impl Document {
    pub fn new(origin: Origin, raw_text: impl Into<String>) -> Self {
        Self {
            id: source_id(&origin),
            origin,
            raw_text: raw_text.into(),
            fetched_at: Utc::now(),
        }
    }

    pub fn source_meta(&self) -> SourceMeta {
        SourceMeta {
            document_id: self.id.clone(),
            origin: self.origin.clone(),
            fetched_at: self.fetched_at,
        }
    }
}

/// One passage cut from a document. `char_span` is in char offsets into the
/// document's raw text; spans of consecutive chunks overlap by at most the
/// configured overlap and together cover the text exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub position_index: usize,
    pub char_span: (usize, usize),
    pub text: String,
}

/// Citation payload carried by every index entry and every answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceMeta {
    pub document_id: String,
    pub origin: Origin,
    pub fetched_at: DateTime<Utc>,
}

/// A scored passage returned by similarity search. Ephemeral; never stored.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedPassage {
    pub chunk_id: String,
    pub text: String,
    pub source: SourceMeta,
    pub score: f32,
}

/// The tools the reasoning agent may invoke. Dispatch is an explicit match
/// on this enum.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolInvocation {
    Retrieve { query: String },
}

#[derive(Debug, Clone, Serialize)]
pub enum ToolOutcome {
    Passages(Vec<RetrievedPassage>),
    Failed(String),
}

/// One step of the agent's reasoning trace, streamed to the caller as it is
/// produced.
#[derive(Debug, Clone, Serialize)]
pub struct ReasoningStep {
    pub step_index: usize,
    pub thought: String,
    pub tool: Option<ToolInvocation>,
    pub tool_result: Option<ToolOutcome>,
}

/// The agent's final output: answer text, deduplicated citations drawn from
/// the retrieved passages, the full trace, and whether the step ceiling was
/// hit before the model chose to answer.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<SourceMeta>,
    pub reasoning_trace: Vec<ReasoningStep>,
    pub budget_exhausted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_is_stable_per_origin() {
        let a = Origin::Url {
            url: "https://example.com/a".into(),
        };
        let b = Origin::Url {
            url: "https://example.com/b".into(),
        };
        assert_eq!(source_id(&a), source_id(&a));
        assert_ne!(source_id(&a), source_id(&b));
    }

    #[test]
    fn upload_and_url_ids_do_not_collide() {
        let upload = Origin::Upload {
            label: "notes".into(),
        };
        let url = Origin::Url {
            url: "notes".into(),
        };
        assert_ne!(source_id(&upload), source_id(&url));
    }

    #[test]
    fn reingested_document_keeps_its_id() {
        let origin = Origin::Upload {
            label: "weather".into(),
        };
        let first = Document::new(origin.clone(), "v1");
        let second = Document::new(origin, "v2 with more text");
        assert_eq!(first.id, second.id);
    }
}
