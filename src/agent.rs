use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::generation::{leading_thought, ChatMessage, Directive, GenerationProvider};
use crate::knowledge::KnowledgeBase;
use crate::models::{
    Answer, ReasoningStep, RetrievedPassage, SourceMeta, ToolInvocation, ToolOutcome,
};

const SYSTEM_PROMPT: &str = "\
You are a research assistant with access to a knowledge-base search tool.
Work step by step. End every reply with exactly one directive:

  SEARCH(\"<query>\")  look up passages relevant to <query>
  FINAL(<answer>)     give your final answer

Search before answering. Retrieved passages arrive numbered [1], [2], ...
and keep their numbers for the whole conversation. In FINAL, cite the
passages that support each claim by number, like [1]. Cite only passages
you have actually seen. If the knowledge base has nothing relevant, say so
plainly in FINAL.";

const NUDGE: &str =
    "Reply with a directive: SEARCH(\"...\") to look something up, or FINAL(...) to answer.";

/// Drives the bounded reason-retrieve-answer loop over a knowledge base and
/// a generation provider.
///
/// The loop runs THINKING steps up to `max_steps`. Each step either calls
/// the retrieve tool, records a free-form thought, or ends with the final
/// answer. Hitting the ceiling forces an answer from the evidence gathered
/// so far and flags the result, never errors. Every step streams to the
/// caller as it is produced.
pub struct ReasoningAgent {
    kb: Arc<KnowledgeBase>,
    generator: Arc<dyn GenerationProvider>,
    config: AgentConfig,
}

impl ReasoningAgent {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        generator: Arc<dyn GenerationProvider>,
        config: AgentConfig,
    ) -> Self {
        Self {
            kb,
            generator,
            config,
        }
    }

    /// Collecting wrapper around [`ask_streaming`](Self::ask_streaming).
    /// The channel is sized so the producer never blocks on the unread
    /// steps (the trace also lands on the returned Answer).
    pub async fn ask(&self, question: &str) -> Result<Answer> {
        let (tx, mut rx) = mpsc::channel(self.config.max_steps * 2 + 2);
        let answer = self.ask_streaming(question, tx).await;
        rx.close();
        answer
    }

    /// Answer a question, emitting each reasoning step through `steps` as
    /// it happens. Dropping the receiver cancels the query cleanly between
    /// steps; the index is never touched by a query, so cancellation cannot
    /// corrupt it.
    pub async fn ask_streaming(
        &self,
        question: &str,
        steps: mpsc::Sender<ReasoningStep>,
    ) -> Result<Answer> {
        let query_id = Uuid::new_v4();
        info!(%query_id, question, "starting query");

        let mut trace: Vec<ReasoningStep> = Vec::new();
        let mut evidence: Vec<RetrievedPassage> = Vec::new();
        let mut transcript = vec![ChatMessage::user(format!("Question: {question}"))];
        let mut final_text: Option<String> = None;
        let mut generation_down = false;

        while trace.len() < self.config.max_steps {
            let step_index = trace.len();
            let response = match self.generator.generate(SYSTEM_PROMPT, &transcript).await {
                Ok(r) => r,
                Err(e) => {
                    // Answer from whatever evidence is already gathered
                    // instead of burning the remaining steps.
                    warn!(%query_id, error = %e, "generation failed mid-reasoning");
                    generation_down = true;
                    break;
                }
            };

            match Directive::parse(&response) {
                Directive::Final(text) => {
                    debug!(%query_id, step_index, "model chose to answer");
                    final_text = Some(text);
                    break;
                }
                Directive::Search(query) => {
                    transcript.push(ChatMessage::assistant(response.as_str()));
                    let (outcome, tool_report) = self
                        .run_retrieve(&query_id, &query, &mut evidence)
                        .await;
                    let thought = non_empty_or(leading_thought(&response), "searching the knowledge base");
                    let step = ReasoningStep {
                        step_index,
                        thought,
                        tool: Some(ToolInvocation::Retrieve { query }),
                        tool_result: Some(outcome),
                    };
                    self.emit(&steps, &mut trace, step).await?;
                    transcript.push(ChatMessage::user(tool_report));
                }
                Directive::Unstructured => {
                    transcript.push(ChatMessage::assistant(response.as_str()));
                    transcript.push(ChatMessage::user(NUDGE));
                    let step = ReasoningStep {
                        step_index,
                        thought: response,
                        tool: None,
                        tool_result: None,
                    };
                    self.emit(&steps, &mut trace, step).await?;
                }
            }
        }

        let budget_exhausted = final_text.is_none() && !generation_down;
        let text = match final_text {
            Some(t) => t,
            // Forced synthesis: the step ceiling was hit or generation
            // dropped out. A provider failure here is fatal to the query;
            // the partial trace has already been streamed.
            None => self.synthesize(question, &evidence).await?,
        };

        let citations = extract_citations(&text, &evidence);
        let closing = ReasoningStep {
            step_index: trace.len(),
            thought: if budget_exhausted {
                "step budget exhausted, answering from gathered evidence".to_string()
            } else {
                "composing the final answer".to_string()
            },
            tool: None,
            tool_result: None,
        };
        self.emit(&steps, &mut trace, closing).await?;

        info!(
            %query_id,
            steps = trace.len(),
            citations = citations.len(),
            budget_exhausted,
            "query complete"
        );
        Ok(Answer {
            text,
            citations,
            reasoning_trace: trace,
            budget_exhausted,
        })
    }

    /// Run one retrieve tool call. Failures degrade the step and let the
    /// loop continue with whatever context it already has.
    async fn run_retrieve(
        &self,
        query_id: &Uuid,
        query: &str,
        evidence: &mut Vec<RetrievedPassage>,
    ) -> (ToolOutcome, String) {
        match self.kb.retrieve(query, self.config.top_k).await {
            Ok(passages) => {
                let mut numbered = Vec::new();
                for passage in &passages {
                    let number = match evidence.iter().position(|e| e.chunk_id == passage.chunk_id)
                    {
                        Some(i) => i + 1,
                        None => {
                            evidence.push(passage.clone());
                            evidence.len()
                        }
                    };
                    numbered.push((number, passage.clone()));
                }
                let report = if numbered.is_empty() {
                    "No passages matched that query.".to_string()
                } else {
                    numbered
                        .iter()
                        .map(|(n, p)| {
                            format!("[{n}] ({} score={:.3})\n{}", p.source.origin, p.score, p.text)
                        })
                        .collect::<Vec<_>>()
                        .join("\n\n")
                };
                (ToolOutcome::Passages(passages), report)
            }
            Err(e) => {
                warn!(%query_id, error = %e, "retrieval failed, continuing without it");
                (
                    ToolOutcome::Failed(e.to_string()),
                    format!("Search failed ({e}). Reason with the passages you already have."),
                )
            }
        }
    }

    /// One direct generation call that turns the accumulated evidence into
    /// an answer, used when the loop ends without a FINAL directive.
    async fn synthesize(&self, question: &str, evidence: &[RetrievedPassage]) -> Result<String> {
        let context = if evidence.is_empty() {
            "(no passages were retrieved)".to_string()
        } else {
            format_evidence(evidence)
        };
        let prompt = format!(
            "Question: {question}\n\nRetrieved passages:\n{context}\n\n\
             Answer the question from these passages, citing them by number \
             like [1]. If they do not contain the answer, say so plainly."
        );
        let response = self
            .generator
            .generate(SYSTEM_PROMPT, &[ChatMessage::user(prompt)])
            .await?;
        Ok(match Directive::parse(&response) {
            Directive::Final(text) => text,
            _ => response,
        })
    }

    async fn emit(
        &self,
        steps: &mpsc::Sender<ReasoningStep>,
        trace: &mut Vec<ReasoningStep>,
        step: ReasoningStep,
    ) -> Result<()> {
        trace.push(step.clone());
        steps.send(step).await.map_err(|_| Error::Cancelled)
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn format_evidence(evidence: &[RetrievedPassage]) -> String {
    evidence
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[{}] ({} score={:.3})\n{}", i + 1, p.source.origin, p.score, p.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Map `[n]` markers in the answer text onto the numbered evidence list,
/// deduplicated in first-mention order. A marker-free answer cites every
/// passage seen in the trace. Citations can only name retrieved passages.
fn extract_citations(text: &str, evidence: &[RetrievedPassage]) -> Vec<SourceMeta> {
    let mut cited: Vec<SourceMeta> = Vec::new();
    let mut any_marker = false;
    for number in bracket_numbers(text) {
        if let Some(passage) = number.checked_sub(1).and_then(|i| evidence.get(i)) {
            any_marker = true;
            if !cited.contains(&passage.source) {
                cited.push(passage.source.clone());
            }
        }
    }
    if !any_marker {
        for passage in evidence {
            if !cited.contains(&passage.source) {
                cited.push(passage.source.clone());
            }
        }
    }
    cited
}

fn bracket_numbers(text: &str) -> Vec<usize> {
    let bytes = text.as_bytes();
    let mut numbers = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            let mut j = i + 1;
            let mut value: usize = 0;
            let mut digits = 0;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                value = value * 10 + (bytes[j] - b'0') as usize;
                digits += 1;
                j += 1;
            }
            if digits > 0 && j < bytes.len() && bytes[j] == b']' {
                numbers.push(value);
                i = j;
            }
        }
        i += 1;
    }
    numbers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Origin;
    use chrono::Utc;

    fn passage(chunk_id: &str, doc: &str) -> RetrievedPassage {
        RetrievedPassage {
            chunk_id: chunk_id.to_string(),
            text: "text".into(),
            source: SourceMeta {
                document_id: doc.to_string(),
                origin: Origin::Upload {
                    label: doc.to_string(),
                },
                fetched_at: Utc::now(),
            },
            score: 0.5,
        }
    }

    #[test]
    fn test_bracket_numbers() {
        assert_eq!(bracket_numbers("see [1] and [12], not [x] or ["), vec![1, 12]);
        assert!(bracket_numbers("no markers").is_empty());
    }

    #[test]
    fn test_citations_follow_markers() {
        let evidence = vec![passage("a", "doc-a"), passage("b", "doc-b")];
        let cited = extract_citations("blue [2]", &evidence);
        assert_eq!(cited.len(), 1);
        assert_eq!(cited[0].document_id, "doc-b");
    }

    #[test]
    fn test_marker_free_answer_cites_all_evidence() {
        let evidence = vec![passage("a", "doc-a"), passage("b", "doc-b")];
        let cited = extract_citations("blue", &evidence);
        assert_eq!(cited.len(), 2);
    }

    #[test]
    fn test_out_of_range_markers_never_cite() {
        let evidence = vec![passage("a", "doc-a")];
        let cited = extract_citations("blue [7]", &evidence);
        // Falls back to the evidence actually seen; [7] names nothing.
        assert_eq!(cited.len(), 1);
        assert_eq!(cited[0].document_id, "doc-a");
    }

    #[test]
    fn test_duplicate_markers_deduplicate() {
        let evidence = vec![passage("a", "doc-a")];
        let cited = extract_citations("[1] and again [1]", &evidence);
        assert_eq!(cited.len(), 1);
    }

    #[test]
    fn test_no_evidence_no_citations() {
        assert!(extract_citations("anything [1]", &[]).is_empty());
    }
}
