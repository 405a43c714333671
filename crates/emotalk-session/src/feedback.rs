//! Supervisor review of a finished practice conversation.
//!
//! The reply generator is asked to act as a counseling supervisor and score
//! the trainee (the user side of the log) on six criteria. Once the log has
//! been read the review always produces a report: generator or parse errors
//! become a zero-score report that says what went wrong.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use emotalk_core::case::{CASE_PREFIX, CaseProfile};
use emotalk_core::conversation_store::{ConversationRecord, ConversationStore};
use emotalk_core::error::{EmotalkError, Result};
use emotalk_core::types::{Role, Turn};
use emotalk_providers::ReplyGenerator;

use crate::registry::Services;
use crate::reply::strip_code_fence;

/// One scored aspect of counseling practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Criterion {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

pub const CRITERIA: [Criterion; 6] = [
    Criterion {
        key: "empathy",
        name: "Empathy",
        description: "Recognized the client's feelings and responded to them appropriately",
    },
    Criterion {
        key: "active_listening",
        name: "Active listening",
        description: "Listened carefully and showed understanding of what the client said",
    },
    Criterion {
        key: "questioning",
        name: "Questioning",
        description: "Used open questions well (deduct for too many closed questions)",
    },
    Criterion {
        key: "emotion_reflection",
        name: "Emotion reflection",
        description: "Named the client's emotions and reflected them back",
    },
    Criterion {
        key: "boundaries",
        name: "Boundaries",
        description: "Held back hasty advice or judgment and kept professional boundaries",
    },
    Criterion {
        key: "summarization",
        name: "Summarization",
        description: "Summarized and structured the conversation at suitable points",
    },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackCategory {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "name_en")]
    pub key: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub comment: String,
}

/// Supervisor report for one conversation. Scores are in `[0, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFeedback {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    pub overall_score: f64,
    pub categories: Vec<FeedbackCategory>,
    pub summary: String,
    pub strengths: Vec<String>,
    pub improvements: Vec<String>,
    pub recommendations: Vec<String>,
}

impl SessionFeedback {
    /// Zero-score report explaining why no review could be produced.
    pub fn unavailable(conversation_id: &str, case_id: Option<&str>, reason: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            case_id: case_id.map(str::to_string),
            overall_score: 0.0,
            categories: Vec::new(),
            summary: format!("Feedback could not be generated: {reason}"),
            strengths: Vec::new(),
            improvements: Vec::new(),
            recommendations: vec!["Please try again.".to_string()],
        }
    }
}

#[derive(Debug, Deserialize)]
struct FeedbackRecord {
    #[serde(default = "default_overall")]
    overall_score: f64,
    #[serde(default)]
    categories: Vec<FeedbackCategory>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    improvements: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

fn default_overall() -> f64 {
    50.0
}

fn clamp_score(score: f64) -> f64 {
    score.clamp(0.0, 100.0)
}

/// Directive that turns the reply generator into a supervisor.
pub fn supervisor_directive() -> String {
    let criteria = CRITERIA
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. **{}** ({}): {}", i + 1, c.key, c.name, c.description))
        .collect::<Vec<_>>()
        .join("\n");
    let categories = CRITERIA
        .iter()
        .map(|c| {
            format!(
                r#"    {{"name": "{}", "key": "{}", "score": 0-100, "comment": "specific feedback"}}"#,
                c.name, c.key
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");

    format!(
        r#"You are a counseling supervisor. Evaluate the trainee counselor's performance on the criteria below.

## Criteria (each scored 0-100)

{criteria}

## Scoring guide
- 90-100: excellent, the level of an experienced counselor
- 70-89: good, appropriate use of counseling techniques
- 50-69: fair, basic conversation works but needs improvement
- 30-49: weak, counseling techniques need study
- 0-29: poor, the basic counseling attitude needs work

## Output
Answer ONLY with a JSON object of this shape:
{{
  "overall_score": 0-100,
  "categories": [
{categories}
  ],
  "summary": "overall feedback in three to five sentences",
  "strengths": ["..."],
  "improvements": ["..."],
  "recommendations": ["recommended study or practice"]
}}"#
    )
}

/// The conversation as `[Counselor]`/`[Client]` lines. The user of a practice
/// session is the trainee counselor.
pub fn transcript(records: &[ConversationRecord]) -> String {
    records
        .iter()
        .filter_map(|record| match record {
            ConversationRecord::Message { role, text, .. } => {
                let speaker = match role {
                    Role::User => "Counselor",
                    Role::Assistant => "Client",
                };
                Some(format!("[{speaker}] {text}"))
            }
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn review_prompt(case: Option<&CaseProfile>, transcript: &str) -> String {
    let client = case
        .map(CaseProfile::context)
        .unwrap_or_else(|| "(no case information)".to_string());
    format!(
        "This is the record of a counseling practice session. Evaluate the trainee counselor.\n\n\
         ## Client\n{client}\n\n\
         ## Conversation\n{transcript}\n\n\
         Answer with the JSON evaluation."
    )
}

/// Decode the supervisor's answer. Scores are clamped into `[0, 100]`.
pub fn parse_feedback(
    raw: &str,
    conversation_id: &str,
    case_id: Option<&str>,
) -> std::result::Result<SessionFeedback, serde_json::Error> {
    let record: FeedbackRecord = serde_json::from_str(strip_code_fence(raw))?;
    Ok(SessionFeedback {
        conversation_id: conversation_id.to_string(),
        case_id: case_id.map(str::to_string),
        overall_score: clamp_score(record.overall_score),
        categories: record
            .categories
            .into_iter()
            .map(|c| FeedbackCategory {
                score: clamp_score(c.score),
                ..c
            })
            .collect(),
        summary: record.summary,
        strengths: record.strengths,
        improvements: record.improvements,
        recommendations: record.recommendations,
    })
}

/// Scores conversations with the configured reply generator.
pub struct FeedbackService {
    generator: Option<Arc<dyn ReplyGenerator>>,
}

impl FeedbackService {
    pub fn new(generator: Option<Arc<dyn ReplyGenerator>>) -> Self {
        Self { generator }
    }

    pub async fn evaluate(
        &self,
        conversation_id: &str,
        case_id: Option<&str>,
        case: Option<&CaseProfile>,
        records: &[ConversationRecord],
    ) -> SessionFeedback {
        let transcript = transcript(records);
        if transcript.is_empty() {
            return SessionFeedback::unavailable(conversation_id, case_id, "the conversation has no turns");
        }
        let Some(generator) = &self.generator else {
            return SessionFeedback::unavailable(
                conversation_id,
                case_id,
                "reply generation is not configured",
            );
        };

        let prompt = review_prompt(case, &transcript);
        let raw = match generator
            .complete(&supervisor_directive(), &[Turn::user(prompt)])
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                error!(conversation = conversation_id, %e, "Feedback generation failed");
                return SessionFeedback::unavailable(conversation_id, case_id, &e.to_string());
            }
        };

        match parse_feedback(&raw, conversation_id, case_id) {
            Ok(feedback) => {
                info!(
                    conversation = conversation_id,
                    overall = feedback.overall_score,
                    "Feedback generated"
                );
                feedback
            }
            Err(e) => {
                warn!(conversation = conversation_id, %e, "Feedback is not valid JSON");
                SessionFeedback::unavailable(conversation_id, case_id, &format!("parse error: {e}"))
            }
        }
    }
}

/// Review a logged conversation. Fails only when the log cannot be read.
pub async fn review_conversation(services: &Services, conversation_id: &str) -> Result<SessionFeedback> {
    let store = services
        .store
        .as_ref()
        .ok_or_else(|| EmotalkError::Capability("conversation log is disabled".into()))?;
    let records = store.read(conversation_id).await?;

    let case_id = records.iter().find_map(|record| match record {
        ConversationRecord::Started { persona_id, .. } => persona_id.strip_prefix(CASE_PREFIX),
        _ => None,
    });
    let case = match case_id {
        Some(id) => services.load_case(id).await,
        None => None,
    };

    Ok(FeedbackService::new(services.reply.clone())
        .evaluate(conversation_id, case_id, case.as_ref(), &records)
        .await)
}
