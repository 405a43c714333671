//! Counseling-practice cases.
//!
//! A case describes a client for a trainee counselor to talk to. Selecting
//! persona id `case:<id>` plays the case instead of a regular persona, and
//! the case details are handed to the supervisor review afterwards.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EmotalkError, Result};
use crate::persona::{PersonaProfile, profile_path, reply_format};

/// Persona-id prefix that selects a case.
pub const CASE_PREFIX: &str = "case:";

/// A simulated client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseProfile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupation: Option<String>,
    /// What brings the client in.
    #[serde(default)]
    pub presenting_issue: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_goals: Vec<String>,
    /// Role-play directive. Blank means one is built from the fields above.
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
}

/// Listing entry for case pickers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSummary {
    pub id: String,
    pub name: String,
    pub presenting_issue: String,
}

impl CaseProfile {
    /// Bullet list of the client details, for directives and reviews.
    pub fn context(&self) -> String {
        let mut lines = Vec::new();
        if !self.name.trim().is_empty() {
            lines.push(format!("- Name: {}", self.name));
        }
        if let Some(age) = self.age {
            lines.push(format!("- Age: {age}"));
        }
        if let Some(gender) = self.gender.as_deref().filter(|g| !g.trim().is_empty()) {
            lines.push(format!("- Gender: {gender}"));
        }
        if let Some(occupation) = self.occupation.as_deref().filter(|o| !o.trim().is_empty()) {
            lines.push(format!("- Occupation: {occupation}"));
        }
        if !self.presenting_issue.trim().is_empty() {
            lines.push(format!("- Presenting issue: {}", self.presenting_issue));
        }
        if !self.session_goals.is_empty() {
            lines.push(format!("- Session goals: {}", self.session_goals.join(", ")));
        }
        if lines.is_empty() {
            "(no case information)".to_string()
        } else {
            lines.join("\n")
        }
    }

    fn directive(&self) -> String {
        if !self.system_prompt.trim().is_empty() {
            return self.system_prompt.clone();
        }
        format!(
            "You are playing a counseling client so that a trainee counselor can practice. \
             Stay in character as the client described below and never act as the counselor. \
             Open up gradually, the way a real client would.\n\n{}\n\n{}",
            self.context(),
            reply_format!()
        )
    }

    /// The persona a session runs with when this case is selected.
    pub fn to_persona(&self) -> PersonaProfile {
        PersonaProfile {
            id: format!("{CASE_PREFIX}{}", self.id),
            name: self.name.clone(),
            description: self.presenting_issue.clone(),
            system_prompt: self.directive(),
            voice_id: self.voice_id.clone(),
        }
    }

    pub fn summary(&self) -> CaseSummary {
        CaseSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            presenting_issue: self.presenting_issue.clone(),
        }
    }
}

/// Reads `<dir>/<id>.json` case files.
pub struct FileCaseStore {
    dir: PathBuf,
}

impl FileCaseStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Load a case. `Ok(None)` when it does not exist.
    pub async fn load(&self, id: &str) -> Result<Option<CaseProfile>> {
        let Some(path) = profile_path(&self.dir, id) else {
            warn!(case = id, "Rejected case id");
            return Ok(None);
        };
        if !path.exists() {
            debug!(path = %path.display(), "Case file not found");
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let case: CaseProfile = serde_json::from_str(&data)
            .map_err(|e| EmotalkError::Persona(format!("invalid case {id}: {e}")))?;
        Ok(Some(case))
    }

    pub async fn list(&self) -> Result<Vec<CaseSummary>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut cases = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match tokio::fs::read_to_string(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), %e, "Skipping unreadable case");
                    continue;
                }
            };
            match serde_json::from_str::<CaseProfile>(&data) {
                Ok(case) => cases.push(case.summary()),
                Err(e) => warn!(path = %path.display(), %e, "Skipping invalid case"),
            }
        }
        cases.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(cases)
    }
}
