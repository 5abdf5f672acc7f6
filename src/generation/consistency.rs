//! Cross-page consistency review.
//!
//! Runs once after the last batch when more than one page was generated. Findings are logged
//! and returned for the job diagnostics; they are never applied to the generated files.

use super::budget::{choose_for_consistency, TokenBudget};
use super::parse::extract_json;
use super::prompt;
use super::worker::GenerationWorker;
use crate::error::{GenerationError, ParseError};
use crate::job::{ConsistencyIssue, GeneratedFile, JobDiagnostics};
use crate::planner::FileKind;
use serde_json::Value;
use tracing::{debug, info, warn};

impl GenerationWorker {
    pub async fn review_consistency(
        &self,
        files: &[GeneratedFile],
        budget: &mut TokenBudget,
        diagnostics: &mut JobDiagnostics,
    ) -> Vec<ConsistencyIssue> {
        let pages: Vec<&GeneratedFile> = files
            .iter()
            .filter(|file| FileKind::classify(&file.path) == FileKind::HtmlPage)
            .collect();
        if pages.len() < 2 {
            debug!(pages = pages.len(), "Skipping consistency review");
            return Vec::new();
        }

        let messages = prompt::consistency_messages(&pages);
        let choice = choose_for_consistency(budget, &self.models);
        debug!(
            pages = pages.len(),
            model = %choice.model.id,
            premium = choice.is_premium(),
            "Requesting consistency review"
        );

        let result = self
            .client
            .complete(messages, &choice.model.id, self.options.clone())
            .await;
        let parsed = match result {
            Ok(response) => {
                diagnostics.record_usage(&choice.model.id, choice.is_premium(), response.usage);
                choice.settle(budget, response.usage, true);
                parse_issues(&response.content).map_err(GenerationError::from)
            }
            Err(err) => {
                choice.settle(budget, None, false);
                Err(GenerationError::from(err))
            }
        };

        match parsed {
            Ok(issues) => {
                for issue in &issues {
                    warn!(
                        file = %issue.file,
                        issue = %issue.issue,
                        fix = %issue.fix,
                        "Consistency issue"
                    );
                }
                info!(pages = pages.len(), issues = issues.len(), "Consistency review done");
                issues
            }
            Err(error) => {
                warn!(error = %error, "Consistency review failed; continuing without it");
                Vec::new()
            }
        }
    }
}

/// Accepts `[...]` or `{"issues": [...]}`.
pub fn parse_issues(content: &str) -> Result<Vec<ConsistencyIssue>, ParseError> {
    let value = match extract_json(content)? {
        Value::Object(mut map) => map
            .remove("issues")
            .ok_or_else(|| ParseError::Shape("object without 'issues'".to_string()))?,
        other => other,
    };
    serde_json::from_value(value).map_err(|e| ParseError::Shape(e.to_string()))
}
