//! The message a worker process writes back to the scheduler.
//!
//! One JSON object on stdout: `{"ok": true, "result": <RunReport>}` on success
//! or `{"ok": false, "result": {"startedAt", "endedAt", "errorSnippet"}}` when
//! the probe failed.

use beacon_scheduler::{RunFailure, RunReport, UnitError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkerError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub ok: bool,
    pub result: Value,
}

impl WorkerMessage {
    pub fn success(report: &RunReport) -> Result<Self, WorkerError> {
        Ok(Self {
            ok: true,
            result: serde_json::to_value(report)?,
        })
    }

    pub fn failure(failure: &RunFailure) -> Result<Self, WorkerError> {
        Ok(Self {
            ok: false,
            result: serde_json::to_value(failure)?,
        })
    }

    /// Build the message for an executor result.
    pub fn from_result(result: Result<RunReport, UnitError>) -> Result<Self, WorkerError> {
        match result {
            Ok(report) => Self::success(&report),
            Err(error) => Self::failure(&error.into_failure()),
        }
    }

    /// Parse the last non-empty line of a worker's stdout.
    pub fn parse(stdout: &str) -> Result<Self, WorkerError> {
        let line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| WorkerError::InvalidOutput("no output".to_string()))?;

        serde_json::from_str(line).map_err(|e| {
            WorkerError::InvalidOutput(format!("{e} (stdout: {})", truncate(line, 200)))
        })
    }

    /// Decode the payload into the executor's result type.
    pub fn into_unit_result(self) -> Result<RunReport, UnitError> {
        if self.ok {
            serde_json::from_value(self.result).map_err(|e| {
                UnitError::Crashed(WorkerError::InvalidOutput(format!("bad report: {e}")).to_string())
            })
        } else {
            let failure = serde_json::from_value::<RunFailure>(self.result)
                .unwrap_or_else(|e| RunFailure::new(format!("worker reported a failure: {e}")));
            Err(UnitError::Reported(failure))
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_success_message_shape() {
        let now = Utc::now();
        let report = RunReport {
            started_at: now,
            ended_at: now,
            title: Some("Example Domain".to_string()),
            final_url: Some("https://example.com/".to_string()),
            http_status: Some(200),
            screenshot_path: None,
        };
        let message = WorkerMessage::success(&report).unwrap();
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["ok"], true);
        assert_eq!(json["result"]["title"], "Example Domain");
        assert_eq!(json["result"]["httpStatus"], 200);
        assert_eq!(message.into_unit_result().unwrap(), report);
    }

    #[test]
    fn test_failure_message_decodes_to_reported() {
        let stdout = r#"{"ok":false,"result":{"startedAt":"2024-05-01T12:00:00Z","endedAt":"2024-05-01T12:00:01Z","errorSnippet":"net::ERR_NAME_NOT_RESOLVED"}}"#;
        let message = WorkerMessage::parse(stdout).unwrap();
        match message.into_unit_result() {
            Err(UnitError::Reported(failure)) => {
                assert_eq!(failure.error_snippet, "net::ERR_NAME_NOT_RESOLVED");
                assert!(failure.started_at.is_some());
            }
            other => panic!("expected reported failure, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_uses_last_line() {
        let stdout = "starting probe\n{\"ok\":false,\"result\":{\"errorSnippet\":\"boom\"}}\n\n";
        let message = WorkerMessage::parse(stdout).unwrap();
        assert!(!message.ok);
    }

    #[test]
    fn test_garbage_is_invalid_output() {
        assert!(matches!(
            WorkerMessage::parse("segfault"),
            Err(WorkerError::InvalidOutput(_))
        ));
        assert!(matches!(
            WorkerMessage::parse("   \n"),
            Err(WorkerError::InvalidOutput(_))
        ));
    }

    #[test]
    fn test_bad_report_is_a_crash() {
        let message = WorkerMessage {
            ok: true,
            result: serde_json::json!({ "title": 7 }),
        };
        assert!(matches!(
            message.into_unit_result(),
            Err(UnitError::Crashed(_))
        ));
    }
}
