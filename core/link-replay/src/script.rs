//! JSON-lines replay scripts.
//!
//! One step per line, `at_ms` relative to the start of the run:
//!
//! ```text
//! {"at_ms": 0,    "command": "start"}
//! {"at_ms": 0,    "command": "connect"}
//! {"at_ms": 200,  "push": {"channel": "qr", "payload": "2@abc"}}
//! {"at_ms": 9000, "backend": {"connected": true, "fail": ["repair_connection"]}}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Failed to read script {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: {details}")]
    Parse { line: usize, details: String },

    #[error("Line {line}: at_ms {at_ms} is earlier than the previous step ({previous})")]
    OutOfOrder { line: usize, at_ms: u64, previous: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserCommand {
    Start,
    Connect,
    Disconnect,
    Logout,
}

/// Changes to the simulated backend's behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendPatch {
    #[serde(default)]
    pub connected: Option<bool>,
    #[serde(default)]
    pub session: Option<bool>,
    /// Operations that start failing (`connect`, `repair_connection`, ...).
    #[serde(default)]
    pub fail: Vec<String>,
    /// Operations that start succeeding again.
    #[serde(default)]
    pub heal: Vec<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Command(UserCommand),
    Push(Value),
    Backend(BackendPatch),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptLine {
    #[serde(default)]
    pub at_ms: u64,
    #[serde(flatten)]
    pub step: Step,
}

pub fn read_script(path: &Path) -> Result<Vec<ScriptLine>, ScriptError> {
    let contents = fs_err::read_to_string(path).map_err(|source| ScriptError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_script(&contents)
}

pub fn parse_script(contents: &str) -> Result<Vec<ScriptLine>, ScriptError> {
    let mut steps = Vec::new();
    let mut previous = 0u64;

    for (index, raw) in contents.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let step: ScriptLine = serde_json::from_str(trimmed).map_err(|err| ScriptError::Parse {
            line,
            details: err.to_string(),
        })?;
        if step.at_ms < previous {
            return Err(ScriptError::OutOfOrder {
                line,
                at_ms: step.at_ms,
                previous,
            });
        }
        previous = step.at_ms;
        steps.push(step);
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn parses_every_step_kind() {
        let script = r#"
# pairing
{"at_ms": 0, "command": "connect"}
{"at_ms": 10, "push": {"channel": "ready", "payload": {}}}
{"at_ms": 20, "backend": {"connected": true, "fail": ["repair_connection"]}}
"#;
        let steps = parse_script(script).unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].step, Step::Command(UserCommand::Connect));
        assert_eq!(
            steps[1].step,
            Step::Push(json!({"channel": "ready", "payload": {}}))
        );
        let Step::Backend(patch) = &steps[2].step else {
            panic!("expected backend patch");
        };
        assert_eq!(patch.connected, Some(true));
        assert_eq!(patch.fail, vec!["repair_connection".to_string()]);
    }

    #[test]
    fn rejects_steps_that_go_back_in_time() {
        let script = concat!(
            "{\"at_ms\": 50, \"command\": \"connect\"}\n",
            "{\"at_ms\": 10, \"command\": \"logout\"}\n",
        );
        let err = parse_script(script).unwrap_err();
        assert!(matches!(err, ScriptError::OutOfOrder { line: 2, .. }));
    }

    #[test]
    fn reports_line_of_bad_json() {
        let err = parse_script("{\"command\": \"connect\"}\n{\"command\": \"dance\"}\n")
            .unwrap_err();
        assert!(matches!(err, ScriptError::Parse { line: 2, .. }));
    }

    #[test]
    fn reads_script_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"command\": \"start\"}}").unwrap();
        let steps = read_script(file.path()).unwrap();
        assert_eq!(steps[0].at_ms, 0);
        assert_eq!(steps[0].step, Step::Command(UserCommand::Start));
    }
}
