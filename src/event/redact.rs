//! Secret redaction applied to every event before publication.
//!
//! Two rules, per the logging contract: any map entry whose key looks like a
//! credential is replaced with `***`, and any free text is scanned for the
//! run's known credential values and masked. Key *paths* are loggable; key
//! contents never enter the event stream in the first place.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::Event;

/// Replacement written over redacted values.
pub const MASK: &str = "***";

static SECRET_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(pass|password|token|secret|key)").expect("secret key regex"));

/// Redacts credential material from event payloads.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    /// Known credential values of the current run, longest first so nested
    /// secrets mask correctly.
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new(mut secrets: Vec<String>) -> Self {
        secrets.retain(|s| !s.is_empty());
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets.dedup();
        Self { secrets }
    }

    /// True if a free-form map key looks like it holds a credential.
    pub fn is_secret_key(key: &str) -> bool {
        SECRET_KEY_RE.is_match(key)
    }

    /// Masks occurrences of known credential values in free text.
    pub fn mask_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), MASK);
            }
        }
        out
    }

    fn mask_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.mask_text(s),
            Value::Array(items) => items.iter_mut().for_each(|v| self.mask_value(v)),
            Value::Object(map) => self.mask_map(map),
            _ => {}
        }
    }

    /// Applies both rules to a JSON map in place.
    pub fn mask_map(&self, map: &mut serde_json::Map<String, Value>) {
        for (key, value) in map.iter_mut() {
            if Self::is_secret_key(key) {
                *value = Value::String(MASK.to_string());
            } else {
                self.mask_value(value);
            }
        }
    }

    /// Returns the event with every text field and detail map redacted.
    pub fn redact_event(&self, mut event: Event) -> Event {
        match &mut event {
            Event::TaskLog { line, .. } => *line = self.mask_text(line),
            Event::TaskFailed { task, error } => {
                *error = self.mask_text(error);
                task.error = self.mask_text(&task.error);
            }
            Event::TaskSkipped { task, reason } => {
                *reason = self.mask_text(reason);
                task.error = self.mask_text(&task.error);
            }
            Event::CheckCompleted { result, .. } => {
                result.message = self.mask_text(&result.message);
                self.mask_map(&mut result.details);
            }
            _ => {}
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{CheckLevel, CheckResult};
    use crate::config::LogLevel;

    #[test]
    fn masks_known_secrets_in_text() {
        let redactor = Redactor::new(vec!["hunter2".into(), "hunter2-extended".into()]);
        assert_eq!(
            redactor.mask_text("login with hunter2-extended then hunter2"),
            "login with *** then ***"
        );
        assert_eq!(redactor.mask_text("nothing here"), "nothing here");
    }

    #[test]
    fn secret_looking_keys_are_blanked() {
        let redactor = Redactor::new(vec![]);
        let mut map = serde_json::Map::new();
        map.insert("ansible_password".into(), "x".into());
        map.insert("ssh_KEY_path".into(), "y".into());
        map.insert("kernel".into(), "5.10".into());
        redactor.mask_map(&mut map);
        assert_eq!(map["ansible_password"], MASK);
        assert_eq!(map["ssh_KEY_path"], MASK);
        assert_eq!(map["kernel"], "5.10");
    }

    #[test]
    fn redacts_log_and_check_events() {
        let redactor = Redactor::new(vec!["s3cret".into()]);
        let event = Event::TaskLog {
            host: "h1".into(),
            task_id: "h1_java_11".into(),
            level: LogLevel::Info,
            line: "auth with s3cret".into(),
        };
        match redactor.redact_event(event) {
            Event::TaskLog { line, .. } => assert_eq!(line, "auth with ***"),
            _ => unreachable!(),
        }

        let mut details = serde_json::Map::new();
        details.insert("sudo_pass".into(), "s3cret".into());
        let event = Event::CheckCompleted {
            host: "h1".into(),
            task_id: "h1_java_11".into(),
            result: CheckResult {
                check_name: "sudo".into(),
                level: CheckLevel::Error,
                passed: false,
                message: "sudo -n failed for s3cret".into(),
                details,
            },
        };
        match redactor.redact_event(event) {
            Event::CheckCompleted { result, .. } => {
                assert!(!result.message.contains("s3cret"));
                assert_eq!(result.details["sudo_pass"], MASK);
            }
            _ => unreachable!(),
        }
    }
}
