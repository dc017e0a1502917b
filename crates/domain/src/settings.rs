//! Runtime settings shared by the orchestrator and its components.
//!
//! The struct deserializes from TOML/JSON with per-field defaults; API
//! keys and endpoints are read from the environment by the provider
//! adapters, never stored here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory backing the local key/value storage.
    #[serde(default = "d_storage_path")]
    pub storage_path: String,

    /// Provider used when neither the prompt input nor the session binds one
    /// and the model prefix is not recognized.
    #[serde(default = "d_default_provider")]
    pub default_provider_id: String,

    /// Model used when neither the prompt input nor the session binds one.
    #[serde(default = "d_default_model")]
    pub default_model_id: String,

    /// How long the question tool waits for an out-of-band reply.
    #[serde(default = "d_question_timeout")]
    pub question_timeout_secs: u64,

    /// How many times the loop re-prompts about unfinished todos before
    /// letting the turn end.
    #[serde(default = "d_max_todo_reminders")]
    pub max_todo_reminders: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_path: d_storage_path(),
            default_provider_id: d_default_provider(),
            default_model_id: d_default_model(),
            question_timeout_secs: d_question_timeout(),
            max_todo_reminders: d_max_todo_reminders(),
        }
    }
}

fn d_storage_path() -> String {
    "./data/storage".into()
}
fn d_default_provider() -> String {
    "zai".into()
}
fn d_default_model() -> String {
    "zai/glm-4.7-flash".into()
}
fn d_question_timeout() -> u64 {
    300
}
fn d_max_todo_reminders() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.default_provider_id, "zai");
        assert_eq!(s.default_model_id, "zai/glm-4.7-flash");
        assert_eq!(s.question_timeout_secs, 300);
        assert_eq!(s.max_todo_reminders, 2);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let s: Settings = toml::from_str(
            r#"
storage_path = "/tmp/maestro"
"#,
        )
        .unwrap();
        assert_eq!(s.storage_path, "/tmp/maestro");
        assert_eq!(s.question_timeout_secs, 300);
    }
}
