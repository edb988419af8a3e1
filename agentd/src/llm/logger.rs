//! Raw LLM exchange logger.
//!
//! Process-wide, init-once, append-only: every request/response pair goes
//! into one JSONL file per day under the log directory. Passed around as an
//! explicit handle, never a module global.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;

/// Daily-rotated raw exchange log.
pub struct RawLlmLogger {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl RawLlmLogger {
    pub fn new(dir: impl Into<PathBuf>) -> eyre::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Append one exchange. Logging failures are swallowed with a warning;
    /// the exchange itself must never fail because of the log.
    pub fn log(&self, provider: &str, request: &Value, response: &Value) {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "provider": provider,
            "request": request,
            "response": response,
        });

        let path = self.dir.join(format!("llm-{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let _guard = self.write_lock.lock().expect("raw log lock");

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{entry}").and_then(|()| file.flush()));

        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "log: failed to append raw LLM exchange");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_appends_one_line_per_exchange() {
        let temp = TempDir::new().unwrap();
        let logger = RawLlmLogger::new(temp.path()).unwrap();

        logger.log("openai", &json!({"model": "m"}), &json!({"ok": true}));
        logger.log("ollama", &json!({}), &json!({}));

        let path = temp
            .path()
            .join(format!("llm-{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let content = fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 2);

        let first: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["provider"], "openai");
        assert_eq!(first["response"]["ok"], true);
    }
}
