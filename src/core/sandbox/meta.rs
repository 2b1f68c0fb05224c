use super::{SandboxOutcome, SandboxStatus};

/// Parsed `key:value` meta file written by the isolate CLI after `--run`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxMeta {
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub killed: bool,
    pub time_seconds: Option<f64>,
    pub wall_time_seconds: Option<f64>,
    pub max_rss_kb: Option<u64>,
    pub status: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetaParseError {
    #[error("line {line}: missing ':' separator")]
    MissingSeparator { line: usize },
    #[error("line {line}: invalid value '{value}' for {key}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
}

impl SandboxMeta {
    pub fn parse(text: &str) -> Result<Self, MetaParseError> {
        let mut meta = SandboxMeta::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let (key, value) = raw
                .split_once(':')
                .ok_or(MetaParseError::MissingSeparator { line })?;
            let (key, value) = (key.trim(), value.trim());
            let invalid = || MetaParseError::InvalidValue {
                line,
                key: key.to_string(),
                value: value.to_string(),
            };
            match key {
                "exitcode" => meta.exit_code = Some(value.parse().map_err(|_| invalid())?),
                "exitsig" => meta.exit_signal = Some(value.parse().map_err(|_| invalid())?),
                "killed" => meta.killed = value == "1",
                "time" => meta.time_seconds = Some(value.parse().map_err(|_| invalid())?),
                "time-wall" => {
                    meta.wall_time_seconds = Some(value.parse().map_err(|_| invalid())?)
                }
                "max-rss" => meta.max_rss_kb = Some(value.parse().map_err(|_| invalid())?),
                "status" => meta.status = Some(value.to_string()),
                "message" => meta.message = Some(value.to_string()),
                // cg-mem, csw-voluntary and friends are not tracked
                _ => {}
            }
        }
        Ok(meta)
    }

    pub fn status(&self) -> SandboxStatus {
        match self.status.as_deref() {
            None => SandboxStatus::Ok,
            Some("RE") => SandboxStatus::RuntimeError,
            Some("TO") => SandboxStatus::TimedOut,
            Some("SG") => SandboxStatus::Signaled,
            Some(_) => SandboxStatus::InternalError,
        }
    }

    pub fn into_outcome(self, stdout: String, mut stderr: String) -> SandboxOutcome {
        let status = self.status();
        if status == SandboxStatus::InternalError {
            if let Some(message) = &self.message {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(message);
            }
        }
        let duration_ms = self
            .wall_time_seconds
            .or(self.time_seconds)
            .map(|secs| (secs * 1000.0).round() as u64)
            .unwrap_or(0);
        SandboxOutcome {
            exit_code: self.exit_code.or(match status {
                SandboxStatus::Ok => Some(0),
                _ => None,
            }),
            status,
            stdout,
            stderr,
            duration_ms,
            max_rss_kb: self.max_rss_kb,
        }
    }
}
