//! Isolate meta file parsing
//!
//! After every `--run`, isolate writes `key:value` lines describing the run
//! (status, CPU and wall time, memory peaks, exit code or signal).

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use crate::isolate::IsolateError;
use crate::types::{ExecutionStatus, LimitExceeded, SandboxReport};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("meta file parse error at line {line_number}: {message} (line: {line:?})")]
pub struct MetaParseError {
    /// 1-indexed
    pub line_number: usize,
    pub line: String,
    pub message: String,
}

/// Parsed meta file
#[derive(Debug, Clone, Default)]
pub struct MetaFile {
    entries: HashMap<String, String>,
}

impl MetaFile {
    /// Lenient parse; malformed lines are skipped
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim(), value.trim()))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();
        Self { entries }
    }

    /// Strict parse; any non-empty line without a `key:` prefix is an error
    pub fn try_parse(content: &str) -> Result<Self, MetaParseError> {
        let mut entries = HashMap::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let error = |message: &str| MetaParseError {
                line_number: idx + 1,
                line: line.to_owned(),
                message: message.to_owned(),
            };
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| error("missing colon separator"))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(error("empty key before colon"));
            }
            entries.insert(key.to_owned(), value.trim().to_owned());
        }
        Ok(Self { entries })
    }

    /// Read and strictly parse a meta file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, IsolateError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::try_parse(&content).map_err(|e| IsolateError::MetaParseFailed(e.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Missing status means the program exited normally
    pub fn status(&self) -> ExecutionStatus {
        self.get("status")
            .map(ExecutionStatus::from_isolate_status)
            .unwrap_or(ExecutionStatus::Ok)
    }

    /// Which limit was hit: the message wins, a bare `TO` status means CPU
    /// time and a cgroup OOM kill means memory
    pub fn limit_exceeded(&self) -> LimitExceeded {
        match LimitExceeded::from_message(self.get("message")) {
            LimitExceeded::NotExceeded if self.status() == ExecutionStatus::TimeLimitExceeded => {
                LimitExceeded::Time
            }
            LimitExceeded::NotExceeded if self.oom_killed() => LimitExceeded::Memory,
            reason => reason,
        }
    }

    fn oom_killed(&self) -> bool {
        self.get("cg-oom-killed").is_some_and(|v| v != "0")
    }

    pub fn to_report(&self) -> SandboxReport {
        let cg_memory = self.number("cg-mem");
        let max_rss = self.number("max-rss");
        SandboxReport {
            status: self.status(),
            limit_exceeded: self.limit_exceeded(),
            time: self.number("time").unwrap_or(0.0),
            wall_time: self.number("time-wall").unwrap_or(0.0),
            memory: cg_memory.or(max_rss).unwrap_or(0),
            cg_memory,
            max_rss,
            exit_code: self.number("exitcode"),
            signal: self.number("exitsig"),
            message: self.get("message").map(str::to_owned),
            killed: self.get("killed").is_some(),
            oom_killed: self.oom_killed(),
        }
    }
}
