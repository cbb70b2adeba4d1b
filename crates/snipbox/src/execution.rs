//! Request, result and event model shared by every stage of the pipeline.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::registry::LanguageId;

/// Unique identifier of one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Anonymous client identity used for quotas: a session label (session
/// cookie or client IP) plus, when known, the network origin it came from.
///
/// Two sessions with the same label but different origins are distinct.
/// Bans and the in-flight cap also apply to the origin as a whole, so
/// switching labels does not shed them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<String>,
}

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Identity of the origin alone, shared by every session from it
    pub fn origin(&self) -> Option<SessionId> {
        self.origin.as_deref().map(SessionId::new)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Some(ref origin) => write!(f, "{}@{origin}", self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// One accepted submission. Immutable once created by the gateway.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: RequestId,
    pub language: LanguageId,
    pub source_code: String,
    pub stdin: Option<String>,
    pub client_session_id: SessionId,
    pub submitted_at: SystemTime,
}

/// How a snippet run ended, as shown to the learner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Program ran to completion with exit code 0
    Completed,
    /// Wall clock or CPU time ceiling was hit
    TimedOut,
    /// Memory or file size ceiling was hit
    ResourceExceeded,
    /// Program crashed, raised, or exited non-zero
    RuntimeError,
    /// Sandbox infrastructure fault
    InternalError,
    /// Caller went away or asked to stop before completion
    Cancelled,
}

impl Outcome {
    /// Outcomes caused by the snippet itself rather than by the service
    pub fn is_user_fault(&self) -> bool {
        matches!(
            self,
            Outcome::TimedOut | Outcome::ResourceExceeded | Outcome::RuntimeError
        )
    }
}

/// Final result of one request
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub request_id: RequestId,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub truncated: bool,
    pub outcome: Outcome,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// A result carrying no output, used for failures outside the program
    pub fn empty(request_id: RequestId, outcome: Outcome, duration: Duration) -> Self {
        Self {
            request_id,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            truncated: false,
            outcome,
            duration,
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Which pipe an output chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Ordered piece of program output relayed while the program runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}

/// Event delivered to callers polling or streaming a request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Waiting for a sandbox; position 0 is next in line
    Queued { position: usize },
    /// A sandbox picked the request up
    Started,
    Stdout { data: String },
    Stderr { data: String },
    /// Terminal event
    Finished(ExecutionResult),
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionEvent::Finished(_))
    }

    /// Name used for the SSE `event:` field
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionEvent::Queued { .. } => "queued",
            ExecutionEvent::Started => "started",
            ExecutionEvent::Stdout { .. } => "stdout",
            ExecutionEvent::Stderr { .. } => "stderr",
            ExecutionEvent::Finished(_) => "result",
        }
    }
}

impl From<OutputChunk> for ExecutionEvent {
    fn from(chunk: OutputChunk) -> Self {
        match chunk.stream {
            OutputStream::Stdout => ExecutionEvent::Stdout { data: chunk.data },
            OutputStream::Stderr => ExecutionEvent::Stderr { data: chunk.data },
        }
    }
}
