use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::timeout;

use reservo_core::config::SchedulingConfig;

use crate::llm::ToolSpec;

pub const CREATE_BOOKING: &str = "create_booking";
pub const CHECK_AVAILABILITY: &str = "check_availability";
pub const CANCEL_BOOKING: &str = "cancel_booking";

const KNOWN_TOOLS: [&str; 3] = [CREATE_BOOKING, CHECK_AVAILABILITY, CANCEL_BOOKING];

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("scheduling request was rejected: {0}")]
    InvalidArguments(String),
    #[error("scheduling backend failed: {0}")]
    Upstream(String),
    #[error("scheduling backend timed out")]
    Timeout,
}

/// Scheduling collaborator. Owns the argument schema of every operation;
/// this crate only routes named calls to it.
#[async_trait]
pub trait SchedulingClient: Send + Sync {
    async fn invoke(&self, operation: &str, arguments: &Value) -> Result<Value, SchedulingError>;
}

/// HTTP scheduling client: `POST {base_url}/{operation}` with the tool
/// arguments as the JSON body.
pub struct HttpSchedulingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpSchedulingClient {
    pub fn from_config(config: &SchedulingConfig) -> Result<Self, SchedulingError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| SchedulingError::Upstream(error.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SchedulingClient for HttpSchedulingClient {
    async fn invoke(&self, operation: &str, arguments: &Value) -> Result<Value, SchedulingError> {
        let mut request = self.http.post(format!("{}/{operation}", self.base_url)).json(arguments);
        if let Some(api_key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {}", api_key.expose_secret()));
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() {
                SchedulingError::Timeout
            } else {
                SchedulingError::Upstream(error.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .json::<Value>()
            .await
            .map_err(|error| SchedulingError::Upstream(error.to_string()))?;

        if status.is_client_error() {
            return Err(SchedulingError::InvalidArguments(body.to_string()));
        }
        if !status.is_success() {
            return Err(SchedulingError::Upstream(format!("status {status}: {body}")));
        }

        Ok(body)
    }
}

/// Stable failure classification, fed back to the model so it can produce a
/// sensible user-facing message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    InvalidArguments,
    Upstream,
    Timeout,
}

/// Result of one tool-call attempt. `Blocked` and `ApprovalPending` are
/// synthesized by the policy branch without touching the scheduling
/// collaborator.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolOutcome {
    Success { data: Value },
    Failure { kind: ToolErrorKind, message: String },
    Blocked { reason: String },
    ApprovalPending { approval_id: String },
}

impl ToolOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// The JSON payload fed back to the model as the tool response.
    pub fn to_model_payload(&self) -> Value {
        match self {
            Self::Success { data } => json!({ "success": true, "data": data }),
            Self::Failure { kind, message } => {
                json!({ "success": false, "error": message, "error_kind": kind })
            }
            Self::Blocked { reason } => {
                json!({ "success": false, "blocked": true, "reason": reason })
            }
            Self::ApprovalPending { approval_id } => {
                json!({ "success": false, "requires_approval": true, "approval_id": approval_id })
            }
        }
    }
}

/// Routes authorized tool calls to the scheduling collaborator and
/// normalizes results and errors into `ToolOutcome`.
pub struct ToolExecutor {
    scheduling: Arc<dyn SchedulingClient>,
    call_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(scheduling: Arc<dyn SchedulingClient>, call_timeout: Duration) -> Self {
        Self { scheduling, call_timeout }
    }

    /// The tool schema declared to the model on every completion call.
    pub fn specs() -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: CREATE_BOOKING.to_owned(),
                description: "Create a court booking at one of the centers".to_owned(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "center": { "type": "string", "description": "Center identifier" },
                        "date": { "type": "string", "description": "Date, YYYY-MM-DD" },
                        "time": { "type": "string", "description": "Start time, HH:MM" },
                        "duration_minutes": { "type": "integer" },
                        "name": { "type": "string", "description": "Name for the booking" },
                    },
                    "required": ["center", "date", "time"],
                }),
            },
            ToolSpec {
                name: CHECK_AVAILABILITY.to_owned(),
                description: "List free slots at a center for a given date".to_owned(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "center": { "type": "string" },
                        "date": { "type": "string", "description": "Date, YYYY-MM-DD" },
                    },
                    "required": ["center", "date"],
                }),
            },
            ToolSpec {
                name: CANCEL_BOOKING.to_owned(),
                description: "Cancel an existing booking by its reference".to_owned(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "booking_ref": { "type": "string" },
                    },
                    "required": ["booking_ref"],
                }),
            },
        ]
    }

    pub async fn execute(&self, name: &str, arguments: &Value) -> ToolOutcome {
        if !KNOWN_TOOLS.contains(&name) {
            return ToolOutcome::Failure {
                kind: ToolErrorKind::UnknownTool,
                message: format!("tool {name} is not declared"),
            };
        }

        match timeout(self.call_timeout, self.scheduling.invoke(name, arguments)).await {
            Err(_) => ToolOutcome::Failure {
                kind: ToolErrorKind::Timeout,
                message: "scheduling call exceeded its deadline".to_owned(),
            },
            Ok(Err(error)) => {
                let kind = match &error {
                    SchedulingError::InvalidArguments(_) => ToolErrorKind::InvalidArguments,
                    SchedulingError::Upstream(_) => ToolErrorKind::Upstream,
                    SchedulingError::Timeout => ToolErrorKind::Timeout,
                };
                ToolOutcome::Failure { kind, message: error.to_string() }
            }
            Ok(Ok(data)) => ToolOutcome::Success { data },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Mutex;

    use super::{
        SchedulingClient, SchedulingError, ToolErrorKind, ToolExecutor, ToolOutcome,
        CREATE_BOOKING,
    };

    struct RecordingScheduling {
        calls: Mutex<Vec<(String, Value)>>,
        response: Result<Value, SchedulingError>,
    }

    impl RecordingScheduling {
        fn succeeding(response: Value) -> Self {
            Self { calls: Mutex::new(Vec::new()), response: Ok(response) }
        }

        fn failing(error: SchedulingError) -> Self {
            Self { calls: Mutex::new(Vec::new()), response: Err(error) }
        }
    }

    #[async_trait]
    impl SchedulingClient for RecordingScheduling {
        async fn invoke(
            &self,
            operation: &str,
            arguments: &Value,
        ) -> Result<Value, SchedulingError> {
            self.calls.lock().await.push((operation.to_owned(), arguments.clone()));
            match &self.response {
                Ok(value) => Ok(value.clone()),
                Err(SchedulingError::InvalidArguments(message)) => {
                    Err(SchedulingError::InvalidArguments(message.clone()))
                }
                Err(SchedulingError::Upstream(message)) => {
                    Err(SchedulingError::Upstream(message.clone()))
                }
                Err(SchedulingError::Timeout) => Err(SchedulingError::Timeout),
            }
        }
    }

    #[tokio::test]
    async fn known_tool_routes_to_the_scheduling_client() {
        let scheduling =
            Arc::new(RecordingScheduling::succeeding(json!({"booking_ref": "B-1001"})));
        let executor = ToolExecutor::new(scheduling.clone(), Duration::from_secs(5));

        let outcome = executor.execute(CREATE_BOOKING, &json!({"center": "sur"})).await;

        assert_eq!(outcome, ToolOutcome::Success { data: json!({"booking_ref": "B-1001"}) });
        let calls = scheduling.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, CREATE_BOOKING);
    }

    #[tokio::test]
    async fn undeclared_tool_never_reaches_the_collaborator() {
        let scheduling = Arc::new(RecordingScheduling::succeeding(json!({})));
        let executor = ToolExecutor::new(scheduling.clone(), Duration::from_secs(5));

        let outcome = executor.execute("drop_database", &json!({})).await;

        assert!(
            matches!(outcome, ToolOutcome::Failure { kind: ToolErrorKind::UnknownTool, .. })
        );
        assert!(scheduling.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn upstream_errors_keep_a_stable_kind() {
        let scheduling = Arc::new(RecordingScheduling::failing(SchedulingError::Upstream(
            "503 from booking API".to_owned(),
        )));
        let executor = ToolExecutor::new(scheduling, Duration::from_secs(5));

        let outcome = executor.execute(CREATE_BOOKING, &json!({})).await;

        assert!(matches!(outcome, ToolOutcome::Failure { kind: ToolErrorKind::Upstream, .. }));
    }

    #[test]
    fn model_payloads_expose_block_and_approval_flags() {
        let blocked = ToolOutcome::Blocked { reason: "center closed".to_owned() };
        let payload = blocked.to_model_payload();
        assert_eq!(payload["success"], false);
        assert_eq!(payload["blocked"], true);
        assert_eq!(payload["reason"], "center closed");

        let pending = ToolOutcome::ApprovalPending { approval_id: "ap-1".to_owned() };
        let payload = pending.to_model_payload();
        assert_eq!(payload["requires_approval"], true);
        assert_eq!(payload["approval_id"], "ap-1");
    }

    #[test]
    fn declared_specs_cover_the_known_tools() {
        let specs = ToolExecutor::specs();
        let names: Vec<&str> = specs.iter().map(|spec| spec.name.as_str()).collect();
        assert_eq!(names, vec!["create_booking", "check_availability", "cancel_booking"]);
    }
}
