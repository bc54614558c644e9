//! Wire shapes for detached, collected, and streamed delivery.

use serde::Serialize;

use crate::exec_error::ExecError;
use crate::process_runner::CollectedRun;
use crate::stream_sink::StreamEvent;

pub const DETACHED_CONTENT_TYPE: &str = "application/json";
pub const COLLECTED_CONTENT_TYPE: &str = "application/json; charset=utf-8";
pub const SSE_CACHE_CONTROL: &str = "no-cache";
pub const SSE_CLOSE_DATA: &str = "Command finished";

const STATUS_SUCCESS: &str = "success";
const STATUS_ERROR: &str = "error";
const HTTP_OK: u16 = 200;
const HTTP_INTERNAL_SERVER_ERROR: u16 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Public struct `DetachedResponse` used across Tau exec components.
pub struct DetachedResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Public struct `CollectedResponse` used across Tau exec components.
pub struct CollectedResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Transport-neutral response: status code, content type, and a complete body.
pub struct EncodedResponse {
    pub status_code: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl EncodedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

pub fn detached_response(outcome: &Result<(), ExecError>) -> DetachedResponse {
    match outcome {
        Ok(()) => DetachedResponse {
            status: STATUS_SUCCESS,
            error: None,
        },
        Err(error) => DetachedResponse {
            status: STATUS_ERROR,
            error: Some(error.to_string()),
        },
    }
}

pub fn collected_response(run: &CollectedRun) -> CollectedResponse {
    CollectedResponse {
        status: if run.is_success() {
            STATUS_SUCCESS
        } else {
            STATUS_ERROR
        },
        error: run.outcome.as_ref().err().map(ToString::to_string),
        stdout: run.stdout.clone(),
        stderr: run.stderr.clone(),
        exit_code: run.exit_code(),
    }
}

/// Encodes a detached outcome; failures map to HTTP 500.
pub fn encode_detached(outcome: &Result<(), ExecError>) -> EncodedResponse {
    let status_code = if outcome.is_ok() {
        HTTP_OK
    } else {
        HTTP_INTERNAL_SERVER_ERROR
    };
    encode_json(
        status_code,
        DETACHED_CONTENT_TYPE,
        &detached_response(outcome),
    )
}

/// Encodes a collected run; `exit_code` is always present.
pub fn encode_collected(run: &CollectedRun) -> EncodedResponse {
    let status_code = if run.is_success() {
        HTTP_OK
    } else {
        HTTP_INTERNAL_SERVER_ERROR
    };
    encode_json(status_code, COLLECTED_CONTENT_TYPE, &collected_response(run))
}

fn encode_json<T: Serialize>(
    status_code: u16,
    content_type: &'static str,
    payload: &T,
) -> EncodedResponse {
    match serde_json::to_string(payload) {
        Ok(mut body) => {
            body.push('\n');
            EncodedResponse {
                status_code,
                content_type,
                body,
            }
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to encode exec response");
            EncodedResponse {
                status_code: HTTP_INTERNAL_SERVER_ERROR,
                content_type,
                body: format!(
                    "{{\"status\":\"{STATUS_ERROR}\",\"error\":\"failed to encode response\"}}\n"
                ),
            }
        }
    }
}

impl StreamEvent {
    pub fn sse_event_name(&self) -> &'static str {
        match self {
            Self::Stdout(_) => "stdout",
            Self::Stderr(_) => "stderr",
            Self::Error(_) => "error",
            Self::Close => "close",
        }
    }

    pub fn sse_data(&self) -> &str {
        match self {
            Self::Stdout(line) | Self::Stderr(line) | Self::Error(line) => line,
            Self::Close => SSE_CLOSE_DATA,
        }
    }
}
