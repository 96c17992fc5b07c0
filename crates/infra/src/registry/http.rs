//! Registry HTTP client (reqwest-based).
//!
//! Endpoints, relative to the configured base URL:
//!
//! | call | request |
//! |------|---------|
//! | submit | `POST employers/{employer}/submissions` with `Idempotency-Key: {message id}` |
//! | fetch_receipt | `GET employers/{employer}/submissions/{message id}/receipt` |
//! | fetch_employees | `GET employers/{employer}/employees` |
//!
//! Status mapping: 2xx is a receipt (202 without a body means pending),
//! 401/403 unauthorized, 429 and 5xx transient, any other 4xx a rejection
//! with the validation issues parsed from the body.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use regsync_core::MessageId;
use regsync_outbox::{
    InboundReceipt, InboundResult, OutboxMessage, ReceiptStatus, RegistryEmployee,
    ValidationIssue, receipt::summarize_issues,
};

use super::{RegistryClient, RegistryError, SubmitRequest};
use crate::vault::RegistryCredentials;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone)]
pub struct HttpRegistryConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl HttpRegistryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            user_agent: "regsync/0.1".to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    base_url: Url,
    http_client: Client,
}

impl HttpRegistryClient {
    pub fn new(config: HttpRegistryConfig) -> Result<Self, RegistryError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| RegistryError::Protocol(format!("failed to build HTTP client: {e}")))?;
        Self::with_http_client(&config.base_url, http_client)
    }

    /// Use a pre-built `reqwest::Client`.
    pub fn with_http_client(base_url: &str, http_client: Client) -> Result<Self, RegistryError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| RegistryError::Protocol(format!("invalid registry base URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(RegistryError::Protocol(format!(
                "registry base URL '{base_url}' cannot carry a path"
            )));
        }
        Ok(Self {
            base_url,
            http_client,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RegistryError::Protocol("registry base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    // ── Response Handling ─────────────────────────────────────────────

    async fn read_json(response: reqwest::Response) -> Result<JsonValue, RegistryError> {
        let body = response.text().await.map_err(transport_error)?;
        if body.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| RegistryError::Protocol(format!("failed to parse response: {e}")))
    }

    async fn handle_error_response<T>(response: reqwest::Response) -> Result<T, RegistryError> {
        let status = response.status();

        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::Unauthorized {
                status: status.as_u16(),
            }),
            StatusCode::TOO_MANY_REQUESTS => {
                warn!(retry_after_secs = ?retry_after, "registry rate limited");
                Err(RegistryError::Transient(format!(
                    "rate limited (HTTP 429), retry after {retry_after:?}s"
                )))
            }
            s if s.is_server_error() => Err(RegistryError::Transient(format!("HTTP {s}: {body}"))),
            s if s.is_client_error() => {
                let raw: JsonValue = serde_json::from_str(&body).unwrap_or(JsonValue::String(body.clone()));
                let issues = parse_issues(&raw, &body);
                Err(RegistryError::Rejected {
                    status: s.as_u16(),
                    summary: summarize_issues(&issues),
                    issues,
                    raw,
                })
            }
            s => Err(RegistryError::Protocol(format!("unexpected HTTP {s}: {body}"))),
        }
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn submit(
        &self,
        credentials: &RegistryCredentials,
        request: &SubmitRequest,
    ) -> Result<InboundReceipt, RegistryError> {
        let url = self.endpoint(&["employers", &request.employer_id, "submissions"])?;
        debug!(message_id = %request.message_id, kind = %request.kind, "registry POST {}", url);

        let response = self
            .http_client
            .post(url)
            .basic_auth(&credentials.username, Some(&credentials.secret))
            .header(IDEMPOTENCY_HEADER, request.message_id.to_string())
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Self::handle_error_response(response).await;
        }
        let raw = Self::read_json(response).await?;
        decode_receipt(request.message_id, status, raw)
    }

    async fn fetch_receipt(
        &self,
        credentials: &RegistryCredentials,
        employer_id: &str,
        message: &OutboxMessage,
    ) -> Result<Option<InboundReceipt>, RegistryError> {
        let message_id = message.id.to_string();
        let url = self.endpoint(&["employers", employer_id, "submissions", &message_id, "receipt"])?;
        debug!(message_id = %message.id, "registry GET {}", url);

        let response = self
            .http_client
            .get(url)
            .basic_auth(&credentials.username, Some(&credentials.secret))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            return Self::handle_error_response(response).await;
        }
        let raw = Self::read_json(response).await?;
        decode_receipt(message.id, status, raw).map(Some)
    }

    async fn fetch_employees(
        &self,
        credentials: &RegistryCredentials,
        employer_id: &str,
    ) -> Result<Vec<RegistryEmployee>, RegistryError> {
        let url = self.endpoint(&["employers", employer_id, "employees"])?;
        debug!(employer_id, "registry GET {}", url);

        let response = self
            .http_client
            .get(url)
            .basic_auth(&credentials.username, Some(&credentials.secret))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Self::handle_error_response(response).await;
        }
        let raw = Self::read_json(response).await?;
        decode_employees(raw)
    }
}

fn transport_error(err: reqwest::Error) -> RegistryError {
    if err.is_timeout() {
        RegistryError::Timeout
    } else {
        RegistryError::Transient(err.to_string())
    }
}

/// Receipt body as the Registry sends it; most fields are optional on the wire.
#[derive(Debug, Deserialize)]
struct ReceiptBody {
    #[serde(default)]
    message_id: Option<MessageId>,
    #[serde(default)]
    receipt_number: Option<String>,
    #[serde(default)]
    receipt_date: Option<DateTime<Utc>>,
    #[serde(default)]
    status: Option<ReceiptStatus>,
    #[serde(default, alias = "errors")]
    validation_errors: Vec<ValidationIssue>,
    #[serde(default)]
    results: Vec<InboundResult>,
}

fn decode_receipt(
    message_id: MessageId,
    status: StatusCode,
    raw: JsonValue,
) -> Result<InboundReceipt, RegistryError> {
    if raw.is_null() {
        if status == StatusCode::ACCEPTED {
            return Ok(InboundReceipt {
                message_id,
                receipt_number: None,
                receipt_date: None,
                status: ReceiptStatus::PendingValidation,
                validation_errors: Vec::new(),
                results: Vec::new(),
                raw,
            });
        }
        return Err(RegistryError::Protocol(format!("HTTP {status} without a receipt body")));
    }

    let body: ReceiptBody = serde_json::from_value(raw.clone())
        .map_err(|e| RegistryError::Protocol(format!("malformed receipt: {e}")))?;

    if let Some(echoed) = body.message_id {
        if echoed != message_id {
            return Err(RegistryError::Protocol(format!(
                "receipt for {echoed} returned for message {message_id}"
            )));
        }
    }

    let receipt_status = match (body.status, status) {
        (Some(s), _) => s,
        (None, StatusCode::ACCEPTED) => ReceiptStatus::PendingValidation,
        (None, s) => {
            return Err(RegistryError::Protocol(format!("HTTP {s} receipt without a status")));
        }
    };

    Ok(InboundReceipt {
        message_id,
        receipt_number: body.receipt_number,
        receipt_date: body.receipt_date,
        status: receipt_status,
        validation_errors: body.validation_errors,
        results: body.results,
        raw,
    })
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmployeesBody {
    Wrapped { employees: Vec<JsonValue> },
    Bare(Vec<JsonValue>),
}

fn decode_employees(raw: JsonValue) -> Result<Vec<RegistryEmployee>, RegistryError> {
    let body: EmployeesBody = serde_json::from_value(raw)
        .map_err(|e| RegistryError::Protocol(format!("malformed employee list: {e}")))?;
    let items = match body {
        EmployeesBody::Wrapped { employees } => employees,
        EmployeesBody::Bare(items) => items,
    };
    items
        .into_iter()
        .map(|item| {
            let mut employee: RegistryEmployee = serde_json::from_value(item.clone())
                .map_err(|e| RegistryError::Protocol(format!("malformed employee: {e}")))?;
            employee.raw = item;
            Ok(employee)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "errors")]
    validation_errors: Vec<ValidationIssue>,
    #[serde(default)]
    message: Option<String>,
}

fn parse_issues(raw: &JsonValue, body: &str) -> Vec<ValidationIssue> {
    let parsed = serde_json::from_value::<ErrorBody>(raw.clone()).ok();
    match parsed {
        Some(b) if !b.validation_errors.is_empty() => b.validation_errors,
        Some(ErrorBody {
            message: Some(message),
            ..
        }) => vec![ValidationIssue {
            code: None,
            field: None,
            message,
        }],
        _ => vec![ValidationIssue {
            code: None,
            field: None,
            message: if body.is_empty() {
                "rejected without detail".to_string()
            } else {
                body.to_string()
            },
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regsync_core::EmployeeId;
    use regsync_outbox::{EntityRef, ResultOutcome};
    use serde_json::json;

    #[test]
    fn accepted_without_body_is_pending() {
        let id = MessageId::new();
        let receipt = decode_receipt(id, StatusCode::ACCEPTED, JsonValue::Null).unwrap();
        assert_eq!(receipt.status, ReceiptStatus::PendingValidation);
        assert_eq!(receipt.message_id, id);
    }

    #[test]
    fn synchronous_receipt_with_results() {
        let id = MessageId::new();
        let employee = EmployeeId::new();
        let raw = json!({
            "receipt_number": "R-1",
            "status": "accepted",
            "results": [{
                "outcome": "success",
                "entities": [{"entity": {"type": "employee", "id": employee}, "registry_id": "REG-9"}]
            }]
        });
        let receipt = decode_receipt(id, StatusCode::OK, raw.clone()).unwrap();

        assert_eq!(receipt.status, ReceiptStatus::Accepted);
        assert_eq!(receipt.receipt_number.as_deref(), Some("R-1"));
        assert_eq!(receipt.results[0].outcome, ResultOutcome::Success);
        assert_eq!(receipt.results[0].entities[0].entity, EntityRef::Employee(employee));
        assert_eq!(receipt.raw, raw);
    }

    #[test]
    fn receipt_for_another_message_is_a_protocol_error() {
        let raw = json!({"message_id": MessageId::new(), "status": "accepted"});
        let err = decode_receipt(MessageId::new(), StatusCode::OK, raw).unwrap_err();
        assert!(matches!(err, RegistryError::Protocol(_)));
    }

    #[test]
    fn ok_without_status_is_a_protocol_error() {
        let err = decode_receipt(MessageId::new(), StatusCode::OK, json!({})).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn validation_issues_from_error_body() {
        let raw = json!({"errors": [{"code": "E12", "field": "start_date", "message": "in the future"}]});
        let issues = parse_issues(&raw, "");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].to_string(), "[E12] start_date: in the future");

        let issues = parse_issues(&JsonValue::String("bad".into()), "bad");
        assert_eq!(issues[0].message, "bad");
    }

    #[test]
    fn employee_list_accepts_both_shapes() {
        let one = json!({
            "registry_id": "REG-1",
            "national_id": "AB 123",
            "full_name": "Ada",
            "employment_status": "active"
        });
        let wrapped = decode_employees(json!({"employees": [one.clone()]})).unwrap();
        let bare = decode_employees(json!([one.clone()])).unwrap();
        assert_eq!(wrapped, bare);
        assert_eq!(wrapped[0].raw, one);
    }

    #[test]
    fn endpoint_escapes_segments() {
        let client =
            HttpRegistryClient::with_http_client("https://registry.example/api/", Client::new()).unwrap();
        let url = client.endpoint(&["employers", "ACME 1", "employees"]).unwrap();
        assert_eq!(url.as_str(), "https://registry.example/api/employers/ACME%201/employees");
    }
}
