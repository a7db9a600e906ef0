use batchwatch_core::TaskSeed;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("service error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("service rejected request: {0}")]
    Rejected(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// `{success, message, tasks}` envelope the processing service wraps every
/// control response in.
#[derive(Debug, Deserialize)]
struct ServiceResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    tasks: Option<Vec<TaskSeed>>,
}

impl ServiceResponse {
    fn into_result(self) -> Result<Option<Vec<TaskSeed>>, ControlError> {
        if self.success {
            Ok(self.tasks)
        } else {
            Err(ControlError::Rejected(
                self.message.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

/// Request/response client for the external task-control endpoints: batch
/// submission, per-task and bulk cancellation, and the aggregated error
/// report. Cancellation outcomes are not reflected here; the service pushes
/// `cancelled` events back over the connection.
#[derive(Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    base: String,
}

impl ControlClient {
    pub fn new(base_url: &Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base_url.as_str().trim_end_matches('/').to_string(),
        }
    }

    /// Uploads a batch for processing, correlated to the event stream via
    /// the `Session-Id` header. Returns the task seeds the service assigned.
    pub async fn submit_files(
        &self,
        session_id: &str,
        paths: &[impl AsRef<Path>],
    ) -> Result<Vec<TaskSeed>, ControlError> {
        let mut form = Form::new();
        for path in paths {
            let path = path.as_ref();
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "upload.bin".to_string());
            let bytes = tokio::fs::read(path).await?;
            form = form.part("files", Part::bytes(bytes).file_name(file_name));
        }

        let response = self
            .http
            .post(format!("{}/fileUpload/multipleFiles", self.base))
            .header("Session-Id", session_id)
            .multipart(form)
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;
        let body = check_status(response).await?;
        let seeds = body.into_result()?.unwrap_or_default();
        info!(event = "batch_submitted", tasks = seeds.len());
        Ok(seeds)
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<(), ControlError> {
        let response = self
            .http
            .delete(format!("{}/api/tasks/{}", self.base, task_id))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check_status(response).await?.into_result()?;
        info!(event = "task_cancel_requested", task_id = %task_id);
        Ok(())
    }

    pub async fn cancel_all(&self) -> Result<(), ControlError> {
        let response = self
            .http
            .delete(format!("{}/api/tasks", self.base))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        check_status(response).await?.into_result()?;
        info!(event = "bulk_cancel_requested");
        Ok(())
    }

    /// Fetches the aggregated error report; callers trigger this only when
    /// the result log contains at least one error.
    pub async fn download_error_report(&self, dest: &Path) -> Result<(), ControlError> {
        let response = self
            .http
            .get(format!("{}/api/excel/downloadErrorExcel", self.base))
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(event = "error_report_failed", status = status.as_u16());
            return Err(ControlError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
        info!(event = "error_report_saved", path = %dest.display(), bytes = bytes.len());
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<ServiceResponse, ControlError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ControlError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<ServiceResponse>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_successful_submission_envelope() {
        let body: ServiceResponse = serde_json::from_str(
            r#"{"success":true,"tasks":[{"taskId":"t1","fileName":"a.xlsx"},{"taskId":"t2","fileName":"b.xlsx"}]}"#,
        )
        .expect("parse");
        let seeds = body.into_result().expect("ok").expect("tasks");
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].task_id, "t1");
        assert_eq!(seeds[1].file_name, "b.xlsx");
    }

    #[test]
    fn parses_plain_success_envelope() {
        let body: ServiceResponse =
            serde_json::from_str(r#"{"success":true}"#).expect("parse");
        assert!(body.into_result().expect("ok").is_none());
    }

    #[test]
    fn rejection_carries_service_message() {
        let body: ServiceResponse =
            serde_json::from_str(r#"{"success":false,"message":"too many files"}"#).expect("parse");
        match body.into_result() {
            Err(ControlError::Rejected(message)) => assert_eq!(message, "too many files"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejection_without_message_gets_placeholder() {
        let body: ServiceResponse = serde_json::from_str(r#"{"success":false}"#).expect("parse");
        match body.into_result() {
            Err(ControlError::Rejected(message)) => assert_eq!(message, "unknown error"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let url = Url::parse("http://localhost:7777/").expect("url");
        let client = ControlClient::new(&url);
        assert_eq!(client.base, "http://localhost:7777");
    }
}
