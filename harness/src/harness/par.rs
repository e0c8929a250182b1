//! HTTP harness for the evaluation service
//!
//! Every call goes through the retry policy. Non-200 responses carry an
//! `ErrorBody` that is rebuilt into the typed failure for its status code;
//! 204 on a dataset request is end of data.

use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{end_of_dataset, EvaluationHarness, RoundData};
use crate::dataset::parse_round;
use crate::error::{ErrorBody, HarnessError, HarnessResult};
use crate::feedback::{parse_rows, FeedbackRow};
use crate::lifecycle::SessionRequest;
use crate::metadata::TestMetadata;
use crate::retry::RetryPolicy;
use crate::types::{FeedbackType, ResultType};

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    finished_tests: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ParHarness {
    url: String,
    save_directory: PathBuf,
    client: Client,
    retry: RetryPolicy,
}

impl ParHarness {
    pub fn new(url: impl Into<String>, save_directory: impl Into<PathBuf>) -> HarnessResult<Self> {
        let save_directory = save_directory.into();
        std::fs::create_dir_all(&save_directory)?;
        Ok(Self {
            url: url.into().trim_end_matches('/').to_string(),
            save_directory,
            client: Client::new(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn save_directory(&self) -> &Path {
        &self.save_directory
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.url, path.trim_start_matches('/'))
    }

    fn save(&self, name: String, content: &[u8]) -> HarnessResult<PathBuf> {
        let path = self.save_directory.join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

/// Typed failure for a non-200 response body
pub fn error_from_response(status: u16, text: &str) -> HarnessError {
    match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => HarnessError::from_status(status, body),
        Err(_) => HarnessError::http(
            format!("service returned {status}: {text}"),
            (500..600).contains(&status),
        ),
    }
}

fn check(response: Response) -> HarnessResult<Response> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let text = response.text()?;
    Err(error_from_response(status.as_u16(), &text))
}

fn text_part(name: &str, content: String) -> Part {
    Part::text(content).file_name(name.to_string())
}

impl EvaluationHarness for ParHarness {
    fn name(&self) -> &'static str {
        "par"
    }

    fn test_ids_request(
        &self,
        protocol: &str,
        domain: &str,
        detector_seed: &str,
        test_assumptions: Option<&Path>,
    ) -> HarnessResult<PathBuf> {
        let requirements = json!({
            "protocol": protocol,
            "domain": domain,
            "detector_seed": detector_seed,
        })
        .to_string();
        let assumptions = match test_assumptions {
            Some(path) => std::fs::read_to_string(path)?,
            None => "{}".to_string(),
        };

        let body = self.retry.run("test_ids_request", || {
            let form = Form::new()
                .part("test_requirements", text_part("test_requirements", requirements.clone()))
                .part("test_assumptions", text_part("test_assumptions", assumptions.clone()));
            let response = self.client.get(self.endpoint("test/ids")).multipart(form).send()?;
            Ok(check(response)?.bytes()?)
        })?;
        let path = self.save(format!("{protocol}.{domain}.{detector_seed}.csv"), &body)?;
        info!(path = %path.display(), "Received test ids");
        Ok(path)
    }

    fn session_request(&self, test_ids: &[String], request: &SessionRequest) -> HarnessResult<String> {
        let configuration = json!({
            "protocol": request.protocol,
            "novelty_detector_version": request.detector,
            "domain": request.domain,
            "hints": request.hints,
            "detection_threshold": request.detection_threshold,
        })
        .to_string();
        let ids = crate::dataset::render_round(test_ids);

        let session: SessionResponse = self.retry.run("session_request", || {
            let form = Form::new()
                .part("test_ids", text_part("test_ids", ids.clone()))
                .part("configuration", text_part("configuration", configuration.clone()));
            let response = self.client.post(self.endpoint("session")).multipart(form).send()?;
            Ok(check(response)?.json()?)
        })?;
        info!(session_id = %session.session_id, "Session created");
        Ok(session.session_id)
    }

    fn resume_session(&self, session_id: &str) -> HarnessResult<Vec<String>> {
        let latest: LatestResponse = self.retry.run("resume_session", || {
            let response = self
                .client
                .get(self.endpoint("session/latest"))
                .query(&[("session_id", session_id)])
                .send()?;
            Ok(check(response)?.json()?)
        })?;
        Ok(latest.finished_tests)
    }

    fn dataset_request(&self, session_id: &str, test_id: &str, round_id: u32) -> HarnessResult<RoundData> {
        let round = round_id.to_string();
        let body = self.retry.run("dataset_request", || {
            let response = self
                .client
                .get(self.endpoint("session/dataset"))
                .query(&[
                    ("session_id", session_id),
                    ("test_id", test_id),
                    ("round_id", round.as_str()),
                ])
                .send()?;
            if response.status() == StatusCode::NO_CONTENT {
                return Err(end_of_dataset(test_id, round_id));
            }
            Ok(check(response)?.bytes()?)
        })?;

        let path = self.save(format!("{session_id}.{test_id}.{round_id}.csv"), &body)?;
        let ids = parse_round(&String::from_utf8_lossy(&body));
        debug!(test_id, round_id, rows = ids.len(), "Received round data");
        Ok(RoundData { round_id, path, ids })
    }

    fn get_feedback_request(
        &self,
        session_id: &str,
        test_id: &str,
        round_id: u32,
        feedback_type: FeedbackType,
        ids: &[String],
    ) -> HarnessResult<Vec<FeedbackRow>> {
        let feedback_ids = ids.join("|");
        let round = round_id.to_string();
        let body = self.retry.run("get_feedback_request", || {
            let response = self
                .client
                .get(self.endpoint("session/feedback"))
                .query(&[
                    ("feedback_ids", feedback_ids.as_str()),
                    ("session_id", session_id),
                    ("test_id", test_id),
                    ("round_id", round.as_str()),
                    ("feedback_type", feedback_type.as_str()),
                ])
                .send()?;
            Ok(check(response)?.bytes()?)
        })?;

        self.save(
            format!("{session_id}.{test_id}.{round_id}_{feedback_type}.csv"),
            &body,
        )?;
        Ok(parse_rows(&String::from_utf8_lossy(&body)))
    }

    fn post_results(
        &self,
        session_id: &str,
        test_id: &str,
        round_id: u32,
        results: &BTreeMap<ResultType, String>,
    ) -> HarnessResult<()> {
        if results.is_empty() {
            return Err(HarnessError::protocol(
                "MissingResults",
                "Must provide at least one result file",
            ));
        }
        let result_types: Vec<&str> = results.keys().map(ResultType::as_str).collect();
        let identification = json!({
            "session_id": session_id,
            "test_id": test_id,
            "round_id": round_id,
            "result_types": result_types.join("|"),
        })
        .to_string();

        self.retry.run("post_results", || {
            let mut form = Form::new().part(
                "test_identification",
                text_part("test_identification", identification.clone()),
            );
            for (result_type, content) in results {
                let name = format!("{result_type}_file");
                form = form.part(name.clone(), text_part(&name, content.clone()));
            }
            let response = self
                .client
                .post(self.endpoint("session/results"))
                .multipart(form)
                .send()?;
            check(response).map(|_| ())
        })
    }

    fn get_test_metadata(&self, session_id: &str, test_id: &str) -> HarnessResult<TestMetadata> {
        self.retry.run("get_test_metadata", || {
            let response = self
                .client
                .get(self.endpoint("test/metadata"))
                .query(&[("test_id", test_id), ("session_id", session_id)])
                .send()?;
            Ok(check(response)?.json()?)
        })
    }

    fn complete_test(&self, session_id: &str, test_id: &str) -> HarnessResult<()> {
        self.retry.run("complete_test", || {
            let response = self
                .client
                .delete(self.endpoint("test"))
                .query(&[("test_id", test_id), ("session_id", session_id)])
                .send()?;
            check(response).map(|_| ())
        })
    }

    fn terminate_session(&self, session_id: &str) -> HarnessResult<()> {
        self.retry.run("terminate_session", || {
            let response = self
                .client
                .delete(self.endpoint("session"))
                .query(&[("session_id", session_id)])
                .send()?;
            check(response).map(|_| ())
        })?;
        info!(session_id, "Session terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_error_body_maps_to_taxonomy() {
        let body = r#"{"reason":"DetectionRepost","message":"again","stack_trace":"tb"}"#;
        let err = error_from_response(400, body);
        assert!(err.is_protocol());
        assert_eq!(err.reason(), Some("DetectionRepost"));
        assert!(!err.is_retryable());

        let err = error_from_response(500, r#"{"reason":"metadata_not_found","message":"x"}"#);
        assert!(matches!(err, HarnessError::Server { .. }));
        assert!(!err.is_retryable());

        let err = error_from_response(204, r#"{"reason":"End of Dataset","message":"x"}"#);
        assert!(err.is_round_end());
    }

    #[test]
    fn test_unparseable_body_is_transport_error() {
        let err = error_from_response(502, "<html>Bad Gateway</html>");
        assert!(matches!(err, HarnessError::Http { .. }));
        assert!(err.is_retryable());

        let err = error_from_response(404, "not found");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_endpoint_join() {
        let dir = tempdir().unwrap();
        let harness = ParHarness::new("http://localhost:3306/", dir.path()).unwrap();
        assert_eq!(harness.url(), "http://localhost:3306");
        assert_eq!(harness.endpoint("/session/dataset"), "http://localhost:3306/session/dataset");
    }

    #[test]
    fn test_unreachable_service_exhausts_retries() {
        let dir = tempdir().unwrap();
        let harness = ParHarness::new("http://127.0.0.1:1", dir.path())
            .unwrap()
            .with_retry(RetryPolicy::new(2, Duration::from_millis(1)));
        let err = harness.resume_session("abc").unwrap_err();
        assert!(matches!(err, HarnessError::Http { .. }));
    }
}
