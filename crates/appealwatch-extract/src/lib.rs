//! Document extraction: ships an agenda PDF to the Gemini Files API and asks
//! the model for structured housing-appeal items.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use appealwatch_core::{ActiveAppealContext, ExtractedAppealItem, Meeting, Source};
use appealwatch_storage::{BlobReader, BlobStore};

pub const CRATE_NAME: &str = "appealwatch-extract";

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";

const PDF_MIME_TYPE: &str = "application/pdf";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("meeting {meeting_id} has no agenda PDF attached")]
    MissingPdf { meeting_id: Uuid },
    #[error("reading agenda blob: {0}")]
    Blob(#[source] anyhow::Error),
    #[error("extraction backend request failed: {0}")]
    Backend(#[from] reqwest::Error),
    #[error("extraction backend returned {status}: {body}")]
    BackendStatus { status: u16, body: String },
    #[error("upload session response missing x-goog-upload-url header")]
    UploadSession,
    #[error("extraction response is not a JSON array")]
    Contract { raw: String },
}

/// Consumes a meeting's attached agenda PDF and returns the structured
/// appeal items found on it. The pipeline and its tests only know this seam.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(
        &self,
        source: &Source,
        meeting: &Meeting,
        blobs: &dyn BlobStore,
        active: &[ActiveAppealContext],
    ) -> Result<Vec<ExtractedAppealItem>, ExtractError>;
}

// =========================================================================
// Gemini client
// =========================================================================

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: GEMINI_API_URL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadedFile {
    pub name: String,
    pub uri: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: UploadedFile,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Two-phase resumable upload: start a session with the file metadata,
    /// then stream the PDF body to the returned upload URL with an explicit
    /// offset and a finalize command. The file is never buffered a second
    /// time; it flows straight from the blob reader into the request body.
    pub async fn upload_pdf(
        &self,
        display_name: &str,
        reader: BlobReader,
        byte_size: u64,
    ) -> Result<UploadedFile, ExtractError> {
        let start_url = format!(
            "{}/upload/v1beta/files?key={}",
            self.config.base_url, self.config.api_key
        );

        let mut headers = HeaderMap::new();
        headers.insert("X-Goog-Upload-Protocol", HeaderValue::from_static("resumable"));
        headers.insert("X-Goog-Upload-Command", HeaderValue::from_static("start"));
        headers.insert(
            "X-Goog-Upload-Header-Content-Length",
            HeaderValue::from_str(&byte_size.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
        headers.insert(
            "X-Goog-Upload-Header-Content-Type",
            HeaderValue::from_static(PDF_MIME_TYPE),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        debug!(display_name, byte_size, "starting resumable upload session");

        let start = self
            .http
            .post(&start_url)
            .headers(headers)
            .json(&serde_json::json!({
                "file": {
                    "display_name": display_name,
                    "mimeType": PDF_MIME_TYPE,
                }
            }))
            .send()
            .await?;
        let start = check_status(start).await?;

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
            .ok_or(ExtractError::UploadSession)?;

        let upload = self
            .http
            .post(&upload_url)
            .header(CONTENT_LENGTH, byte_size)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(streaming_body(reader))
            .send()
            .await?;
        let upload = check_status(upload).await?;

        let response: UploadResponse = upload.json().await?;
        debug!(file = %response.file.name, "upload finalized");
        Ok(response.file)
    }

    /// Invoke generation with the uploaded file handle and a prompt, and
    /// concatenate the text parts of the first candidate.
    pub async fn generate(
        &self,
        file: &UploadedFile,
        prompt: &str,
    ) -> Result<String, ExtractError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.config.base_url, self.config.model, self.config.api_key
        );

        debug!(model = %self.config.model, file = %file.name, "generateContent request");

        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .json(&serde_json::json!({
                "contents": [{
                    "parts": [
                        {"file_data": {"mime_type": PDF_MIME_TYPE, "file_uri": file.uri}},
                        {"text": prompt},
                    ]
                }]
            }))
            .send()
            .await?;
        let response = check_status(response).await?;

        let parsed: GenerateResponse = response.json().await?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();
        Ok(text)
    }

    /// Best-effort cleanup; the backend expires uploads on its own after 48h,
    /// so a failed delete is only worth a warning.
    pub async fn delete_file(&self, name: &str) {
        let url = format!(
            "{}/v1beta/{}?key={}",
            self.config.base_url, name, self.config.api_key
        );
        match self.http.delete(&url).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(file = name, status = %resp.status(), "failed to delete uploaded file"),
            Err(err) => warn!(file = name, %err, "failed to delete uploaded file"),
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ExtractError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ExtractError::BackendStatus {
        status: status.as_u16(),
        body,
    })
}

fn streaming_body(reader: BlobReader) -> reqwest::Body {
    let stream = futures::stream::unfold(reader, |mut reader| async move {
        let mut buf = vec![0u8; 64 * 1024];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok::<_, std::io::Error>(buf), reader))
            }
            Err(err) => Some((Err(err), reader)),
        }
    });
    reqwest::Body::wrap_stream(stream)
}

// =========================================================================
// Prompt
// =========================================================================

const PROMPT_HEADER: &str = r#"You are analyzing a city council meeting agenda PDF.

Your task: extract every housing project appeal on this agenda.

For each appeal found, return a JSON object in the following array format.
If no appeals are found, return an empty array [].

Return ONLY valid JSON - no markdown, no explanation, just the array.

Schema for each appeal object:
{
  "item_number": <integer or null>,
  "page_number": <integer PDF page where the item starts, or null>,
  "title": "<short agenda item title>",
  "description": "<full text of the agenda item>",
  "appeal_description": "<2-4 sentence plain-English summary: what is being appealed, who is appealing, and the main grounds. Write this for a general audience with no technical jargon>",
  "project_name": "<name of the housing project, or null>",
  "project_address": "<street address, or null>",
  "apn": "<Assessor Parcel Number, or null>",
  "appellant_name": "<name of appellant(s), or null>",
  "grounds_category": "<one of: CEQA, design_review, use_permit, neighborhood_impact, procedural, other>",
  "grounds_description": "<summary of the grounds for appeal>",
  "reference_number": "<the city-assigned case or file number for the appeal itself, or null. Do not append planning case numbers; if the agenda lists several numbers, give the appeal file number first>",
  "hearing_type": "<what this agenda entry is for this appeal; one of: filing, initial, continued, action, public_comment, decision, communication, other>",
  "action_taken": "<what the council did or is scheduled to do with this item at this meeting, or null>",
  "appeal_status": "<the appeal's overall status after this meeting; one of: filed, pending, heard, decided, withdrawn>",
  "decision": "<one of: granted, denied, continued, withdrawn; null until the council has actually decided>"
}"#;

const ACTIVE_APPEALS_INTRO: &str = r#"The city currently has these open appeals. If an agenda item is about one of
them, it is a continuation: reuse that appeal's reference_number exactly and
report the appeal's updated status rather than treating it as a new filing."#;

/// Fixed instruction template plus the live snapshot of the city's active
/// appeals, so the model can match continuations instead of re-filing.
pub fn build_prompt(active: &[ActiveAppealContext]) -> String {
    let mut prompt = String::from(PROMPT_HEADER);
    prompt.push_str("\n\n");

    if active.is_empty() {
        prompt.push_str("The city currently has no open appeals on record.\n");
        return prompt;
    }

    prompt.push_str(ACTIVE_APPEALS_INTRO);
    prompt.push('\n');
    for appeal in active {
        let mut line = format!(
            "- reference_number: {} | address: {} | status: {}",
            appeal.reference_number.as_deref().unwrap_or("(none)"),
            appeal.project_address.as_deref().unwrap_or("(unknown)"),
            appeal.status.as_str(),
        );
        if let Some(date) = appeal.last_hearing_date {
            line.push_str(&format!(" | last hearing: {date}"));
            if let Some(action) = appeal.last_action.as_deref() {
                line.push_str(&format!(" ({action})"));
            }
        }
        if let Some(summary) = appeal.summary.as_deref() {
            line.push_str(&format!(" | summary: {summary}"));
        }
        line.push('\n');
        prompt.push_str(&line);
    }
    prompt
}

// =========================================================================
// Response parsing
// =========================================================================

/// Strip markdown code fences the model sometimes wraps around the JSON.
pub fn strip_code_fences(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Parse the model's response into appeal items. A response that is not a
/// JSON array is a contract violation; an individually malformed element is
/// skipped so one bad item cannot sink the whole meeting.
pub fn parse_items(raw: &str) -> Result<Vec<ExtractedAppealItem>, ExtractError> {
    let stripped = strip_code_fences(raw);
    let values: Vec<serde_json::Value> =
        serde_json::from_str(stripped).map_err(|_| ExtractError::Contract {
            raw: raw.to_string(),
        })?;

    let mut items = Vec::with_capacity(values.len());
    for (index, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<ExtractedAppealItem>(value) {
            Ok(item) => items.push(item),
            Err(err) => warn!(index, %err, "skipping malformed extracted appeal item"),
        }
    }
    Ok(items)
}

// =========================================================================
// Gemini-backed extractor
// =========================================================================

pub struct GeminiExtractor {
    client: GeminiClient,
}

impl GeminiExtractor {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            client: GeminiClient::new(config),
        }
    }
}

#[async_trait]
impl DocumentExtractor for GeminiExtractor {
    async fn extract(
        &self,
        source: &Source,
        meeting: &Meeting,
        blobs: &dyn BlobStore,
        active: &[ActiveAppealContext],
    ) -> Result<Vec<ExtractedAppealItem>, ExtractError> {
        let blob = meeting.pdf_blob.as_ref().ok_or(ExtractError::MissingPdf {
            meeting_id: meeting.id,
        })?;
        let reader = blobs.open(blob).await.map_err(ExtractError::Blob)?;

        let display_name = format!("{} Agenda {}", source.city_name, meeting.date);
        info!(city = %source.city_name, date = %meeting.date, "uploading agenda PDF");
        let file = self
            .client
            .upload_pdf(&display_name, reader, blob.byte_size)
            .await?;

        info!(city = %source.city_name, date = %meeting.date, "extracting appeals");
        let prompt = build_prompt(active);
        let generated = self.client.generate(&file, &prompt).await;
        self.client.delete_file(&file.name).await;
        let raw = generated?;

        match parse_items(&raw) {
            Ok(items) => Ok(items),
            Err(err) => {
                if let ExtractError::Contract { raw } = &err {
                    error!(
                        city = %source.city_name,
                        date = %meeting.date,
                        %raw,
                        "extraction response failed the JSON contract"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appealwatch_core::AppealStatus;
    use chrono::NaiveDate;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n[]\n```"), "[]");
        assert_eq!(strip_code_fences("```\n[]\n```"), "[]");
        assert_eq!(strip_code_fences("  [] "), "[]");
    }

    #[test]
    fn parse_accepts_fenced_array() {
        let raw = r#"```json
        [{"item_number": 7, "reference_number": "24-0091", "appeal_status": "pending", "hearing_type": "initial"}]
        ```"#;
        let items = parse_items(raw).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_number, Some(7));
        assert_eq!(items[0].reference_number.as_deref(), Some("24-0091"));
        assert_eq!(items[0].appeal_status, Some(AppealStatus::Pending));
    }

    #[test]
    fn parse_accepts_empty_array() {
        assert!(parse_items("[]").unwrap().is_empty());
    }

    #[test]
    fn prose_response_is_a_contract_violation() {
        let err = parse_items("I could not find any appeals in this document.").unwrap_err();
        assert!(matches!(err, ExtractError::Contract { .. }));
    }

    #[test]
    fn object_response_is_a_contract_violation() {
        let err = parse_items(r#"{"appeals": []}"#).unwrap_err();
        assert!(matches!(err, ExtractError::Contract { .. }));
    }

    #[test]
    fn malformed_elements_are_skipped_not_fatal() {
        let raw = r#"[
            {"item_number": 1, "title": "Appeal of 123 Main St"},
            "not an object",
            {"item_number": 2, "title": "Appeal of 456 Oak Ave"}
        ]"#;
        let items = parse_items(raw).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_number, Some(1));
        assert_eq!(items[1].item_number, Some(2));
    }

    fn context(reference: &str, status: AppealStatus) -> ActiveAppealContext {
        ActiveAppealContext {
            reference_number: Some(reference.to_string()),
            project_address: Some("2190 Shattuck Ave".to_string()),
            summary: Some("Neighbors appeal the density bonus".to_string()),
            status,
            last_hearing_date: NaiveDate::from_ymd_opt(2026, 1, 13),
            last_action: Some("Continued to February 10".to_string()),
        }
    }

    #[test]
    fn prompt_lists_active_appeals() {
        let prompt = build_prompt(&[context("24-0091", AppealStatus::Pending)]);
        assert!(prompt.contains("reference_number: 24-0091"));
        assert!(prompt.contains("status: pending"));
        assert!(prompt.contains("last hearing: 2026-01-13 (Continued to February 10)"));
        assert!(prompt.contains("summary: Neighbors appeal the density bonus"));
    }

    #[test]
    fn prompt_without_active_appeals_says_so() {
        let prompt = build_prompt(&[]);
        assert!(prompt.contains("no open appeals"));
        assert!(!prompt.contains("reference_number: 24-"));
    }

    #[test]
    fn prompt_always_carries_the_schema() {
        let prompt = build_prompt(&[]);
        assert!(prompt.contains("\"grounds_category\""));
        assert!(prompt.contains("\"hearing_type\""));
        assert!(prompt.contains("\"appeal_status\""));
        assert!(prompt.contains("Return ONLY valid JSON"));
    }
}
