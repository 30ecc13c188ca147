//! HTTP fetch utility, agenda-PDF blob storage, and the appeal record store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use appealwatch_core::{
    ActiveAppealContext, AgendaItem, Appeal, AppealDecision, AppealStatus, BlobRef, FetcherKind,
    GroundsCategory, Hearing, HearingType, ItemType, Meeting, MeetingStatus, MeetingType, Source,
};

pub const CRATE_NAME: &str = "appealwatch-storage";

// =========================================================================
// HTTP fetch utility
// =========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_redirect() {
        // Exceeded the redirect cap; retrying will loop the same way.
        return RetryDisposition::NonRetryable;
    }
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Agenda sites sit behind aggressive municipal CDNs; redirect chains of
/// three or four hops are normal, anything past ten is a loop.
pub const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "appealwatch/0.1 (housing appeal tracker)".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response for {url} is not valid UTF-8")]
    NotText { url: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET a URL, following redirects, retrying retryable failures with
    /// exponential backoff. The body is accumulated chunk by chunk so a
    /// multi-megabyte agenda packet is never held twice in flight.
    pub async fn fetch_bytes(&self, source_slug: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_slug, url);
        async move {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let mut resp = resp;
                            let mut body = Vec::new();
                            while let Some(chunk) = resp.chunk().await? {
                                body.extend_from_slice(&chunk);
                            }
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }

            Err(FetchError::Request(
                last_request_error.expect("retry loop should capture a request error"),
            ))
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_text(&self, source_slug: &str, url: &str) -> Result<String, FetchError> {
        let resp = self.fetch_bytes(source_slug, url).await?;
        String::from_utf8(resp.body).map_err(|_| FetchError::NotText {
            url: url.to_string(),
        })
    }
}

// =========================================================================
// Blob sink for agenda PDFs
// =========================================================================

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opaque PDF sink: the pipeline attaches a downloaded agenda once and reads
/// it back as a byte stream for the extraction upload.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn attach(
        &self,
        meeting: &Meeting,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> anyhow::Result<BlobRef>;

    async fn open(&self, blob: &BlobRef) -> anyhow::Result<BlobReader>;

    async fn download(&self, blob: &BlobRef) -> anyhow::Result<Vec<u8>>;
}

/// Content-hash-addressed filesystem blob store with atomic writes.
/// Re-attaching the same agenda bytes lands on the same path and is a no-op.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn blob_key(meeting: &Meeting, content_hash: &str) -> String {
        format!(
            "{}/{}/{}.pdf",
            meeting.source_id,
            meeting.date.format("%Y%m%d"),
            content_hash
        )
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn attach(
        &self,
        meeting: &Meeting,
        filename: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> anyhow::Result<BlobRef> {
        let content_hash = Self::sha256_hex(bytes);
        let key = Self::blob_key(meeting, &content_hash);
        let absolute_path = self.root.join(&key);

        let blob = BlobRef {
            key,
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            byte_size: bytes.len() as u64,
            sha256: content_hash,
        };

        let parent = absolute_path
            .parent()
            .expect("blob path always has a parent");
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating blob directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking blob path {}", absolute_path.display()))?
        {
            return Ok(blob);
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp blob file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp blob file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp blob file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(blob),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(blob)
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp blob {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    async fn open(&self, blob: &BlobRef) -> anyhow::Result<BlobReader> {
        let path = self.root.join(&blob.key);
        let file = fs::File::open(&path)
            .await
            .with_context(|| format!("opening blob {}", path.display()))?;
        Ok(Box::new(file))
    }

    async fn download(&self, blob: &BlobRef) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(&blob.key);
        fs::read(&path)
            .await
            .with_context(|| format!("reading blob {}", path.display()))
    }
}

// =========================================================================
// Record store
// =========================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSeed {
    pub city_slug: String,
    pub city_name: String,
    pub fetcher: FetcherKind,
    pub agenda_url: String,
    pub max_pages: Option<u32>,
    pub lookback_months: Option<u32>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgendaItemSeed {
    pub meeting_id: Uuid,
    pub item_number: Option<i32>,
    pub title: String,
    pub description: Option<String>,
    pub item_type: ItemType,
    pub project_address: Option<String>,
    pub apn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppeal {
    pub city_slug: String,
    pub agenda_item_id: Option<Uuid>,
    pub reference_number: Option<String>,
    pub project_name: Option<String>,
    pub project_address: Option<String>,
    pub apn: Option<String>,
    pub appellant_name: Option<String>,
    pub grounds_category: Option<GroundsCategory>,
    pub grounds_description: Option<String>,
    pub description: Option<String>,
    pub status: AppealStatus,
    pub filed_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HearingSeed {
    pub appeal_id: Uuid,
    pub meeting_id: Uuid,
    pub hearing_type: HearingType,
    pub action_taken: Option<String>,
    pub description: Option<String>,
    pub grounds_description: Option<String>,
    pub page_number: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppealProgress {
    pub status: AppealStatus,
    pub decision: Option<AppealDecision>,
    pub decision_date: Option<NaiveDate>,
}

/// Record store behind the ingestion pipeline. Every find-or-create is
/// atomic on its natural key so concurrent fetch cycles stay correct.
#[async_trait]
pub trait AppealStore: Send + Sync {
    async fn upsert_source(&self, seed: &SourceSeed) -> Result<Source, StoreError>;

    async fn touch_source(&self, source_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Look up a meeting by (source, date), creating it in `pending` with the
    /// supplied PDF URL if absent. An existing meeting is returned untouched;
    /// the URL recorded at first discovery is authoritative.
    async fn find_or_create_meeting(
        &self,
        source_id: Uuid,
        date: NaiveDate,
        pdf_url: &str,
        meeting_type: MeetingType,
    ) -> Result<Meeting, StoreError>;

    async fn set_meeting_blob(&self, meeting_id: Uuid, blob: &BlobRef) -> Result<(), StoreError>;

    async fn mark_meeting_processed(
        &self,
        meeting_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn find_or_create_agenda_item(
        &self,
        seed: &AgendaItemSeed,
    ) -> Result<AgendaItem, StoreError>;

    /// Keyed by (city, reference_number); the seed's reference_number must be
    /// present. Returns the appeal and whether this call created it.
    async fn find_or_create_appeal(&self, new: &NewAppeal) -> Result<(Appeal, bool), StoreError>;

    /// Unconditional creation for items with no extractable reference number.
    async fn create_appeal(&self, new: &NewAppeal) -> Result<Appeal, StoreError>;

    async fn update_appeal_progress(
        &self,
        appeal_id: Uuid,
        progress: &AppealProgress,
    ) -> Result<Appeal, StoreError>;

    /// Keyed by (appeal, meeting). An existing hearing is left untouched;
    /// returns whether this call created it.
    async fn find_or_create_hearing(&self, seed: &HearingSeed) -> Result<(Hearing, bool), StoreError>;

    /// Snapshot of the city's appeals whose status is not decided/withdrawn,
    /// each with its most recent hearing date and action.
    async fn active_appeals(&self, city_slug: &str) -> Result<Vec<ActiveAppealContext>, StoreError>;
}

fn validate_agenda_item(seed: &AgendaItemSeed) -> Result<(), StoreError> {
    if seed.title.trim().is_empty() {
        return Err(StoreError::Validation(format!(
            "agenda item {:?} on meeting {} has a blank title",
            seed.item_number, seed.meeting_id
        )));
    }
    Ok(())
}

// =========================================================================
// In-memory store
// =========================================================================

/// Mutex-guarded in-memory store. The single lock makes every natural-key
/// find-or-create atomic; production runs use [`PgStore`] instead.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    sources: HashMap<Uuid, Source>,
    meetings: HashMap<Uuid, Meeting>,
    agenda_items: HashMap<Uuid, AgendaItem>,
    appeals: HashMap<Uuid, Appeal>,
    hearings: HashMap<Uuid, Hearing>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meeting(&self, meeting_id: Uuid) -> Option<Meeting> {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .meetings
            .get(&meeting_id)
            .cloned()
    }

    pub fn appeals(&self) -> Vec<Appeal> {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .appeals
            .values()
            .cloned()
            .collect()
    }

    pub fn hearings(&self) -> Vec<Hearing> {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .hearings
            .values()
            .cloned()
            .collect()
    }

    pub fn agenda_items(&self) -> Vec<AgendaItem> {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .agenda_items
            .values()
            .cloned()
            .collect()
    }

    pub fn source(&self, source_id: Uuid) -> Option<Source> {
        self.inner
            .lock()
            .expect("memory store lock poisoned")
            .sources
            .get(&source_id)
            .cloned()
    }
}

#[async_trait]
impl AppealStore for MemoryStore {
    async fn upsert_source(&self, seed: &SourceSeed) -> Result<Source, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if let Some(existing) = inner
            .sources
            .values_mut()
            .find(|s| s.city_slug == seed.city_slug)
        {
            existing.city_name = seed.city_name.clone();
            existing.fetcher = seed.fetcher;
            existing.agenda_url = seed.agenda_url.clone();
            existing.max_pages = seed.max_pages;
            existing.lookback_months = seed.lookback_months;
            existing.enabled = seed.enabled;
            return Ok(existing.clone());
        }
        let source = Source {
            id: Uuid::new_v4(),
            city_slug: seed.city_slug.clone(),
            city_name: seed.city_name.clone(),
            fetcher: seed.fetcher,
            agenda_url: seed.agenda_url.clone(),
            max_pages: seed.max_pages,
            lookback_months: seed.lookback_months,
            enabled: seed.enabled,
            last_fetched_at: None,
        };
        inner.sources.insert(source.id, source.clone());
        Ok(source)
    }

    async fn touch_source(&self, source_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let source = inner
            .sources
            .get_mut(&source_id)
            .ok_or_else(|| StoreError::NotFound(format!("source {source_id}")))?;
        source.last_fetched_at = Some(at);
        Ok(())
    }

    async fn find_or_create_meeting(
        &self,
        source_id: Uuid,
        date: NaiveDate,
        pdf_url: &str,
        meeting_type: MeetingType,
    ) -> Result<Meeting, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if let Some(existing) = inner
            .meetings
            .values()
            .find(|m| m.source_id == source_id && m.date == date)
        {
            return Ok(existing.clone());
        }
        let meeting = Meeting {
            id: Uuid::new_v4(),
            source_id,
            date,
            meeting_type,
            status: MeetingStatus::Pending,
            pdf_url: Some(pdf_url.to_string()),
            pdf_blob: None,
            fetched_at: None,
        };
        inner.meetings.insert(meeting.id, meeting.clone());
        Ok(meeting)
    }

    async fn set_meeting_blob(&self, meeting_id: Uuid, blob: &BlobRef) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let meeting = inner
            .meetings
            .get_mut(&meeting_id)
            .ok_or_else(|| StoreError::NotFound(format!("meeting {meeting_id}")))?;
        meeting.pdf_blob = Some(blob.clone());
        Ok(())
    }

    async fn mark_meeting_processed(
        &self,
        meeting_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let meeting = inner
            .meetings
            .get_mut(&meeting_id)
            .ok_or_else(|| StoreError::NotFound(format!("meeting {meeting_id}")))?;
        meeting.status = MeetingStatus::Processed;
        meeting.fetched_at = Some(at);
        Ok(())
    }

    async fn find_or_create_agenda_item(
        &self,
        seed: &AgendaItemSeed,
    ) -> Result<AgendaItem, StoreError> {
        validate_agenda_item(seed)?;
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if let Some(existing) = inner
            .agenda_items
            .values()
            .find(|i| i.meeting_id == seed.meeting_id && i.item_number == seed.item_number)
        {
            return Ok(existing.clone());
        }
        let item = AgendaItem {
            id: Uuid::new_v4(),
            meeting_id: seed.meeting_id,
            item_number: seed.item_number,
            title: seed.title.clone(),
            description: seed.description.clone(),
            item_type: seed.item_type,
            project_address: seed.project_address.clone(),
            apn: seed.apn.clone(),
        };
        inner.agenda_items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn find_or_create_appeal(&self, new: &NewAppeal) -> Result<(Appeal, bool), StoreError> {
        let reference = new.reference_number.as_deref().ok_or_else(|| {
            StoreError::Validation("find_or_create_appeal requires a reference number".to_string())
        })?;
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if let Some(existing) = inner.appeals.values().find(|a| {
            a.city_slug == new.city_slug && a.reference_number.as_deref() == Some(reference)
        }) {
            return Ok((existing.clone(), false));
        }
        let appeal = appeal_from_new(new);
        inner.appeals.insert(appeal.id, appeal.clone());
        Ok((appeal, true))
    }

    async fn create_appeal(&self, new: &NewAppeal) -> Result<Appeal, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let appeal = appeal_from_new(new);
        inner.appeals.insert(appeal.id, appeal.clone());
        Ok(appeal)
    }

    async fn update_appeal_progress(
        &self,
        appeal_id: Uuid,
        progress: &AppealProgress,
    ) -> Result<Appeal, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let appeal = inner
            .appeals
            .get_mut(&appeal_id)
            .ok_or_else(|| StoreError::NotFound(format!("appeal {appeal_id}")))?;
        appeal.status = progress.status;
        if let Some(decision) = progress.decision {
            appeal.decision = Some(decision);
            if appeal.decision_date.is_none() {
                appeal.decision_date = progress.decision_date;
            }
        }
        Ok(appeal.clone())
    }

    async fn find_or_create_hearing(
        &self,
        seed: &HearingSeed,
    ) -> Result<(Hearing, bool), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if let Some(existing) = inner
            .hearings
            .values()
            .find(|h| h.appeal_id == seed.appeal_id && h.meeting_id == seed.meeting_id)
        {
            return Ok((existing.clone(), false));
        }
        let hearing = Hearing {
            id: Uuid::new_v4(),
            appeal_id: seed.appeal_id,
            meeting_id: seed.meeting_id,
            hearing_type: seed.hearing_type,
            action_taken: seed.action_taken.clone(),
            description: seed.description.clone(),
            grounds_description: seed.grounds_description.clone(),
            page_number: seed.page_number,
        };
        inner.hearings.insert(hearing.id, hearing.clone());
        Ok((hearing, true))
    }

    async fn active_appeals(&self, city_slug: &str) -> Result<Vec<ActiveAppealContext>, StoreError> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        let mut contexts: Vec<(Option<NaiveDate>, ActiveAppealContext)> = inner
            .appeals
            .values()
            .filter(|a| a.city_slug == city_slug && a.status.is_active())
            .map(|appeal| {
                let last = inner
                    .hearings
                    .values()
                    .filter(|h| h.appeal_id == appeal.id)
                    .filter_map(|h| {
                        inner
                            .meetings
                            .get(&h.meeting_id)
                            .map(|m| (m.date, h.action_taken.clone()))
                    })
                    .max_by_key(|(date, _)| *date);
                (
                    appeal.filed_date,
                    ActiveAppealContext {
                        reference_number: appeal.reference_number.clone(),
                        project_address: appeal.project_address.clone(),
                        summary: appeal.description.clone(),
                        status: appeal.status,
                        last_hearing_date: last.as_ref().map(|(date, _)| *date),
                        last_action: last.and_then(|(_, action)| action),
                    },
                )
            })
            .collect();
        contexts.sort_by_key(|(filed, _)| (filed.is_none(), *filed));
        Ok(contexts.into_iter().map(|(_, ctx)| ctx).collect())
    }
}

fn appeal_from_new(new: &NewAppeal) -> Appeal {
    Appeal {
        id: Uuid::new_v4(),
        city_slug: new.city_slug.clone(),
        agenda_item_id: new.agenda_item_id,
        reference_number: new.reference_number.clone(),
        project_name: new.project_name.clone(),
        project_address: new.project_address.clone(),
        apn: new.apn.clone(),
        appellant_name: new.appellant_name.clone(),
        grounds_category: new.grounds_category,
        grounds_description: new.grounds_description.clone(),
        description: new.description.clone(),
        status: new.status,
        decision: None,
        filed_date: new.filed_date,
        decision_date: None,
    }
}

// =========================================================================
// Postgres store
// =========================================================================

/// Production store. Unique indexes on the natural keys plus
/// `ON CONFLICT DO NOTHING` + re-select give atomic get-or-create under
/// concurrent fetch cycles.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")
    }
}

fn parse_enum<T>(
    value: &str,
    parse: fn(&str) -> Option<T>,
    what: &str,
) -> Result<T, StoreError> {
    parse(value).ok_or_else(|| StoreError::Validation(format!("unknown {what} value '{value}'")))
}

fn source_from_row(row: &PgRow) -> Result<Source, StoreError> {
    let fetcher: String = row.try_get("fetcher")?;
    let max_pages: Option<i32> = row.try_get("max_pages")?;
    let lookback_months: Option<i32> = row.try_get("lookback_months")?;
    Ok(Source {
        id: row.try_get("id")?,
        city_slug: row.try_get("city_slug")?,
        city_name: row.try_get("city_name")?,
        fetcher: parse_enum(&fetcher, FetcherKind::parse, "fetcher")?,
        agenda_url: row.try_get("agenda_url")?,
        max_pages: max_pages.map(|v| v as u32),
        lookback_months: lookback_months.map(|v| v as u32),
        enabled: row.try_get("enabled")?,
        last_fetched_at: row.try_get("last_fetched_at")?,
    })
}

fn meeting_from_row(row: &PgRow) -> Result<Meeting, StoreError> {
    let meeting_type: String = row.try_get("meeting_type")?;
    let status: String = row.try_get("status")?;
    let blob_key: Option<String> = row.try_get("blob_key")?;
    let pdf_blob = match blob_key {
        Some(key) => {
            let byte_size: i64 = row.try_get("blob_byte_size")?;
            Some(BlobRef {
                key,
                filename: row.try_get("blob_filename")?,
                content_type: row.try_get("blob_content_type")?,
                byte_size: byte_size as u64,
                sha256: row.try_get("blob_sha256")?,
            })
        }
        None => None,
    };
    Ok(Meeting {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        date: row.try_get("meeting_date")?,
        meeting_type: parse_enum(&meeting_type, MeetingType::parse, "meeting_type")?,
        status: parse_enum(&status, MeetingStatus::parse, "meeting status")?,
        pdf_url: row.try_get("pdf_url")?,
        pdf_blob,
        fetched_at: row.try_get("fetched_at")?,
    })
}

fn agenda_item_from_row(row: &PgRow) -> Result<AgendaItem, StoreError> {
    let item_type: String = row.try_get("item_type")?;
    Ok(AgendaItem {
        id: row.try_get("id")?,
        meeting_id: row.try_get("meeting_id")?,
        item_number: row.try_get("item_number")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        item_type: parse_enum(&item_type, ItemType::parse, "item_type")?,
        project_address: row.try_get("project_address")?,
        apn: row.try_get("apn")?,
    })
}

fn appeal_from_row(row: &PgRow) -> Result<Appeal, StoreError> {
    let status: String = row.try_get("status")?;
    let decision: Option<String> = row.try_get("decision")?;
    let grounds: Option<String> = row.try_get("grounds_category")?;
    Ok(Appeal {
        id: row.try_get("id")?,
        city_slug: row.try_get("city_slug")?,
        agenda_item_id: row.try_get("agenda_item_id")?,
        reference_number: row.try_get("reference_number")?,
        project_name: row.try_get("project_name")?,
        project_address: row.try_get("project_address")?,
        apn: row.try_get("apn")?,
        appellant_name: row.try_get("appellant_name")?,
        grounds_category: grounds
            .map(|g| parse_enum(&g, GroundsCategory::parse, "grounds_category"))
            .transpose()?,
        grounds_description: row.try_get("grounds_description")?,
        description: row.try_get("description")?,
        status: parse_enum(&status, AppealStatus::parse, "appeal status")?,
        decision: decision
            .map(|d| parse_enum(&d, AppealDecision::parse, "decision"))
            .transpose()?,
        filed_date: row.try_get("filed_date")?,
        decision_date: row.try_get("decision_date")?,
    })
}

fn hearing_from_row(row: &PgRow) -> Result<Hearing, StoreError> {
    let hearing_type: String = row.try_get("hearing_type")?;
    Ok(Hearing {
        id: row.try_get("id")?,
        appeal_id: row.try_get("appeal_id")?,
        meeting_id: row.try_get("meeting_id")?,
        hearing_type: parse_enum(&hearing_type, HearingType::parse, "hearing_type")?,
        action_taken: row.try_get("action_taken")?,
        description: row.try_get("description")?,
        grounds_description: row.try_get("grounds_description")?,
        page_number: row.try_get("page_number")?,
    })
}

#[async_trait]
impl AppealStore for PgStore {
    async fn upsert_source(&self, seed: &SourceSeed) -> Result<Source, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO sources (id, city_slug, city_name, fetcher, agenda_url,
                                 max_pages, lookback_months, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (city_slug) DO UPDATE
               SET city_name = EXCLUDED.city_name,
                   fetcher = EXCLUDED.fetcher,
                   agenda_url = EXCLUDED.agenda_url,
                   max_pages = EXCLUDED.max_pages,
                   lookback_months = EXCLUDED.lookback_months,
                   enabled = EXCLUDED.enabled
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&seed.city_slug)
        .bind(&seed.city_name)
        .bind(seed.fetcher.as_str())
        .bind(&seed.agenda_url)
        .bind(seed.max_pages.map(|v| v as i32))
        .bind(seed.lookback_months.map(|v| v as i32))
        .bind(seed.enabled)
        .fetch_one(&self.pool)
        .await?;
        source_from_row(&row)
    }

    async fn touch_source(&self, source_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sources SET last_fetched_at = $2 WHERE id = $1")
            .bind(source_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("source {source_id}")));
        }
        Ok(())
    }

    async fn find_or_create_meeting(
        &self,
        source_id: Uuid,
        date: NaiveDate,
        pdf_url: &str,
        meeting_type: MeetingType,
    ) -> Result<Meeting, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO meetings (id, source_id, meeting_date, meeting_type, status, pdf_url)
            VALUES ($1, $2, $3, $4, 'pending', $5)
            ON CONFLICT (source_id, meeting_date) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(source_id)
        .bind(date)
        .bind(meeting_type.as_str())
        .bind(pdf_url)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return meeting_from_row(&row);
        }

        let row = sqlx::query("SELECT * FROM meetings WHERE source_id = $1 AND meeting_date = $2")
            .bind(source_id)
            .bind(date)
            .fetch_one(&self.pool)
            .await?;
        meeting_from_row(&row)
    }

    async fn set_meeting_blob(&self, meeting_id: Uuid, blob: &BlobRef) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE meetings
               SET blob_key = $2,
                   blob_filename = $3,
                   blob_content_type = $4,
                   blob_byte_size = $5,
                   blob_sha256 = $6
             WHERE id = $1
            "#,
        )
        .bind(meeting_id)
        .bind(&blob.key)
        .bind(&blob.filename)
        .bind(&blob.content_type)
        .bind(blob.byte_size as i64)
        .bind(&blob.sha256)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("meeting {meeting_id}")));
        }
        Ok(())
    }

    async fn mark_meeting_processed(
        &self,
        meeting_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE meetings SET status = 'processed', fetched_at = $2 WHERE id = $1")
                .bind(meeting_id)
                .bind(at)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("meeting {meeting_id}")));
        }
        Ok(())
    }

    async fn find_or_create_agenda_item(
        &self,
        seed: &AgendaItemSeed,
    ) -> Result<AgendaItem, StoreError> {
        validate_agenda_item(seed)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO agenda_items (id, meeting_id, item_number, title, description,
                                      item_type, project_address, apn)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (meeting_id, item_number) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(seed.meeting_id)
        .bind(seed.item_number)
        .bind(&seed.title)
        .bind(&seed.description)
        .bind(seed.item_type.as_str())
        .bind(&seed.project_address)
        .bind(&seed.apn)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return agenda_item_from_row(&row);
        }

        let row = sqlx::query(
            r#"
            SELECT * FROM agenda_items
             WHERE meeting_id = $1 AND item_number IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(seed.meeting_id)
        .bind(seed.item_number)
        .fetch_one(&self.pool)
        .await?;
        agenda_item_from_row(&row)
    }

    async fn find_or_create_appeal(&self, new: &NewAppeal) -> Result<(Appeal, bool), StoreError> {
        let reference = new.reference_number.as_deref().ok_or_else(|| {
            StoreError::Validation("find_or_create_appeal requires a reference number".to_string())
        })?;

        let inserted = self.insert_appeal(new, true).await?;
        if let Some(appeal) = inserted {
            return Ok((appeal, true));
        }

        let row = sqlx::query(
            "SELECT * FROM appeals WHERE city_slug = $1 AND reference_number = $2",
        )
        .bind(&new.city_slug)
        .bind(reference)
        .fetch_one(&self.pool)
        .await?;
        Ok((appeal_from_row(&row)?, false))
    }

    async fn create_appeal(&self, new: &NewAppeal) -> Result<Appeal, StoreError> {
        let appeal = self.insert_appeal(new, false).await?;
        appeal.ok_or_else(|| StoreError::Validation("appeal insert returned no row".to_string()))
    }

    async fn update_appeal_progress(
        &self,
        appeal_id: Uuid,
        progress: &AppealProgress,
    ) -> Result<Appeal, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE appeals
               SET status = $2,
                   decision = COALESCE($3, decision),
                   decision_date = CASE
                       WHEN $3 IS NOT NULL AND decision_date IS NULL THEN $4
                       ELSE decision_date
                   END
             WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(appeal_id)
        .bind(progress.status.as_str())
        .bind(progress.decision.map(|d| d.as_str()))
        .bind(progress.decision_date)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("appeal {appeal_id}")))?;
        appeal_from_row(&row)
    }

    async fn find_or_create_hearing(
        &self,
        seed: &HearingSeed,
    ) -> Result<(Hearing, bool), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO hearings (id, appeal_id, meeting_id, hearing_type, action_taken,
                                  description, grounds_description, page_number)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (appeal_id, meeting_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(seed.appeal_id)
        .bind(seed.meeting_id)
        .bind(seed.hearing_type.as_str())
        .bind(&seed.action_taken)
        .bind(&seed.description)
        .bind(&seed.grounds_description)
        .bind(seed.page_number)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((hearing_from_row(&row)?, true));
        }

        let row = sqlx::query("SELECT * FROM hearings WHERE appeal_id = $1 AND meeting_id = $2")
            .bind(seed.appeal_id)
            .bind(seed.meeting_id)
            .fetch_one(&self.pool)
            .await?;
        Ok((hearing_from_row(&row)?, false))
    }

    async fn active_appeals(&self, city_slug: &str) -> Result<Vec<ActiveAppealContext>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT a.reference_number,
                   a.project_address,
                   a.description AS summary,
                   a.status,
                   h.meeting_date AS last_hearing_date,
                   h.action_taken AS last_action
              FROM appeals a
              LEFT JOIN LATERAL (
                  SELECT m.meeting_date, hh.action_taken
                    FROM hearings hh
                    JOIN meetings m ON m.id = hh.meeting_id
                   WHERE hh.appeal_id = a.id
                   ORDER BY m.meeting_date DESC
                   LIMIT 1
              ) h ON TRUE
             WHERE a.city_slug = $1
               AND a.status NOT IN ('decided', 'withdrawn')
             ORDER BY a.filed_date ASC NULLS LAST
            "#,
        )
        .bind(city_slug)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            out.push(ActiveAppealContext {
                reference_number: row.try_get("reference_number")?,
                project_address: row.try_get("project_address")?,
                summary: row.try_get("summary")?,
                status: parse_enum(&status, AppealStatus::parse, "appeal status")?,
                last_hearing_date: row.try_get("last_hearing_date")?,
                last_action: row.try_get("last_action")?,
            });
        }
        Ok(out)
    }
}

impl PgStore {
    async fn insert_appeal(
        &self,
        new: &NewAppeal,
        on_conflict_do_nothing: bool,
    ) -> Result<Option<Appeal>, StoreError> {
        let conflict_clause = if on_conflict_do_nothing {
            "ON CONFLICT (city_slug, reference_number) DO NOTHING"
        } else {
            ""
        };
        let sql = format!(
            r#"
            INSERT INTO appeals (id, city_slug, agenda_item_id, reference_number, project_name,
                                 project_address, apn, appellant_name, grounds_category,
                                 grounds_description, description, status, filed_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            {conflict_clause}
            RETURNING *
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.city_slug)
            .bind(new.agenda_item_id)
            .bind(&new.reference_number)
            .bind(&new.project_name)
            .bind(&new.project_address)
            .bind(&new.apn)
            .bind(&new.appellant_name)
            .bind(new.grounds_category.map(|g| g.as_str()))
            .bind(&new.grounds_description)
            .bind(&new.description)
            .bind(new.status.as_str())
            .bind(new.filed_date)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| appeal_from_row(&r)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_meeting() -> Meeting {
        Meeting {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2026, 2, 10).expect("date"),
            meeting_type: MeetingType::Regular,
            status: MeetingStatus::Pending,
            pdf_url: Some("https://example.org/agenda.pdf".to_string()),
            pdf_blob: None,
            fetched_at: None,
        }
    }

    fn sample_new_appeal(city: &str, reference: Option<&str>) -> NewAppeal {
        NewAppeal {
            city_slug: city.to_string(),
            agenda_item_id: None,
            reference_number: reference.map(ToString::to_string),
            project_name: None,
            project_address: Some("123 Main St".to_string()),
            apn: None,
            appellant_name: None,
            grounds_category: Some(GroundsCategory::Ceqa),
            grounds_description: None,
            description: Some("Appeal of 123 Main St".to_string()),
            status: AppealStatus::Pending,
            filed_date: NaiveDate::from_ymd_opt(2026, 2, 10),
        }
    }

    #[test]
    fn blob_hashing_is_stable() {
        let hash = FsBlobStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn attach_is_atomic_and_deduplicates_by_content() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let meeting = sample_meeting();

        let first = store
            .attach(&meeting, "agenda.pdf", "application/pdf", b"%PDF-1.7 same")
            .await
            .expect("first attach");
        let second = store
            .attach(&meeting, "agenda.pdf", "application/pdf", b"%PDF-1.7 same")
            .await
            .expect("second attach");

        assert_eq!(first.key, second.key);
        assert_eq!(first.sha256, second.sha256);
        assert!(dir.path().join(&first.key).exists());

        let bytes = store.download(&first).await.expect("download");
        assert_eq!(bytes, b"%PDF-1.7 same");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn meeting_find_or_create_is_idempotent_and_keeps_first_url() {
        let store = MemoryStore::new();
        let source_id = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2026, 2, 10).expect("date");

        let first = store
            .find_or_create_meeting(source_id, date, "https://a/agenda.pdf", MeetingType::Regular)
            .await
            .expect("first");
        let second = store
            .find_or_create_meeting(source_id, date, "https://b/other.pdf", MeetingType::Regular)
            .await
            .expect("second");

        assert_eq!(first.id, second.id);
        assert_eq!(second.pdf_url.as_deref(), Some("https://a/agenda.pdf"));
        assert_eq!(second.status, MeetingStatus::Pending);
    }

    #[tokio::test]
    async fn appeal_find_or_create_requires_reference_number() {
        let store = MemoryStore::new();
        let err = store
            .find_or_create_appeal(&sample_new_appeal("berkeley", None))
            .await
            .expect_err("should refuse");
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn hearing_upsert_preserves_first_write() {
        let store = MemoryStore::new();
        let appeal_id = Uuid::new_v4();
        let meeting_id = Uuid::new_v4();

        let (first, created) = store
            .find_or_create_hearing(&HearingSeed {
                appeal_id,
                meeting_id,
                hearing_type: HearingType::Initial,
                action_taken: Some("Continued to March".to_string()),
                description: None,
                grounds_description: None,
                page_number: Some(4),
            })
            .await
            .expect("first");
        assert!(created);

        let (second, created) = store
            .find_or_create_hearing(&HearingSeed {
                appeal_id,
                meeting_id,
                hearing_type: HearingType::Decision,
                action_taken: Some("Denied".to_string()),
                description: None,
                grounds_description: None,
                page_number: None,
            })
            .await
            .expect("second");
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.hearing_type, HearingType::Initial);
        assert_eq!(second.action_taken.as_deref(), Some("Continued to March"));
    }

    #[tokio::test]
    async fn active_appeals_exclude_decided_and_withdrawn() {
        let store = MemoryStore::new();
        let (open, _) = store
            .find_or_create_appeal(&sample_new_appeal("berkeley", Some("24-0001")))
            .await
            .expect("open appeal");
        let (closed, _) = store
            .find_or_create_appeal(&sample_new_appeal("berkeley", Some("24-0002")))
            .await
            .expect("closed appeal");
        store
            .update_appeal_progress(
                closed.id,
                &AppealProgress {
                    status: AppealStatus::Decided,
                    decision: Some(AppealDecision::Denied),
                    decision_date: NaiveDate::from_ymd_opt(2026, 3, 1),
                },
            )
            .await
            .expect("close");

        let active = store.active_appeals("berkeley").await.expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(
            active[0].reference_number,
            open.reference_number
        );
        assert_eq!(store.active_appeals("oakland").await.expect("other").len(), 0);
    }

    #[tokio::test]
    async fn decision_date_is_set_once() {
        let store = MemoryStore::new();
        let (appeal, _) = store
            .find_or_create_appeal(&sample_new_appeal("berkeley", Some("24-0003")))
            .await
            .expect("appeal");

        let first = store
            .update_appeal_progress(
                appeal.id,
                &AppealProgress {
                    status: AppealStatus::Decided,
                    decision: Some(AppealDecision::Continued),
                    decision_date: NaiveDate::from_ymd_opt(2026, 3, 1),
                },
            )
            .await
            .expect("first decision");
        assert_eq!(first.decision_date, NaiveDate::from_ymd_opt(2026, 3, 1));

        let second = store
            .update_appeal_progress(
                appeal.id,
                &AppealProgress {
                    status: AppealStatus::Decided,
                    decision: Some(AppealDecision::Denied),
                    decision_date: NaiveDate::from_ymd_opt(2026, 4, 1),
                },
            )
            .await
            .expect("second decision");
        assert_eq!(second.decision, Some(AppealDecision::Denied));
        assert_eq!(second.decision_date, NaiveDate::from_ymd_opt(2026, 3, 1));
    }
}
