//! Core domain model for appealwatch: cities' agenda sources, council
//! meetings, agenda items, and the cross-meeting appeal/hearing records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "appealwatch-core";

/// Which city-specific listing scraper a source uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetcherKind {
    Berkeley,
    SanFrancisco,
}

impl FetcherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetcherKind::Berkeley => "berkeley",
            FetcherKind::SanFrancisco => "san_francisco",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "berkeley" => Some(FetcherKind::Berkeley),
            "san_francisco" => Some(FetcherKind::SanFrancisco),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingType {
    Regular,
    Special,
    ClosedSession,
}

impl MeetingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingType::Regular => "regular",
            MeetingType::Special => "special",
            MeetingType::ClosedSession => "closed_session",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "regular" => Some(MeetingType::Regular),
            "special" => Some(MeetingType::Special),
            "closed_session" => Some(MeetingType::ClosedSession),
            _ => None,
        }
    }
}

/// Meeting lifecycle. The pipeline only ever moves pending → processed;
/// `error` is reserved for operator tooling and manual resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Pending,
    Processed,
    Error,
}

impl MeetingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingStatus::Pending => "pending",
            MeetingStatus::Processed => "processed",
            MeetingStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MeetingStatus::Pending),
            "processed" => Some(MeetingStatus::Processed),
            "error" => Some(MeetingStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealStatus {
    Filed,
    Pending,
    Heard,
    Decided,
    Withdrawn,
}

impl AppealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppealStatus::Filed => "filed",
            AppealStatus::Pending => "pending",
            AppealStatus::Heard => "heard",
            AppealStatus::Decided => "decided",
            AppealStatus::Withdrawn => "withdrawn",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "filed" => Some(AppealStatus::Filed),
            "pending" => Some(AppealStatus::Pending),
            "heard" => Some(AppealStatus::Heard),
            "decided" => Some(AppealStatus::Decided),
            "withdrawn" => Some(AppealStatus::Withdrawn),
            _ => None,
        }
    }

    /// Active appeals are the ones still worth showing to the extraction
    /// prompt as continuation candidates.
    pub fn is_active(&self) -> bool {
        !matches!(self, AppealStatus::Decided | AppealStatus::Withdrawn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppealDecision {
    Granted,
    Denied,
    Continued,
    Withdrawn,
}

impl AppealDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppealDecision::Granted => "granted",
            AppealDecision::Denied => "denied",
            AppealDecision::Continued => "continued",
            AppealDecision::Withdrawn => "withdrawn",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "granted" => Some(AppealDecision::Granted),
            "denied" => Some(AppealDecision::Denied),
            "continued" => Some(AppealDecision::Continued),
            "withdrawn" => Some(AppealDecision::Withdrawn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundsCategory {
    #[serde(rename = "CEQA")]
    Ceqa,
    DesignReview,
    UsePermit,
    NeighborhoodImpact,
    Procedural,
    Other,
}

impl GroundsCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroundsCategory::Ceqa => "CEQA",
            GroundsCategory::DesignReview => "design_review",
            GroundsCategory::UsePermit => "use_permit",
            GroundsCategory::NeighborhoodImpact => "neighborhood_impact",
            GroundsCategory::Procedural => "procedural",
            GroundsCategory::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CEQA" => Some(GroundsCategory::Ceqa),
            "design_review" => Some(GroundsCategory::DesignReview),
            "use_permit" => Some(GroundsCategory::UsePermit),
            "neighborhood_impact" => Some(GroundsCategory::NeighborhoodImpact),
            "procedural" => Some(GroundsCategory::Procedural),
            "other" => Some(GroundsCategory::Other),
            _ => None,
        }
    }
}

/// What happened to an appeal at one specific meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HearingType {
    Filing,
    Initial,
    Continued,
    Action,
    PublicComment,
    Decision,
    Communication,
    Other,
}

impl HearingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HearingType::Filing => "filing",
            HearingType::Initial => "initial",
            HearingType::Continued => "continued",
            HearingType::Action => "action",
            HearingType::PublicComment => "public_comment",
            HearingType::Decision => "decision",
            HearingType::Communication => "communication",
            HearingType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "filing" => Some(HearingType::Filing),
            "initial" => Some(HearingType::Initial),
            "continued" => Some(HearingType::Continued),
            "action" => Some(HearingType::Action),
            "public_comment" => Some(HearingType::PublicComment),
            "decision" => Some(HearingType::Decision),
            "communication" => Some(HearingType::Communication),
            "other" => Some(HearingType::Other),
            _ => None,
        }
    }

    /// Hearings with substantive new content; the rest are timeline chips.
    pub fn is_substantive(&self) -> bool {
        matches!(
            self,
            HearingType::Initial | HearingType::Decision | HearingType::Action
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Appeal,
    Variance,
    Permit,
    Other,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Appeal => "appeal",
            ItemType::Variance => "variance",
            ItemType::Permit => "permit",
            ItemType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "appeal" => Some(ItemType::Appeal),
            "variance" => Some(ItemType::Variance),
            "permit" => Some(ItemType::Permit),
            "other" => Some(ItemType::Other),
            _ => None,
        }
    }
}

/// Pointer into the blob sink for a stored agenda PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub key: String,
    pub filename: String,
    pub content_type: String,
    pub byte_size: u64,
    pub sha256: String,
}

/// One city's configured agenda website + scraping parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub city_slug: String,
    pub city_name: String,
    pub fetcher: FetcherKind,
    pub agenda_url: String,
    pub max_pages: Option<u32>,
    pub lookback_months: Option<u32>,
    pub enabled: bool,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// One council session on one date, with one agenda document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Uuid,
    pub source_id: Uuid,
    pub date: NaiveDate,
    pub meeting_type: MeetingType,
    pub status: MeetingStatus,
    pub pdf_url: Option<String>,
    pub pdf_blob: Option<BlobRef>,
    pub fetched_at: Option<DateTime<Utc>>,
}

/// One line entry on a meeting's agenda, pre-reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgendaItem {
    pub id: Uuid,
    pub meeting_id: Uuid,
    pub item_number: Option<i32>,
    pub title: String,
    pub description: Option<String>,
    pub item_type: ItemType,
    pub project_address: Option<String>,
    pub apn: Option<String>,
}

/// The canonical, cross-meeting case record for one housing appeal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appeal {
    pub id: Uuid,
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
    pub decision: Option<AppealDecision>,
    pub filed_date: Option<NaiveDate>,
    pub decision_date: Option<NaiveDate>,
}

/// The record of what happened to one Appeal at one specific Meeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hearing {
    pub id: Uuid,
    pub appeal_id: Uuid,
    pub meeting_id: Uuid,
    pub hearing_type: HearingType,
    pub action_taken: Option<String>,
    pub description: Option<String>,
    pub grounds_description: Option<String>,
    pub page_number: Option<i32>,
}

/// One element of the extraction backend's JSON array response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractedAppealItem {
    pub item_number: Option<i32>,
    pub page_number: Option<i32>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub appeal_description: Option<String>,
    pub project_name: Option<String>,
    pub project_address: Option<String>,
    pub apn: Option<String>,
    pub appellant_name: Option<String>,
    #[serde(deserialize_with = "lenient_grounds_category")]
    pub grounds_category: Option<GroundsCategory>,
    pub grounds_description: Option<String>,
    pub reference_number: Option<String>,
    #[serde(deserialize_with = "lenient_hearing_type")]
    pub hearing_type: Option<HearingType>,
    pub action_taken: Option<String>,
    pub appeal_status: Option<AppealStatus>,
    pub decision: Option<AppealDecision>,
}

// The model occasionally invents category labels; fold anything outside the
// documented sets into `other` instead of rejecting the whole item.
fn lenient_grounds_category<'de, D>(deserializer: D) -> Result<Option<GroundsCategory>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.map(|v| GroundsCategory::parse(&v).unwrap_or(GroundsCategory::Other)))
}

fn lenient_hearing_type<'de, D>(deserializer: D) -> Result<Option<HearingType>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.map(|v| HearingType::parse(&v).unwrap_or(HearingType::Other)))
}

/// Snapshot of one still-open appeal, fed to the extraction prompt so the
/// model can recognize continuations instead of re-filing the same case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAppealContext {
    pub reference_number: Option<String>,
    pub project_address: Option<String>,
    pub summary: Option<String>,
    pub status: AppealStatus,
    pub last_hearing_date: Option<NaiveDate>,
    pub last_action: Option<String>,
}

/// Normalize a city-issued case number as extracted from an agenda.
///
/// Extraction sometimes returns the file number with trailing planning case
/// numbers glued on ("260021; 2024-011561CUA"). The appeal identity key is
/// the first token, split on semicolon/comma/whitespace. Blank input means
/// no reference number at all.
pub fn normalize_reference_number(raw: &str) -> Option<String> {
    raw.split(|c: char| c == ';' || c == ',' || c.is_whitespace())
        .find(|token| !token.is_empty())
        .map(ToString::to_string)
}

/// Status ratchet: an extracted status only ever moves an appeal forward.
///
/// Agendas keep restating the original filing language at every hearing, so
/// "filed" acts as a floor: an appeal that has progressed past filing never
/// regresses back to it. Any other reported status wins.
pub fn advance_status(current: AppealStatus, proposed: AppealStatus) -> AppealStatus {
    if proposed == AppealStatus::Filed {
        current
    } else {
        proposed
    }
}
