//! City-specific agenda listing scrapers and the shared pagination driver.

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::warn;

use appealwatch_core::{FetcherKind, MeetingType};
use appealwatch_storage::{FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "appealwatch-fetchers";

/// One discovered (meeting date, agenda PDF) pair from a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingLead {
    pub date: NaiveDate,
    pub pdf_url: String,
    pub meeting_type: MeetingType,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("invalid selector '{0}'")]
    Selector(String),
}

/// The per-city strategy: where the listing lives and how to pull
/// (date, PDF link) pairs out of one page of it. Every city's agenda site
/// has a different table layout, so each variant carries its own row rule.
pub trait CityFetcher: Send + Sync {
    fn kind(&self) -> FetcherKind;
    fn base_url(&self) -> &'static str;
    fn listing_path(&self) -> &'static str;

    /// Extract the rows of one listing page. Individual rows that fail to
    /// parse are skipped; an empty result signals "no more rows."
    fn parse_listing_page(&self, document: &Html) -> Result<Vec<MeetingLead>, ScrapeError>;
}

/// Fetches one listing page as HTML. Production uses [`HttpFetcher`];
/// tests substitute canned pages.
#[async_trait]
pub trait ListingClient: Send + Sync {
    async fn get_html(&self, source_slug: &str, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl ListingClient for HttpFetcher {
    async fn get_html(&self, source_slug: &str, url: &str) -> Result<String, FetchError> {
        self.fetch_text(source_slug, url).await
    }
}

/// How far the pagination driver walks before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationPolicy {
    pub max_pages: u32,
    /// Meetings before this date are out of the look-back window.
    pub cutoff: Option<NaiveDate>,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self {
            max_pages: 10,
            cutoff: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
}

pub fn listing_page_url(fetcher: &dyn CityFetcher, page: u32) -> String {
    format!(
        "{}{}?page={}",
        fetcher.base_url(),
        fetcher.listing_path(),
        page
    )
}

/// Walk the listing pages from 0 upward, collecting meeting leads until one
/// of the termination conditions fires: an empty page, the page cap, or a
/// page whose every row falls before the cutoff date.
pub async fn discover_meetings(
    client: &dyn ListingClient,
    source_slug: &str,
    fetcher: &dyn CityFetcher,
    policy: &PaginationPolicy,
) -> Result<Vec<MeetingLead>, DiscoverError> {
    let mut leads = Vec::new();

    for page in 0..policy.max_pages {
        let url = listing_page_url(fetcher, page);
        let html = client.get_html(source_slug, &url).await?;
        let rows = parse_page(fetcher, &html)?;

        if rows.is_empty() {
            break;
        }

        let all_before_cutoff = match policy.cutoff {
            Some(cutoff) => rows.iter().all(|row| row.date < cutoff),
            None => false,
        };
        leads.extend(
            rows.into_iter()
                .filter(|row| policy.cutoff.is_none_or(|cutoff| row.date >= cutoff)),
        );
        if all_before_cutoff {
            break;
        }
    }

    Ok(leads)
}

// Html is parsed and dropped inside a plain function so the driver's future
// stays Send.
fn parse_page(fetcher: &dyn CityFetcher, html: &str) -> Result<Vec<MeetingLead>, ScrapeError> {
    let document = Html::parse_document(html);
    fetcher.parse_listing_page(&document)
}

pub fn fetcher_for(kind: FetcherKind) -> Box<dyn CityFetcher> {
    match kind {
        FetcherKind::Berkeley => Box::new(BerkeleyFetcher::new()),
        FetcherKind::SanFrancisco => Box::new(SanFranciscoFetcher::new()),
    }
}

fn selector(css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|_| ScrapeError::Selector(css.to_string()))
}

fn first_text(row: ElementRef<'_>, sel: &Selector) -> Option<String> {
    let text: String = row.select(sel).next()?.text().collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn first_attr(row: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    row.select(sel)
        .next()
        .and_then(|node| node.value().attr(attr))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{base_url}{href}")
    }
}

// =========================================================================
// Berkeley
// =========================================================================

/// Berkeley publishes one table of all council meetings. Each row's name
/// cell links the meeting as "City Council YYYY-MM-DD - Regular/Special/..."
/// and the minutes cell carries the agenda-packet PDF first, annotated
/// agendas after it. Only Regular meetings are taken.
pub struct BerkeleyFetcher {
    title_pattern: Regex,
}

impl BerkeleyFetcher {
    pub fn new() -> Self {
        Self {
            title_pattern: Regex::new(r"(?i)City Council (\d{4}-\d{2}-\d{2}) - Regular")
                .expect("berkeley title pattern is valid"),
        }
    }
}

impl Default for BerkeleyFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CityFetcher for BerkeleyFetcher {
    fn kind(&self) -> FetcherKind {
        FetcherKind::Berkeley
    }

    fn base_url(&self) -> &'static str {
        "https://berkeleyca.gov"
    }

    fn listing_path(&self) -> &'static str {
        "/your-government/city-council/city-council-agendas"
    }

    fn parse_listing_page(&self, document: &Html) -> Result<Vec<MeetingLead>, ScrapeError> {
        let row_sel = selector("tr")?;
        let title_sel = selector("td.council-meeting-name a")?;
        let pdf_sel = selector("td.council-meeting-minutes a[href$='.pdf']")?;

        let mut leads = Vec::new();
        for row in document.select(&row_sel) {
            let Some(title) = first_text(row, &title_sel) else {
                continue;
            };
            let Some(captures) = self.title_pattern.captures(&title) else {
                // Special sessions, closed sessions, work sessions.
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(&captures[1], "%Y-%m-%d") else {
                warn!(%title, "skipping berkeley row with unparseable date");
                continue;
            };
            let Some(href) = first_attr(row, &pdf_sel, "href") else {
                warn!(%date, "skipping berkeley row without an agenda packet pdf");
                continue;
            };
            leads.push(MeetingLead {
                date,
                pdf_url: absolutize(self.base_url(), &href),
                meeting_type: MeetingType::Regular,
            });
        }
        Ok(leads)
    }
}

// =========================================================================
// San Francisco
// =========================================================================

/// SF Board of Supervisors full-board meetings table. The date cell carries
/// a machine-readable `content` attribute; the meeting-type cell links the
/// agenda document.
pub struct SanFranciscoFetcher;

impl SanFranciscoFetcher {
    pub fn new() -> Self {
        Self
    }

    fn parse_content_date(content: &str) -> Option<NaiveDate> {
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(content) {
            return Some(dt.date_naive());
        }
        NaiveDate::parse_from_str(content.get(..10)?, "%Y-%m-%d").ok()
    }
}

impl Default for SanFranciscoFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CityFetcher for SanFranciscoFetcher {
    fn kind(&self) -> FetcherKind {
        FetcherKind::SanFrancisco
    }

    fn base_url(&self) -> &'static str {
        "https://sfbos.org"
    }

    fn listing_path(&self) -> &'static str {
        "/meetings/full-board-meetings"
    }

    fn parse_listing_page(&self, document: &Html) -> Result<Vec<MeetingLead>, ScrapeError> {
        let row_sel = selector("table.views-table tr")?;
        let date_sel = selector("td.views-field-field-date .date-display-single")?;
        let agenda_sel = selector("td.views-field-field-meeting-type-1 a")?;

        let mut leads = Vec::new();
        for row in document.select(&row_sel) {
            let Some(content) = first_attr(row, &date_sel, "content") else {
                continue;
            };
            let Some(href) = first_attr(row, &agenda_sel, "href") else {
                continue;
            };
            let Some(date) = Self::parse_content_date(&content) else {
                warn!(%content, "skipping sf row with unparseable date attribute");
                continue;
            };
            leads.push(MeetingLead {
                date,
                pdf_url: absolutize(self.base_url(), &href),
                meeting_type: MeetingType::Regular,
            });
        }
        Ok(leads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const BERKELEY_PAGE: &str = r#"
        <table>
          <tr>
            <td class="council-meeting-name"><a href="/m1">City Council 2026-02-10 - Regular</a></td>
            <td class="council-meeting-minutes">
              <a href="/files/agenda-packet-2026-02-10.pdf">Agenda Packet</a>
              <a href="/files/annotated-2026-02-10.pdf">Annotated Agenda</a>
            </td>
          </tr>
          <tr>
            <td class="council-meeting-name"><a href="/m2">City Council 2026-02-03 - Special</a></td>
            <td class="council-meeting-minutes"><a href="/files/special.pdf">Agenda</a></td>
          </tr>
          <tr>
            <td class="council-meeting-name"><a href="/m3">City Council 2026-01-27 - Regular</a></td>
            <td class="council-meeting-minutes"><span>no packet yet</span></td>
          </tr>
        </table>
    "#;

    const SF_PAGE: &str = r#"
        <table class="views-table">
          <tr>
            <td class="views-field-field-date">
              <span class="date-display-single" content="2026-02-10T14:00:00-08:00">February 10, 2026</span>
            </td>
            <td class="views-field-field-meeting-type-1"><a href="/sites/default/files/bag021026_agenda.pdf">Agenda</a></td>
          </tr>
          <tr>
            <td class="views-field-field-date">
              <span class="date-display-single" content="not-a-date">???</span>
            </td>
            <td class="views-field-field-meeting-type-1"><a href="/broken.pdf">Agenda</a></td>
          </tr>
          <tr>
            <td class="views-field-field-date">
              <span class="date-display-single" content="2026-01-13T14:00:00-08:00">January 13, 2026</span>
            </td>
            <td class="views-field-field-meeting-type-1"></td>
          </tr>
        </table>
    "#;

    #[test]
    fn berkeley_takes_regular_meetings_and_first_packet_pdf() {
        let fetcher = BerkeleyFetcher::new();
        let document = Html::parse_document(BERKELEY_PAGE);
        let leads = fetcher.parse_listing_page(&document).unwrap();

        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].date, NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        assert_eq!(
            leads[0].pdf_url,
            "https://berkeleyca.gov/files/agenda-packet-2026-02-10.pdf"
        );
        assert_eq!(leads[0].meeting_type, MeetingType::Regular);
    }

    #[test]
    fn sf_reads_machine_date_and_skips_bad_rows() {
        let fetcher = SanFranciscoFetcher::new();
        let document = Html::parse_document(SF_PAGE);
        let leads = fetcher.parse_listing_page(&document).unwrap();

        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].date, NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
        assert_eq!(
            leads[0].pdf_url,
            "https://sfbos.org/sites/default/files/bag021026_agenda.pdf"
        );
    }

    #[test]
    fn registry_covers_every_fetcher_kind() {
        assert_eq!(
            fetcher_for(FetcherKind::Berkeley).kind(),
            FetcherKind::Berkeley
        );
        assert_eq!(
            fetcher_for(FetcherKind::SanFrancisco).kind(),
            FetcherKind::SanFrancisco
        );
    }

    // Minimal listing site for driving the pagination driver without HTTP.
    struct StubFetcher;

    impl CityFetcher for StubFetcher {
        fn kind(&self) -> FetcherKind {
            FetcherKind::SanFrancisco
        }

        fn base_url(&self) -> &'static str {
            "https://stub.test"
        }

        fn listing_path(&self) -> &'static str {
            "/meetings"
        }

        fn parse_listing_page(&self, document: &Html) -> Result<Vec<MeetingLead>, ScrapeError> {
            let row_sel = selector("li.meeting")?;
            Ok(document
                .select(&row_sel)
                .filter_map(|row| {
                    let date = row.value().attr("data-date")?;
                    let href = row.value().attr("data-href")?;
                    Some(MeetingLead {
                        date: NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?,
                        pdf_url: absolutize(self.base_url(), href),
                        meeting_type: MeetingType::Regular,
                    })
                })
                .collect())
        }
    }

    struct StubClient {
        pages: HashMap<String, String>,
        requested: Mutex<Vec<String>>,
    }

    impl StubClient {
        fn new(pages: Vec<(&str, &str)>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|(url, body)| (url.to_string(), body.to_string()))
                    .collect(),
                requested: Mutex::new(Vec::new()),
            }
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ListingClient for StubClient {
        async fn get_html(&self, _source_slug: &str, url: &str) -> Result<String, FetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            Ok(self.pages.get(url).cloned().unwrap_or_default())
        }
    }

    fn page(entries: &[(&str, &str)]) -> String {
        let items: String = entries
            .iter()
            .map(|(date, href)| {
                format!("<li class=\"meeting\" data-date=\"{date}\" data-href=\"{href}\"></li>")
            })
            .collect();
        format!("<ul>{items}</ul>")
    }

    #[tokio::test]
    async fn pagination_stops_after_first_empty_page() {
        let client = StubClient::new(vec![
            (
                "https://stub.test/meetings?page=0",
                &page(&[("2026-02-10", "/a.pdf"), ("2026-02-03", "/b.pdf")]),
            ),
            (
                "https://stub.test/meetings?page=1",
                &page(&[("2026-01-27", "/c.pdf")]),
            ),
            ("https://stub.test/meetings?page=2", "<ul></ul>"),
            (
                "https://stub.test/meetings?page=3",
                &page(&[("2026-01-01", "/should-never-load.pdf")]),
            ),
        ]);
        let policy = PaginationPolicy {
            max_pages: 10,
            cutoff: None,
        };

        let leads = discover_meetings(&client, "stub", &StubFetcher, &policy)
            .await
            .unwrap();

        assert_eq!(leads.len(), 3);
        assert_eq!(
            client.requested(),
            vec![
                "https://stub.test/meetings?page=0",
                "https://stub.test/meetings?page=1",
                "https://stub.test/meetings?page=2",
            ]
        );
    }

    #[tokio::test]
    async fn pagination_respects_max_pages() {
        let client = StubClient::new(vec![
            (
                "https://stub.test/meetings?page=0",
                &page(&[("2026-02-10", "/a.pdf")]),
            ),
            (
                "https://stub.test/meetings?page=1",
                &page(&[("2026-02-03", "/b.pdf")]),
            ),
        ]);
        let policy = PaginationPolicy {
            max_pages: 1,
            cutoff: None,
        };

        let leads = discover_meetings(&client, "stub", &StubFetcher, &policy)
            .await
            .unwrap();

        assert_eq!(leads.len(), 1);
        assert_eq!(client.requested().len(), 1);
    }

    #[tokio::test]
    async fn pagination_stops_when_whole_page_precedes_cutoff() {
        let client = StubClient::new(vec![
            (
                "https://stub.test/meetings?page=0",
                &page(&[("2026-02-10", "/a.pdf"), ("2025-11-04", "/old.pdf")]),
            ),
            (
                "https://stub.test/meetings?page=1",
                &page(&[("2025-10-07", "/older.pdf"), ("2025-09-16", "/oldest.pdf")]),
            ),
            (
                "https://stub.test/meetings?page=2",
                &page(&[("2025-08-05", "/ancient.pdf")]),
            ),
        ]);
        let policy = PaginationPolicy {
            max_pages: 10,
            cutoff: NaiveDate::from_ymd_opt(2026, 1, 1),
        };

        let leads = discover_meetings(&client, "stub", &StubFetcher, &policy)
            .await
            .unwrap();

        // Only the in-window meeting survives, and page 2 is never requested.
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].pdf_url, "https://stub.test/a.pdf");
        assert_eq!(client.requested().len(), 2);
    }
}
