//! Schedule scraper for the Swindon collection-days page.
//!
//! The page carries no schema guarantee, so extraction runs in two passes:
//! the known section markup first, then a tolerant token scan over the
//! flattened text when the markup has drifted. Dates follow the UK
//! day-month-year convention; tokens that fail to parse as real calendar
//! dates are skipped, never fabricated.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use scraper::{Html, Selector};

use kerbside_core::{
    fetch::Fetcher,
    model::{CollectionEntry, PropertyRef, Schedule, WasteType},
    ports::{PipelineError, ScheduleSource},
};

const COLLECTION_URL: &str =
    "https://www.swindon.gov.uk/info/20122/rubbish_and_recycling_collection_days";

const DATE_FORMAT_LONG: &str = "%A, %d %B %Y";
const DATE_FORMAT_SHORT: &str = "%d %B %Y";

/// Phrases the council page shows when a reference matches no property.
const NOT_FOUND_MARKERS: &[&str] = &[
    "address could not be found",
    "could not find your address",
    "no collection details are available for this address",
];

static SECTION: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("div.bin-collection-content").expect("valid section selector")
});
static HEADING: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("h3").expect("valid heading selector"));
static NEXT_DATE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("span.nextCollectionDate").expect("valid next-date selector")
});
static FUTURE_DATES: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("div.collection-next span").expect("valid future-dates selector")
});

static CATEGORY_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(rubbish|recycl\w*|garden|plastic\w*)\b").expect("valid category regex")
});
static LONG_DATE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2})\s+(january|february|march|april|may|june|july|august|september|october|november|december)\s+(\d{4})\b",
    )
    .expect("valid long date regex")
});
static NUMERIC_DATE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("valid numeric date regex")
});

/// Schedule scraper implementation for Swindon.
pub struct SwindonScheduleSource {
    fetcher: Arc<Fetcher>,
    endpoint: String,
}

impl SwindonScheduleSource {
    /// Create a source against the live council page.
    #[must_use]
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self::with_endpoint(fetcher, COLLECTION_URL)
    }

    /// Create a source against a custom endpoint (used in tests).
    #[must_use]
    pub fn with_endpoint(fetcher: Arc<Fetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ScheduleSource for SwindonScheduleSource {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn fetch_schedule(
        &self,
        property_ref: &PropertyRef,
    ) -> Result<Schedule, PipelineError> {
        let body = self
            .fetcher
            .get_text(
                &self.endpoint,
                &[("uprnSubmit", "Yes"), ("addressList", property_ref.as_str())],
            )
            .await?;

        match parse_collection_page(&body) {
            ParsedPage::NotFound => {
                Err(PipelineError::PropertyNotFound(property_ref.to_string()))
            }
            ParsedPage::Entries { entries, structured } => {
                if entries.is_empty() {
                    // Distinct from ParseFailure: the structure was recognized,
                    // there is just nothing scheduled.
                    tracing::info!(
                        property_ref = %property_ref,
                        "schedule page recognized but no collections scheduled"
                    );
                } else if !structured {
                    tracing::warn!(
                        property_ref = %property_ref,
                        count = entries.len(),
                        "section markup missing, entries recovered by token scan"
                    );
                }
                Ok(Schedule::new(property_ref.clone(), entries))
            }
            ParsedPage::Unrecognized => {
                tracing::warn!(
                    property_ref = %property_ref,
                    "no recognizable schedule structure, scrape logic may be stale"
                );
                Err(PipelineError::ParseFailure)
            }
        }
    }
}

enum ParsedPage {
    NotFound,
    Entries {
        entries: Vec<CollectionEntry>,
        structured: bool,
    },
    Unrecognized,
}

fn parse_collection_page(body: &str) -> ParsedPage {
    let document = Html::parse_document(body);

    let mut sections = document.select(&SECTION).peekable();
    if sections.peek().is_some() {
        let mut entries = Vec::new();
        for section in sections {
            let Some(heading) = section.select(&HEADING).next() else {
                continue;
            };
            let waste_type = WasteType::classify(&element_text(&heading));

            let date_texts = section
                .select(&NEXT_DATE)
                .chain(section.select(&FUTURE_DATES))
                .map(|element| element_text(&element));

            for text in date_texts {
                let Some(date) = parse_date_token(&text) else {
                    tracing::warn!(token = %text, "skipping unparseable date token");
                    continue;
                };
                entries.push(CollectionEntry {
                    date,
                    waste_type: waste_type.clone(),
                });
            }
        }
        return ParsedPage::Entries {
            entries,
            structured: true,
        };
    }

    let text = document
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ");
    let lowercase = text.to_lowercase();

    if NOT_FOUND_MARKERS
        .iter()
        .any(|marker| lowercase.contains(marker))
    {
        return ParsedPage::NotFound;
    }

    let scanned = token_scan(&text);
    if scanned.is_empty() {
        ParsedPage::Unrecognized
    } else {
        ParsedPage::Entries {
            entries: scanned,
            structured: false,
        }
    }
}

fn element_text(element: &scraper::ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_owned()
}

/// Parse a section date token, with or without the weekday prefix.
fn parse_date_token(text: &str) -> Option<NaiveDate> {
    let trimmed = text.trim();
    NaiveDate::parse_from_str(trimmed, DATE_FORMAT_LONG)
        .or_else(|_| NaiveDate::parse_from_str(trimmed, DATE_FORMAT_SHORT))
        .ok()
}

/// Tolerant fallback: pair each date-like token with the nearest preceding
/// category token anywhere in the flattened text. A date with no preceding
/// category is not a pairing and is skipped.
fn token_scan(text: &str) -> Vec<CollectionEntry> {
    let categories: Vec<(usize, WasteType)> = CATEGORY_TOKEN
        .find_iter(text)
        .map(|found| (found.start(), WasteType::classify(found.as_str())))
        .collect();

    let mut dates: Vec<(usize, NaiveDate)> = Vec::new();

    for captures in LONG_DATE_TOKEN.captures_iter(text) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let parts = (
            captures.get(1).and_then(|day| day.as_str().parse::<u32>().ok()),
            captures.get(2).and_then(|month| month_number(month.as_str())),
            captures.get(3).and_then(|year| year.as_str().parse::<i32>().ok()),
        );
        if let (Some(day), Some(month), Some(year)) = parts
            && let Some(date) = NaiveDate::from_ymd_opt(year, month, day)
        {
            dates.push((whole.start(), date));
        }
    }

    for captures in NUMERIC_DATE_TOKEN.captures_iter(text) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        let parts = (
            captures.get(1).and_then(|day| day.as_str().parse::<u32>().ok()),
            captures.get(2).and_then(|month| month.as_str().parse::<u32>().ok()),
            captures.get(3).and_then(|year| year.as_str().parse::<i32>().ok()),
        );
        if let (Some(day), Some(month), Some(year)) = parts
            && let Some(date) = NaiveDate::from_ymd_opt(year, month, day)
        {
            dates.push((whole.start(), date));
        }
    }

    dates.sort_by_key(|(position, _)| *position);

    let mut entries = Vec::new();
    for (position, date) in dates {
        let preceding = categories
            .iter()
            .filter(|(category_position, _)| *category_position < position)
            .next_back();
        if let Some((_, waste_type)) = preceding {
            entries.push(CollectionEntry {
                date,
                waste_type: waste_type.clone(),
            });
        }
    }

    entries
}

fn month_number(name: &str) -> Option<u32> {
    let index = match name.to_lowercase().as_str() {
        "january" => 1,
        "february" => 2,
        "march" => 3,
        "april" => 4,
        "may" => 5,
        "june" => 6,
        "july" => 7,
        "august" => 8,
        "september" => 9,
        "october" => 10,
        "november" => 11,
        "december" => 12,
        _ => return None,
    };
    Some(index)
}
