//! Domain data structures for postcodes, addresses, and collection schedules.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ports::PipelineError;

/// Structural shape of a normalized UK postcode, e.g. `SN1 5DX`.
static POSTCODE_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z]{1,2}[0-9]{1,2}[A-Z]? [0-9][A-Z]{2}$").expect("valid postcode regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A validated, canonically formatted postcode.
pub struct Postcode(String);

impl Postcode {
    /// Normalize and validate a raw postcode string.
    ///
    /// Whitespace is stripped, letters uppercased, and the single space before
    /// the final three characters reinstated before the shape check. Rejected
    /// inputs never reach the network.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPostcode`] when the input does not have
    /// the structural shape of a UK postcode.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let compact: String = raw
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .collect::<String>()
            .to_uppercase();

        if !compact.is_ascii() || compact.len() < 5 || compact.len() > 7 {
            return Err(PipelineError::InvalidPostcode(raw.to_owned()));
        }

        let (outward, inward) = compact.split_at(compact.len() - 3);
        let normalized = format!("{outward} {inward}");

        if !POSTCODE_SHAPE.is_match(&normalized) {
            return Err(PipelineError::InvalidPostcode(raw.to_owned()));
        }

        Ok(Self(normalized))
    }

    /// The canonical `OUTWARD INWARD` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Postcode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Opaque upstream identifier for a single physical property (a UPRN).
pub struct PropertyRef(String);

impl PropertyRef {
    /// Validate a raw property reference.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPropertyRef`] when the reference is
    /// empty or contains anything other than ASCII digits.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(PipelineError::InvalidPropertyRef(raw.to_owned()));
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// The reference as sent to the upstream site.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PropertyRef {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Candidate address returned from a postcode lookup.
pub struct Address {
    /// Key used when requesting the property's schedule.
    pub property_ref: PropertyRef,
    /// Human-friendly display label for address selection.
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Waste streams collected at the kerbside.
pub enum WasteType {
    /// Residual household rubbish.
    Rubbish,
    /// Mixed dry recycling.
    Recycling,
    /// Garden waste.
    Garden,
    /// Plastics collection.
    Plastics,
    /// Unrecognized stream, keeping the source fragment.
    Other(String),
}

impl WasteType {
    /// Classify a waste-type fragment from the source document.
    ///
    /// Unrecognized fragments map to [`WasteType::Other`] rather than being
    /// dropped.
    #[must_use]
    pub fn classify(fragment: &str) -> Self {
        let normalized = fragment.to_lowercase();

        if normalized.contains("rubbish") {
            WasteType::Rubbish
        } else if normalized.contains("recycl") {
            WasteType::Recycling
        } else if normalized.contains("garden") {
            WasteType::Garden
        } else if normalized.contains("plastic") {
            WasteType::Plastics
        } else {
            WasteType::Other(fragment.trim().to_owned())
        }
    }

    /// Canonical variant name used in response payloads.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            WasteType::Rubbish => "Rubbish",
            WasteType::Recycling => "Recycling",
            WasteType::Garden => "Garden",
            WasteType::Plastics => "Plastics",
            WasteType::Other(_) => "Other",
        }
    }
}

impl fmt::Display for WasteType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One dated collection for a single waste stream.
pub struct CollectionEntry {
    /// Collection date (no time component).
    pub date: NaiveDate,
    /// Stream collected on that date.
    pub waste_type: WasteType,
}

impl CollectionEntry {
    /// Days between `today` and the collection date; negative once passed.
    ///
    /// Derived on demand so stored schedules never carry a stale countdown.
    #[must_use]
    pub fn days_until(&self, today: NaiveDate) -> i64 {
        (self.date - today).num_days()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Normalized collection schedule for one property.
///
/// Superseded by the next successful fetch, never mutated in place.
pub struct Schedule {
    /// Property the schedule belongs to.
    pub property_ref: PropertyRef,
    /// Entries sorted ascending by date, unique per `(waste_type, date)`.
    pub entries: Vec<CollectionEntry>,
    /// When the schedule was fetched from the upstream site.
    pub fetched_at: DateTime<Utc>,
}

impl Schedule {
    /// Build a schedule from raw scraped entries, collapsing exact
    /// `(waste_type, date)` duplicates and sorting ascending by date.
    #[must_use]
    pub fn new(property_ref: PropertyRef, mut entries: Vec<CollectionEntry>) -> Self {
        // Order by the full waste type so exact duplicates sit adjacent for dedup.
        entries.sort_by(|left, right| {
            left.date
                .cmp(&right.date)
                .then_with(|| left.waste_type.cmp(&right.waste_type))
        });
        entries.dedup();

        Self {
            property_ref,
            entries,
            fetched_at: Utc::now(),
        }
    }

    /// Whether the schedule contains no upcoming collections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Response-time view of a single collection entry.
pub struct CollectionView {
    /// Collection date as an ISO calendar date.
    pub date: NaiveDate,
    /// Canonical waste-type name.
    pub waste_type: String,
    /// Days until collection, computed when the response is rendered.
    pub days_until: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Boundary payload handed to the routing layer.
pub struct ScheduleResponse {
    /// Property the schedule belongs to.
    pub property_ref: PropertyRef,
    /// Dated entries with their countdowns.
    pub entries: Vec<CollectionView>,
    /// True when the payload was served from an expired cache record after an
    /// upstream failure.
    pub stale: bool,
}

impl ScheduleResponse {
    /// Render a stored schedule against an explicit `today`.
    #[must_use]
    pub fn render(schedule: &Schedule, stale: bool, today: NaiveDate) -> Self {
        let entries = schedule
            .entries
            .iter()
            .map(|entry| CollectionView {
                date: entry.date,
                waste_type: entry.waste_type.name().to_owned(),
                days_until: entry.days_until(today),
            })
            .collect();

        Self {
            property_ref: schedule.property_ref.clone(),
            entries,
            stale,
        }
    }
}
