//! Postcode → address lookup against the Swindon iShare GIS service.
//!
//! The endpoint answers a `LocationSearch` query with rows of
//! `[uprn, name, address]` tuples, usually wrapped in a JSONP-style callback
//! envelope. The envelope is stripped before structured decoding so a format
//! change upstream stays a one-function fix.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use kerbside_core::{
    fetch::Fetcher,
    model::{Address, Postcode, PropertyRef},
    ports::{AddressSource, PipelineError},
};

const LOOKUP_URL: &str = "https://maps.swindon.gov.uk/getdata.aspx";
const MAP_SOURCE: &str = "mapsources/LocalInfoLookup";
const CALLBACK: &str = "kerbside";
const PAGE_SIZE: &str = "150";

/// Minimum digits for a plausible UPRN; shorter values are dropdown
/// placeholders, not properties.
const MIN_UPRN_LEN: usize = 8;

/// How long a resolved postcode is served from memory before re-querying.
/// Much shorter-lived than the schedule cache; absorbs rapid repeat lookups
/// within one session.
const RECENT_TTL: Duration = Duration::from_secs(60);

/// Row payload from the `LocationSearch` service.
#[derive(Debug, Deserialize)]
struct LocationSearchEnvelope {
    #[serde(default)]
    data: Vec<Vec<Value>>,
}

/// Address lookup implementation for Swindon.
pub struct SwindonAddressSource {
    fetcher: Arc<Fetcher>,
    endpoint: String,
    recent: Mutex<HashMap<Postcode, (Instant, Vec<Address>)>>,
}

impl SwindonAddressSource {
    /// Create a source against the live council endpoint.
    #[must_use]
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self::with_endpoint(fetcher, LOOKUP_URL)
    }

    /// Create a source against a custom endpoint (used in tests).
    #[must_use]
    pub fn with_endpoint(fetcher: Arc<Fetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
            recent: Mutex::new(HashMap::new()),
        }
    }

    fn recall(&self, postcode: &Postcode) -> Option<Vec<Address>> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(postcode)
            .filter(|(stored_at, _)| stored_at.elapsed() < RECENT_TTL)
            .map(|(_, addresses)| addresses.clone())
    }

    fn remember(&self, postcode: &Postcode, addresses: &[Address]) {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(postcode.clone(), (Instant::now(), addresses.to_vec()));
    }
}

#[async_trait]
impl AddressSource for SwindonAddressSource {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn resolve(&self, postcode: &Postcode) -> Result<Vec<Address>, PipelineError> {
        if let Some(addresses) = self.recall(postcode) {
            tracing::debug!(postcode = %postcode, "postcode served from recent lookups");
            return Ok(addresses);
        }

        let body = self
            .fetcher
            .get_text(
                &self.endpoint,
                &[
                    ("type", "jsonp"),
                    ("callback", CALLBACK),
                    ("service", "LocationSearch"),
                    ("RequestType", "LocationSearch"),
                    ("location", postcode.as_str()),
                    ("pagesize", PAGE_SIZE),
                    ("mapsource", MAP_SOURCE),
                ],
            )
            .await?;

        let payload = strip_envelope(&body);
        let envelope: LocationSearchEnvelope =
            serde_json::from_str(payload).map_err(|err| PipelineError::Decode(err.to_string()))?;

        let addresses = collect_addresses(envelope);
        tracing::debug!(
            postcode = %postcode,
            count = addresses.len(),
            "postcode resolved upstream"
        );

        self.remember(postcode, &addresses);
        Ok(addresses)
    }
}

/// Strip a JSONP-style callback wrapper, leaving the structured payload.
///
/// Bodies that already start with `{` or `[` pass through untouched.
fn strip_envelope(body: &str) -> &str {
    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed;
    }

    match (trimmed.find('('), trimmed.rfind(')')) {
        (Some(open), Some(close)) if open < close => trimmed
            .get(open + 1..close)
            .map_or(trimmed, str::trim),
        _ => trimmed,
    }
}

/// Map envelope rows to addresses, preserving upstream order and dropping
/// duplicate property references (first occurrence wins).
fn collect_addresses(envelope: LocationSearchEnvelope) -> Vec<Address> {
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();

    for row in envelope.data {
        let Some(property_ref) = row.first().and_then(plausible_uprn) else {
            continue;
        };

        // Column 2 is the formatted address; fall back to the name column.
        let Some(label) = row
            .get(2)
            .or_else(|| row.get(1))
            .and_then(column_text)
        else {
            continue;
        };

        if seen.insert(property_ref.clone()) {
            addresses.push(Address {
                property_ref,
                label,
            });
        }
    }

    addresses
}

fn column_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_owned()).filter(|text| !text.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn plausible_uprn(value: &Value) -> Option<PropertyRef> {
    let text = column_text(value)?;
    if text.len() < MIN_UPRN_LEN {
        return None;
    }
    PropertyRef::parse(&text).ok()
}
