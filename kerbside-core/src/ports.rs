//! Traits describing the upstream source seams and the shared error taxonomy.

use async_trait::async_trait;

use crate::fetch::FetchError;
use crate::model::{Address, Postcode, PropertyRef, Schedule};

#[derive(thiserror::Error, Debug)]
/// Errors surfaced by the resolution pipeline.
///
/// The variants split caller remediation three ways: fix the input
/// ([`PipelineError::InvalidPostcode`], [`PipelineError::InvalidPropertyRef`],
/// [`PipelineError::PropertyNotFound`]), try again later
/// ([`PipelineError::Upstream`]), or the source format changed and the code
/// needs maintenance ([`PipelineError::ParseFailure`],
/// [`PipelineError::Decode`]).
pub enum PipelineError {
    /// Input does not have the structural shape of a postcode.
    #[error("invalid postcode: {0:?}")]
    InvalidPostcode(String),
    /// Input does not have the shape of a property reference.
    #[error("invalid property reference: {0:?}")]
    InvalidPropertyRef(String),
    /// The upstream site reports no property for the reference.
    #[error("no property found for reference {0}")]
    PropertyNotFound(String),
    /// Transient upstream failure after the retry budget was spent.
    #[error("upstream unavailable: {0}")]
    Upstream(#[from] FetchError),
    /// The schedule document was fetched but no recognizable collection
    /// structure was found. Distinct from a legitimately empty schedule.
    #[error("no recognizable schedule structure in the upstream document")]
    ParseFailure,
    /// The address payload did not decode after envelope stripping.
    #[error("unexpected upstream payload: {0}")]
    Decode(String),
}

impl PipelineError {
    /// Whether the failure is transient and eligible for the stale-cache
    /// fallback.
    ///
    /// Only retryable upstream failures qualify. A definitive upstream answer
    /// such as a 4xx status or an empty body is not a blip worth papering over
    /// with an expired record.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Upstream(err) if err.is_retryable())
    }
}

#[async_trait]
/// Postcode → candidate address lookup against the external address service.
pub trait AddressSource: Send + Sync {
    /// Resolve a postcode into candidate addresses.
    ///
    /// Zero matches is a legitimate empty result, not an error. Results keep
    /// the upstream relevance ordering with duplicate property references
    /// removed (first occurrence wins).
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] when the upstream call fails or its payload
    /// cannot be decoded.
    async fn resolve(&self, postcode: &Postcode) -> Result<Vec<Address>, PipelineError>;
}

#[async_trait]
/// Property reference → scraped, normalized collection schedule.
pub trait ScheduleSource: Send + Sync {
    /// Fetch and parse the schedule for one property.
    ///
    /// A successfully fetched document with zero recoverable entries yields an
    /// empty [`Schedule`], not an error.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] when the fetch fails, the property is
    /// unknown upstream, or the document structure is unrecognizable.
    async fn fetch_schedule(
        &self,
        property_ref: &PropertyRef,
    ) -> Result<Schedule, PipelineError>;
}
