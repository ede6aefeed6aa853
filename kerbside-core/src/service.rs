//! Pipeline facade composing lookup, scraping, and the schedule cache.

use std::sync::Arc;

use chrono::Utc;

use crate::cache::{FlightGuards, ScheduleCache};
use crate::model::{Address, Postcode, PropertyRef, ScheduleResponse};
use crate::ports::{AddressSource, PipelineError, ScheduleSource};

/// Public entry point for the two pipeline operations consumed by the routing
/// layer: postcode → addresses and property reference → schedule.
pub struct SchedulePipeline {
    addresses: Arc<dyn AddressSource>,
    schedules: Arc<dyn ScheduleSource>,
    cache: ScheduleCache,
    inflight: FlightGuards,
}

impl SchedulePipeline {
    /// Wire the facade to its upstream sources and cache.
    #[must_use]
    pub fn new(
        addresses: Arc<dyn AddressSource>,
        schedules: Arc<dyn ScheduleSource>,
        cache: ScheduleCache,
    ) -> Self {
        Self {
            addresses,
            schedules,
            cache,
            inflight: FlightGuards::default(),
        }
    }

    /// Resolve a raw postcode into candidate addresses.
    ///
    /// Malformed postcodes fail before any network call. Results are passed
    /// through in upstream order; an empty list means "no known addresses".
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPostcode`] for malformed input, or the
    /// source's error when the upstream call fails.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn resolve_addresses(
        &self,
        raw_postcode: &str,
    ) -> Result<Vec<Address>, PipelineError> {
        let postcode = Postcode::parse(raw_postcode)?;
        self.addresses.resolve(&postcode).await
    }

    /// Fetch the collection schedule for a raw property reference.
    ///
    /// A fresh cache record short-circuits the scrape. Otherwise the scrape
    /// runs under a per-key guard so concurrent requests for the same property
    /// never amplify upstream load. On a transient upstream failure an expired
    /// cache record is served flagged `stale: true`; with no record to fall
    /// back on, the failure is surfaced.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidPropertyRef`] for malformed input, or
    /// the scrape failure when no degraded fallback is available.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn get_schedule(&self, raw_ref: &str) -> Result<ScheduleResponse, PipelineError> {
        let property_ref = PropertyRef::parse(raw_ref)?;

        if let Some(response) = self.fresh_from_cache(&property_ref) {
            return Ok(response);
        }

        let guard = self.inflight.guard_for(&property_ref);
        let outcome = {
            let _held = guard.lock().await;

            // Another caller may have completed the scrape while we waited.
            if let Some(response) = self.fresh_from_cache(&property_ref) {
                Ok(response)
            } else {
                self.scrape_and_store(&property_ref).await
            }
        };

        drop(guard);
        self.inflight.prune(&property_ref);
        outcome
    }

    async fn scrape_and_store(
        &self,
        property_ref: &PropertyRef,
    ) -> Result<ScheduleResponse, PipelineError> {
        match self.schedules.fetch_schedule(property_ref).await {
            Ok(schedule) => {
                self.cache.put(property_ref, schedule.clone());
                Ok(ScheduleResponse::render(
                    &schedule,
                    false,
                    Utc::now().date_naive(),
                ))
            }
            Err(error) if error.is_transient() => {
                if let Some(record) = self.cache.get(property_ref) {
                    tracing::warn!(
                        property_ref = %property_ref,
                        error = %error,
                        "serving expired cache record after upstream failure"
                    );
                    Ok(ScheduleResponse::render(
                        &record.schedule,
                        true,
                        Utc::now().date_naive(),
                    ))
                } else {
                    Err(error)
                }
            }
            Err(error) => Err(error),
        }
    }

    /// Drop the cached schedule for one property, forcing the next request to
    /// scrape. Used when a caller switches address.
    pub fn invalidate(&self, property_ref: &PropertyRef) {
        self.cache.invalidate(property_ref);
    }

    fn fresh_from_cache(&self, property_ref: &PropertyRef) -> Option<ScheduleResponse> {
        let record = self.cache.get(property_ref)?;
        if record.is_fresh(Utc::now()) {
            tracing::debug!(property_ref = %property_ref, "serving fresh cache record");
            Some(ScheduleResponse::render(
                &record.schedule,
                false,
                Utc::now().date_naive(),
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::{Duration, NaiveDate};

    use super::*;
    use crate::fetch::FetchError;
    use crate::model::{CollectionEntry, Schedule, WasteType};

    struct StubAddresses {
        calls: AtomicUsize,
        results: Vec<Address>,
    }

    impl StubAddresses {
        fn new(results: Vec<Address>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                results,
            })
        }
    }

    #[async_trait]
    impl AddressSource for StubAddresses {
        async fn resolve(&self, _postcode: &Postcode) -> Result<Vec<Address>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.results.clone())
        }
    }

    enum StubOutcome {
        Succeed,
        FailTransient,
        FailDefinitive,
        FailParse,
    }

    struct StubSchedules {
        calls: AtomicUsize,
        outcome: StubOutcome,
    }

    impl StubSchedules {
        fn new(outcome: StubOutcome) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome,
            })
        }
    }

    #[async_trait]
    impl ScheduleSource for StubSchedules {
        async fn fetch_schedule(
            &self,
            property_ref: &PropertyRef,
        ) -> Result<Schedule, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Yield long enough for a concurrent caller to pile up on the guard.
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            match self.outcome {
                StubOutcome::Succeed => Ok(Schedule::new(
                    property_ref.clone(),
                    vec![CollectionEntry {
                        date: NaiveDate::from_ymd_opt(2026, 4, 1).expect("valid date"),
                        waste_type: WasteType::Recycling,
                    }],
                )),
                StubOutcome::FailTransient => Err(PipelineError::Upstream(FetchError::Timeout)),
                StubOutcome::FailDefinitive => Err(PipelineError::Upstream(FetchError::Status(
                    reqwest::StatusCode::NOT_FOUND,
                ))),
                StubOutcome::FailParse => Err(PipelineError::ParseFailure),
            }
        }
    }

    fn pipeline(
        addresses: Arc<StubAddresses>,
        schedules: Arc<StubSchedules>,
        ttl: Duration,
    ) -> SchedulePipeline {
        SchedulePipeline::new(addresses, schedules, ScheduleCache::new(ttl))
    }

    fn sample_addresses() -> Vec<Address> {
        vec![Address {
            property_ref: PropertyRef::parse("100121147490").expect("valid ref"),
            label: "1 Nyland Road, SWINDON, SN1 5DX".to_owned(),
        }]
    }

    #[tokio::test]
    async fn malformed_postcode_fails_without_touching_the_source() {
        let addresses = StubAddresses::new(sample_addresses());
        let facade = pipeline(
            Arc::clone(&addresses),
            StubSchedules::new(StubOutcome::Succeed),
            Duration::hours(24),
        );

        for raw in ["!!!", ""] {
            let result = facade.resolve_addresses(raw).await;
            assert!(matches!(result, Err(PipelineError::InvalidPostcode(_))));
        }

        assert_eq!(addresses.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn addresses_are_passed_through_unchanged() {
        let addresses = StubAddresses::new(sample_addresses());
        let facade = pipeline(
            Arc::clone(&addresses),
            StubSchedules::new(StubOutcome::Succeed),
            Duration::hours(24),
        );

        let resolved = facade
            .resolve_addresses("SN1 5DX")
            .await
            .expect("resolution should succeed");

        assert_eq!(resolved.len(), 1);
        assert_eq!(
            resolved.first().map(|address| address.label.clone()),
            Some("1 Nyland Road, SWINDON, SN1 5DX".to_owned())
        );
        assert_eq!(addresses.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_property_ref_is_rejected_before_scraping() {
        let schedules = StubSchedules::new(StubOutcome::Succeed);
        let facade = pipeline(
            StubAddresses::new(Vec::new()),
            Arc::clone(&schedules),
            Duration::hours(24),
        );

        let result = facade.get_schedule("not-a-uprn").await;

        assert!(matches!(result, Err(PipelineError::InvalidPropertyRef(_))));
        assert_eq!(schedules.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fresh_cache_record_short_circuits_the_scrape() {
        let schedules = StubSchedules::new(StubOutcome::Succeed);
        let facade = pipeline(
            StubAddresses::new(Vec::new()),
            Arc::clone(&schedules),
            Duration::hours(24),
        );

        let first = facade
            .get_schedule("100121147490")
            .await
            .expect("first fetch should succeed");
        let second = facade
            .get_schedule("100121147490")
            .await
            .expect("second fetch should be served from cache");

        assert!(!first.stale);
        assert!(!second.stale);
        assert_eq!(schedules.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_record_is_served_stale_when_the_scrape_fails() {
        let schedules = StubSchedules::new(StubOutcome::FailTransient);
        let facade = pipeline(
            StubAddresses::new(Vec::new()),
            Arc::clone(&schedules),
            Duration::zero(),
        );

        let key = PropertyRef::parse("100121147490").expect("valid ref");
        facade.cache.put(
            &key,
            Schedule::new(
                key.clone(),
                vec![CollectionEntry {
                    date: NaiveDate::from_ymd_opt(2026, 2, 14).expect("valid date"),
                    waste_type: WasteType::Garden,
                }],
            ),
        );

        let response = facade
            .get_schedule("100121147490")
            .await
            .expect("stale fallback should be served");

        assert!(response.stale);
        assert_eq!(response.entries.len(), 1);
        assert_eq!(schedules.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_without_a_record_is_surfaced() {
        let schedules = StubSchedules::new(StubOutcome::FailTransient);
        let facade = pipeline(
            StubAddresses::new(Vec::new()),
            Arc::clone(&schedules),
            Duration::hours(24),
        );

        let result = facade.get_schedule("100121147490").await;

        assert!(matches!(result, Err(PipelineError::Upstream(_))));
    }

    #[tokio::test]
    async fn definitive_upstream_answers_never_fall_back_to_the_cache() {
        let schedules = StubSchedules::new(StubOutcome::FailDefinitive);
        let facade = pipeline(
            StubAddresses::new(Vec::new()),
            Arc::clone(&schedules),
            Duration::zero(),
        );

        let key = PropertyRef::parse("100121147490").expect("valid ref");
        facade.cache.put(
            &key,
            Schedule::new(
                key.clone(),
                vec![CollectionEntry {
                    date: NaiveDate::from_ymd_opt(2026, 2, 14).expect("valid date"),
                    waste_type: WasteType::Garden,
                }],
            ),
        );

        let result = facade.get_schedule("100121147490").await;

        assert!(matches!(
            result,
            Err(PipelineError::Upstream(FetchError::Status(_)))
        ));
    }

    #[tokio::test]
    async fn parse_failure_never_falls_back_to_the_cache() {
        let schedules = StubSchedules::new(StubOutcome::FailParse);
        let facade = pipeline(
            StubAddresses::new(Vec::new()),
            Arc::clone(&schedules),
            Duration::zero(),
        );

        let key = PropertyRef::parse("100121147490").expect("valid ref");
        facade
            .cache
            .put(&key, Schedule::new(key.clone(), Vec::new()));

        let result = facade.get_schedule("100121147490").await;

        assert!(matches!(result, Err(PipelineError::ParseFailure)));
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_property_scrape_once() {
        let schedules = StubSchedules::new(StubOutcome::Succeed);
        let facade = Arc::new(pipeline(
            StubAddresses::new(Vec::new()),
            Arc::clone(&schedules),
            Duration::hours(24),
        ));

        let left = Arc::clone(&facade);
        let right = Arc::clone(&facade);
        let (first, second) = tokio::join!(
            left.get_schedule("100121147490"),
            right.get_schedule("100121147490"),
        );

        assert!(first.expect("first caller should succeed").entries.len() == 1);
        assert!(second.expect("second caller should succeed").entries.len() == 1);
        assert_eq!(schedules.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn guards_are_released_once_requests_complete() {
        let schedules = StubSchedules::new(StubOutcome::Succeed);
        let facade = Arc::new(pipeline(
            StubAddresses::new(Vec::new()),
            Arc::clone(&schedules),
            Duration::hours(24),
        ));

        let left = Arc::clone(&facade);
        let right = Arc::clone(&facade);
        let (first, second) = tokio::join!(
            left.get_schedule("100121147490"),
            right.get_schedule("200121147490"),
        );

        first.expect("first property should succeed");
        second.expect("second property should succeed");
        assert_eq!(facade.inflight.tracked(), 0);
    }

    #[tokio::test]
    async fn invalidate_forces_the_next_request_to_scrape() {
        let schedules = StubSchedules::new(StubOutcome::Succeed);
        let facade = pipeline(
            StubAddresses::new(Vec::new()),
            Arc::clone(&schedules),
            Duration::hours(24),
        );

        facade
            .get_schedule("100121147490")
            .await
            .expect("first fetch should succeed");

        let key = PropertyRef::parse("100121147490").expect("valid ref");
        facade.invalidate(&key);

        facade
            .get_schedule("100121147490")
            .await
            .expect("refetch should succeed");

        assert_eq!(schedules.calls.load(Ordering::SeqCst), 2);
    }
}
