//! Upstream bindings for Swindon Borough Council: the iShare GIS address
//! lookup and the council website schedule scraper.

use std::sync::Arc;

use reqwest::Client;

use kerbside_core::{
    cache::ScheduleCache,
    fetch::{Fetcher, RetryPolicy},
    service::SchedulePipeline,
};

/// Address lookup against the council's iShare GIS endpoint.
pub mod lookup;
/// Schedule scraper for the council collection-days page.
pub mod scrape;

pub use lookup::SwindonAddressSource;
pub use scrape::SwindonScheduleSource;

/// Build both Swindon sources over one shared fetcher.
#[must_use]
pub fn sources(
    client: Client,
    policy: RetryPolicy,
) -> (Arc<SwindonAddressSource>, Arc<SwindonScheduleSource>) {
    let fetcher = Arc::new(Fetcher::new(client, policy));
    let addresses = Arc::new(SwindonAddressSource::new(Arc::clone(&fetcher)));
    let schedules = Arc::new(SwindonScheduleSource::new(fetcher));
    (addresses, schedules)
}

/// Wire a complete pipeline with default retry and cache settings.
#[must_use]
pub fn pipeline(client: Client) -> SchedulePipeline {
    let (addresses, schedules) = sources(client, RetryPolicy::default());
    SchedulePipeline::new(addresses, schedules, ScheduleCache::default())
}
