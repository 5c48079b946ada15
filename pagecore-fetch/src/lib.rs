//! Asynchronous URL fetching for pagecore
//!
//! One fetch contract ([`UrlFetcher`] driving a [`FetchHandler`]),
//! layered: the reqwest-backed streaming fetcher at the bottom, rate
//! control wrapping it, in-place recording teeing responses into the
//! HTTP cache, and an admission controller gating expensive follow-on
//! work.

pub mod admission;
pub mod error;
pub mod fetch;
pub mod fetcher;
pub mod rate_limit;
pub mod recorder;

pub use admission::ExpensiveOperationController;
pub use error::{Error, Result};
pub use fetch::{
    CancelFlag, CollectingHandler, FetchHandler, FetchOutcome, RequestContext, UrlFetcher,
};
pub use fetcher::{DEFAULT_FETCH_TIMEOUT_MS, FetcherBuilder, HttpsOptions, ReqwestUrlFetcher};
pub use rate_limit::RateControllingFetcher;
pub use recorder::{InPlaceRecorder, RecordingHandler};
