//! Integration tests for the course generation engine

mod cancellation;
mod concurrency;
mod regeneration;
mod scenarios;
mod store;
pub(crate) mod test_utils;
