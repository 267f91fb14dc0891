pub mod cache;
pub mod extractor;
pub mod geocoder;
pub mod merger;
pub mod pipeline;
pub mod report;
pub mod roster;
pub mod sources;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
