// src/ingest/adapters/mod.rs
pub mod anchors;
pub mod feed;

pub use anchors::AnchorAdapter;
pub use feed::FeedAdapter;
