//! Sink layer: where processed readings go after the Pipeline. The cache
//! sink always receives the latest value per point; the history sink only
//! receives what the Pipeline's fan-out decision forwards to it.

pub mod cache;
pub mod history;

pub use cache::CacheSink;
pub use history::HistorySink;
