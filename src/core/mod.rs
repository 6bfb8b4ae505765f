pub mod aggregator;
pub mod engine;
pub mod extractor;
pub mod rate_limiter;
pub mod retry;
pub mod worker_pool;
