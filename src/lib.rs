pub mod batch_processor;
pub mod config;
pub mod error;
pub mod events;
pub mod generation_queue;
pub mod metrics_collector;
pub mod models;
pub mod provider;
pub mod queue_manager;
pub mod queue_store;
pub mod queue_worker;
pub mod rate_limiter;
pub mod retry_handler;
