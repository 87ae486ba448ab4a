pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod features;
pub mod log_cursor;
pub mod pipeline;
pub mod records;
pub mod scoring;
pub mod sink;
pub mod store;
pub mod synthetic;
pub mod watermark;
