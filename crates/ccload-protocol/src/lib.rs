pub mod classify;
pub mod sse;
pub mod usage;

pub use classify::{classify_path, extract_model_and_stream, max_body_bytes_for_path, split_model_action};
pub use sse::{SseEvent, SseParser};
pub use usage::{JsonUsageParser, SseUsageParser, UsageTuple, VendorKind};
