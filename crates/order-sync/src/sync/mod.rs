//! Pushing staging rows to the external platform.

mod client;
mod http;
mod limiter;
mod platform;
mod retry;

pub use client::{PushRow, SyncClient, SyncResult};
pub use http::{HttpPlatform, QUANTITY_FIELD};
pub use limiter::RateLimiter;
pub use platform::{ErrorCategory, ItemOutcome, Mutation, Platform, PlatformError};
pub use retry::RetryPolicy;
