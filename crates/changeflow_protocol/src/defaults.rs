//! Centralized default values.

/// Page size used when a list request leaves it at zero.
pub const DEFAULT_PAGE_SIZE: i64 = 10;

/// Largest page size honoured; larger requests are clamped.
pub const MAX_PAGE_SIZE: i64 = 1000;

/// Tick of the background approval and slow-query runners, in seconds.
pub const DEFAULT_RUNNER_INTERVAL_SECS: u64 = 10;

/// How often the plan-check scheduler scans for work without a tickle.
pub const DEFAULT_PLAN_CHECK_INTERVAL_SECS: u64 = 5;

/// How often other replicas poll the durable signal table.
pub const DEFAULT_SIGNAL_POLL_INTERVAL_SECS: u64 = 2;

/// Capacity of each best-effort scheduler channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Upper bound on plan-check runs executed concurrently.
pub const DEFAULT_MAX_CONCURRENT_PLAN_CHECKS: usize = 8;

/// Comment bodies longer than this are rejected.
pub const MAX_COMMENT_BYTES: usize = 64 * 1024;

/// Default time budget for a request when the caller sets none, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default webhook delivery timeout, in seconds.
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 5;

/// Plan-check runs report at most this many advice entries per target.
pub const MAX_ADVICE_PER_TARGET: usize = 20;

/// Longest grant ttl or grant-request expiration accepted: ten years.
pub const MAX_GRANT_LIFETIME_SECS: i64 = 10 * 365 * 24 * 60 * 60;
