//! Application-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable and configurable.

// === Retry ===

/// Consecutive failures before a retry key is blocked.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Delay after the first failure in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;

/// Upper bound for the backoff delay in milliseconds (before jitter).
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Random jitter as a fraction of the computed delay.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Retry state older than this is purged by the worker.
pub const RETRY_STATE_MAX_AGE_SECS: u64 = 3600;

/// Error codes considered transient. Matched by substring against an
/// error's code.
pub const RETRYABLE_ERROR_CODES: &[&str] = &[
    "ECONNRESET",
    "ECONNREFUSED",
    "ETIMEDOUT",
    "ENOTFOUND",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "EAI_AGAIN",
    "IMAP_TIMEOUT",
    "IMAP_CONNECTION_LOST",
];

// === Mailbox ===

pub const DEFAULT_IMAP_PORT: u16 = 993;

pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Timeout for a single IMAP command in seconds.
pub const IMAP_TIMEOUT_SECS: u64 = 30;

pub const INBOX: &str = "INBOX";

/// Cached SMTP transports, one per department.
pub const SMTP_CACHE_MAX_CAPACITY: u64 = 64;

/// Transports are rebuilt after this many seconds so rotated credentials
/// are picked up.
pub const SMTP_CACHE_TTL_SECS: u64 = 1800;

// === Tickets ===

/// Ticket descriptions are truncated past this many characters.
pub const MAX_DESCRIPTION_CHARS: usize = 5000;

pub const TRUNCATION_MARKER: &str = "\n\n[Content truncated...]";

pub const DEFAULT_SUBJECT: &str = "(no subject)";

pub const EMPTY_BODY: &str = "(no content)";

/// Sequence scope used when a department has no prefix.
pub const GLOBAL_SEQUENCE_SCOPE: &str = "global";

/// Preview length for message-added audit entries.
pub const MESSAGE_PREVIEW_CHARS: usize = 100;

// === Sync ===

/// Default per-department polling interval in seconds.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;

/// How often the worker checks which departments are due.
pub const WORKER_TICK_SECS: u64 = 30;

/// Confidence at or above which a customer match is linked automatically.
pub const AUTO_ASSOCIATE_MIN_CONFIDENCE: u8 = 80;

/// Tickets scanned per batch when linking unassociated tickets.
pub const ASSOCIATION_BATCH_SIZE: i64 = 50;

// === Logs API ===

pub const DEFAULT_LOG_PAGE_SIZE: u32 = 50;

pub const MAX_LOG_PAGE_SIZE: u32 = 100;
