// Constants for version and binary identification

/// Binary name used in user agents
pub const BINARY_NAME: &str = "blazectl";

/// Package version from Cargo.toml (set at compile time)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the user agent string for HTTP requests
pub fn user_agent() -> String {
    format!("{}/{}", BINARY_NAME, VERSION)
}

// ============================================================================
// Wire Protocol Constants
// ============================================================================

/// FHIR JSON media type used in Accept and Content-Type headers
pub const FHIR_JSON: &str = "application/fhir+json";

// ============================================================================
// Upload Constants
// ============================================================================

/// Default number of parallel uploads
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Connection pool size so concurrent workers do not serialise on handshake
pub const MAX_CONNS_PER_HOST: usize = 100;

// ============================================================================
// Async Polling Constants
// ============================================================================

/// Initial wait before the first async status poll
pub const POLL_INITIAL_WAIT_MS: u64 = 100;

/// Upper bound for the doubling async poll wait
pub const POLL_MAX_WAIT_SECS: u64 = 10;

// ============================================================================
// Retry Constants
// ============================================================================

/// Initial backoff for retrying a transient measure evaluation failure
pub const RETRY_INITIAL_WAIT_MS: u64 = 100;

/// Total sleep budget for transient-failure retries
pub const RETRY_BUDGET_SECS: u64 = 5;
