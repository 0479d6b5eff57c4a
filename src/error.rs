use crate::session::SessionStatus;

/// The error taxonomy for the certificate lifecycle engine.
///
/// DNS and parse errors are locally recoverable: the caller fixes its DNS
/// records (or the ACME client output contract) and retries the same
/// operation. [`Error::StaleSession`] is terminal for a session and requires
/// regeneration. [`Error::InstallFailed`] is only ever returned after the
/// proxy config fragment has been rolled back.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The external ACME client binary could not be found or started.
  #[error("ACME client not available: {0}")]
  NotAvailable(String),

  /// The ACME client produced output the challenge parser does not
  /// recognize. Includes enough of the offending output to diagnose a
  /// contract change.
  #[error("failed to parse ACME client output: {0}")]
  Parse(String),

  /// No TXT records exist at the queried name on any resolver.
  #[error("no TXT record found for {name}")]
  DnsNotFound { name: String },

  /// TXT records exist but the expected value is absent. Carries the full
  /// expected-vs-observed sets so "missing second record", "wrong value"
  /// and "stale cache" are distinguishable to the operator.
  #[error("TXT mismatch for {name}: expected {expected:?}, found {found:?}")]
  DnsMismatch {
    name: String,
    expected: String,
    found: Vec<String>,
  },

  /// The opaque per-domain session state vanished or was overwritten by a
  /// newer `generate` call. Terminal: the challenge must be regenerated.
  #[error("session for {0} is stale; run generate again to obtain fresh challenge records")]
  StaleSession(String),

  /// The certificate authority's own DNS check failed even though local
  /// verification passed. Retryable after propagation catches up.
  #[error("CA-side DNS validation failed: {0}; wait for propagation and retry completion")]
  CaValidationFailed(String),

  /// A rate-limit response from the certificate authority, surfaced
  /// verbatim. Not retryable short-term.
  #[error("certificate authority rate limit: {0}")]
  RateLimited(String),

  /// The ACME client exited unsuccessfully for a reason that is neither a
  /// CA DNS failure nor a rate limit.
  #[error("challenge completion failed: {0}")]
  Completion(String),

  /// Installation failed. The proxy config fragment has already been
  /// restored to its prior version.
  #[error("certificate installation failed (config rolled back): {0}")]
  InstallFailed(String),

  /// A certificate bundle that cannot be parsed or does not form a
  /// coherent chain.
  #[error("invalid certificate chain: {0}")]
  ChainInvalid(String),

  /// The certificate is inside the pre-expiry warning window. Returned by
  /// [`crate::ValidationReport::into_result`]; the issuance workflow
  /// itself treats near-expiry as a logged warning, not a failure.
  #[error("certificate expires in {days_left} day(s)")]
  ExpiringSoon { days_left: i32 },

  /// The private key does not correspond to the certificate's public key.
  /// Fatal for installation.
  #[error("private key does not match certificate public key")]
  KeyMismatch,

  /// An operation was invoked against a session in the wrong state.
  #[error("session is {actual:?}, operation requires {expected:?}")]
  InvalidState {
    expected: SessionStatus,
    actual: SessionStatus,
  },

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  OpenSsl(#[from] openssl::error::ErrorStack),

  #[error("proxy control request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error(transparent)]
  Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
