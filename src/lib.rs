//! DNS-01 certificate lifecycle orchestration.
//!
//! This crate drives domain and wildcard certificate issuance through an
//! external ACME client in manual DNS mode: it generates the TXT challenge
//! records an operator must publish, verifies them directly against public
//! resolvers (bypassing every cache in between), completes the challenge,
//! sanity-checks the issued chain and installs the artifacts for a reverse
//! proxy, rolling the proxy config back if the reload fails.
//!
//! The workflow is an explicit state machine persisted per domain:
//!
//! ```text
//! generate -> PENDING_DNS -> verify -> VERIFIED -> complete -> ISSUED -> install -> CONSUMED
//! ```
//!
//! so an external poller (a UI, a cron job) can resume it across process
//! restarts. The ACME client's on-disk session is treated as a capability
//! handle with a liveness probe, never as cached trust: if it vanishes or
//! is overwritten by a newer `generate`, the session is `STALE` and must
//! be regenerated.
//!
//! The chain analyzer ([`parse_chain`], [`validate_certificate`],
//! [`trust_verify`], [`validate_key_match`]) is independent of the
//! workflow and also serves pre-deployment validation of uploaded
//! certificate bundles.

mod acme;
mod chain;
mod completor;
mod error;
mod generator;
mod installer;
mod manager;
mod session;
mod verifier;

pub use crate::acme::AcmeClient;
pub use crate::acme::AcmeMode;
pub use crate::chain::parse_chain;
pub use crate::chain::trust_verify;
pub use crate::chain::validate_certificate;
pub use crate::chain::validate_key_match;
pub use crate::chain::ChainAnalysis;
pub use crate::chain::ChainNode;
pub use crate::chain::ChainRole;
pub use crate::chain::TrustVerification;
pub use crate::chain::ValidationReport;
pub use crate::chain::DEFAULT_EXPIRY_WARN_DAYS;
pub use crate::chain::MIN_KEY_BITS;
pub use crate::completor::CertificateArtifactSet;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::generator::GenerateOptions;
pub use crate::installer::InstallOutcome;
pub use crate::installer::Installer;
pub use crate::installer::ProxyClient;
pub use crate::manager::CertManager;
pub use crate::manager::ManagerConfig;
pub use crate::manager::RecordPropagation;
pub use crate::manager::UploadValidation;
pub use crate::session::ChallengeSession;
pub use crate::session::DnsChallengeRecord;
pub use crate::session::SessionStatus;
pub use crate::session::SessionStore;
pub use crate::verifier::DnsVerifier;
pub use crate::verifier::PropagationResult;
pub use crate::verifier::RecordCheck;
pub use crate::verifier::ResolverOutcome;
pub use crate::verifier::ResolverStatus;
pub use crate::verifier::VerificationOutcome;
pub use crate::verifier::DEFAULT_RESOLVERS;
