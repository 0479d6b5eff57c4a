use crate::acme::AcmeClient;
use crate::chain;
use crate::chain::ChainAnalysis;
use crate::chain::ValidationReport;
use crate::completor;
use crate::completor::CertificateArtifactSet;
use crate::error::Error;
use crate::error::Result;
use crate::generator;
use crate::generator::GenerateOptions;
use crate::installer::InstallOutcome;
use crate::installer::Installer;
use crate::installer::ProxyClient;
use crate::session::ChallengeSession;
use crate::session::SessionStatus;
use crate::session::SessionStore;
use crate::verifier::DnsVerifier;
use crate::verifier::PropagationResult;
use crate::verifier::VerificationOutcome;
use crate::verifier::DEFAULT_RESOLVERS;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;
use tracing::warn;
use tracing::Level;

/// Engine configuration.
///
/// Deserializable so deployments can keep it in a JSON document next to
/// the proxy's own configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
  /// Path to the external ACME client binary.
  pub acme_binary: PathBuf,
  /// Root under which the ACME client keeps one opaque state directory
  /// per domain.
  pub state_root: PathBuf,
  /// Directory for persisted challenge sessions.
  pub sessions_dir: PathBuf,
  /// Canonical per-domain certificate storage root.
  pub cert_root: PathBuf,
  /// Directory the reverse proxy includes config fragments from.
  pub proxy_conf_dir: PathBuf,
  /// Base URL of the reverse proxy's control API.
  pub proxy_control_url: String,
  /// Public resolver IPs used for verification.
  #[serde(default = "default_resolvers")]
  pub resolvers: Vec<IpAddr>,
  /// Timeout for a single resolver query, in seconds.
  #[serde(default = "default_per_query_timeout")]
  pub per_query_timeout_secs: u64,
  /// Wall-clock timeout for one ACME client invocation, in seconds.
  #[serde(default = "default_subprocess_timeout")]
  pub subprocess_timeout_secs: u64,
  /// Timeout for proxy control API requests, in seconds.
  #[serde(default = "default_proxy_timeout")]
  pub proxy_timeout_secs: u64,
  /// Pre-expiry warning window, in days.
  #[serde(default = "default_expiry_warn_days")]
  pub expiry_warn_days: i32,
}

fn default_resolvers() -> Vec<IpAddr> {
  DEFAULT_RESOLVERS.to_vec()
}

fn default_per_query_timeout() -> u64 {
  5
}

fn default_subprocess_timeout() -> u64 {
  180
}

fn default_proxy_timeout() -> u64 {
  30
}

fn default_expiry_warn_days() -> i32 {
  chain::DEFAULT_EXPIRY_WARN_DAYS
}

/// Propagation detail for one challenge record of a session.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RecordPropagation {
  pub name: String,
  pub expected_value: String,
  pub propagation: PropagationResult,
}

/// Validation result for an uploaded certificate (and optionally its
/// key), for pre-deployment checks outside the issuance workflow.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UploadValidation {
  pub report: ValidationReport,
  /// `None` when no key was supplied.
  pub key_matched: Option<bool>,
}

/// The certificate lifecycle engine.
///
/// Drives `generate → verify → complete → install` for one domain at a
/// time (operations on the same domain are serialized; distinct domains
/// proceed concurrently) and persists session state so an external poller
/// can resume the workflow across process restarts. The engine never
/// retries in the background: every operation is safe to re-invoke.
pub struct CertManager {
  acme: AcmeClient,
  verifier: DnsVerifier,
  installer: Installer,
  store: SessionStore,
  state_root: PathBuf,
  expiry_warn_days: i32,
  locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CertManager {
  pub fn new(config: ManagerConfig) -> Result<Self> {
    let proxy = ProxyClient::new(
      config.proxy_control_url.clone(),
      Duration::from_secs(config.proxy_timeout_secs),
    )?;
    Ok(CertManager {
      acme: AcmeClient::new(
        config.acme_binary.clone(),
        Duration::from_secs(config.subprocess_timeout_secs),
      ),
      verifier: DnsVerifier::new(
        config.resolvers.clone(),
        Duration::from_secs(config.per_query_timeout_secs),
      ),
      installer: Installer::new(
        config.cert_root.clone(),
        config.proxy_conf_dir.clone(),
        proxy,
        config.expiry_warn_days,
      ),
      store: SessionStore::new(config.sessions_dir.clone()),
      state_root: config.state_root,
      expiry_warn_days: config.expiry_warn_days,
      locks: Mutex::new(HashMap::new()),
    })
  }

  /// The verifier, for ad-hoc record checks outside a session.
  pub fn verifier(&self) -> &DnsVerifier {
    &self.verifier
  }

  /// Starts (or restarts) a DNS-01 challenge for `domain`.
  ///
  /// Destructive: the ACME client's opaque state and the handle token are
  /// overwritten, so challenge records from any earlier session must no
  /// longer be published or displayed.
  #[instrument(level = Level::INFO, name = "dnscert::CertManager::generate", err, skip(self, opts), fields(wildcard = opts.wildcard, staging = opts.staging))]
  pub async fn generate(&self, domain: &str, opts: GenerateOptions) -> Result<ChallengeSession> {
    let lock = self.lock_for(domain).await;
    let _guard = lock.lock().await;

    if let Some(existing) = self.store.load(domain).await? {
      if !existing.status.is_terminal() {
        warn!(
          domain,
          status = ?existing.status,
          "replacing an in-flight session; its challenge records are now invalid"
        );
      }
    }

    let session = generator::generate_session(&self.acme, &self.state_root, domain, &opts).await?;
    self.store.save(&session).await?;
    Ok(session)
  }

  /// Verifies every challenge record of the stored session against the
  /// public resolvers. Moves the session to `VERIFIED` when all records
  /// match; otherwise it stays `PENDING_DNS` and the outcome lists, per
  /// record, the expected value and the full observed set.
  #[instrument(level = Level::INFO, name = "dnscert::CertManager::verify", err, skip(self))]
  pub async fn verify(&self, domain: &str) -> Result<VerificationOutcome> {
    let lock = self.lock_for(domain).await;
    let _guard = lock.lock().await;

    let mut session = self.require_session(domain).await?;
    match session.status {
      SessionStatus::PendingDns | SessionStatus::Verified => {}
      actual => {
        return Err(Error::InvalidState {
          expected: SessionStatus::PendingDns,
          actual,
        })
      }
    }
    if let Err(err) = session.probe_handle().await {
      session.status = SessionStatus::Stale;
      self.store.save(&session).await?;
      return Err(err);
    }

    let outcome = self.verifier.verify_session(&mut session).await;
    self.store.save(&session).await?;
    Ok(outcome)
  }

  /// Reports per-resolver propagation for every record of the stored
  /// session, for progress display while the operator waits.
  #[instrument(level = Level::DEBUG, name = "dnscert::CertManager::propagation", err, skip(self))]
  pub async fn propagation(&self, domain: &str) -> Result<Vec<RecordPropagation>> {
    let session = self.require_session(domain).await?;
    let mut results = Vec::with_capacity(session.records.len());
    for record in &session.records {
      let propagation = self
        .verifier
        .check_propagation(&record.name, &record.expected_value)
        .await;
      results.push(RecordPropagation {
        name: record.name.clone(),
        expected_value: record.expected_value.clone(),
        propagation,
      });
    }
    Ok(results)
  }

  /// Completes a verified challenge and returns the issued artifacts.
  /// The opaque handle is re-probed first; the certificate authority then
  /// re-queries DNS on its own.
  #[instrument(level = Level::INFO, name = "dnscert::CertManager::complete", err, skip(self))]
  pub async fn complete(&self, domain: &str) -> Result<CertificateArtifactSet> {
    let lock = self.lock_for(domain).await;
    let _guard = lock.lock().await;

    let mut session = self.require_session(domain).await?;
    let result = completor::complete_session(&self.acme, &mut session, self.expiry_warn_days).await;
    self.store.save(&session).await?;
    result
  }

  /// Installs the issued artifacts: canonical storage, restrictive key
  /// permissions, proxy config fragment, validate, reload. A reload
  /// failure rolls the fragment back before the error surfaces. The
  /// session is cleared once the reload succeeds.
  #[instrument(level = Level::INFO, name = "dnscert::CertManager::install", err, skip(self))]
  pub async fn install(&self, domain: &str) -> Result<InstallOutcome> {
    let lock = self.lock_for(domain).await;
    let _guard = lock.lock().await;

    let mut session = self.require_session(domain).await?;
    if session.status != SessionStatus::Issued {
      return Err(Error::InvalidState {
        expected: SessionStatus::Issued,
        actual: session.status,
      });
    }
    if let Err(err) = session.probe_handle().await {
      session.status = SessionStatus::Stale;
      self.store.save(&session).await?;
      return Err(err);
    }

    let artifacts = completor::load_artifacts(&session).await?;
    let outcome = self.installer.install(&artifacts).await?;

    session.status = SessionStatus::Consumed;
    self.store.save(&session).await?;
    self.store.remove(domain).await?;
    Ok(outcome)
  }

  /// Returns the persisted session for `domain`, with the opaque handle
  /// probed rather than assumed live: a session whose external state has
  /// vanished comes back (and is re-persisted) as `STALE`.
  #[instrument(level = Level::DEBUG, name = "dnscert::CertManager::session", err, skip(self))]
  pub async fn session(&self, domain: &str) -> Result<Option<ChallengeSession>> {
    let lock = self.lock_for(domain).await;
    let _guard = lock.lock().await;

    let mut session = match self.store.load(domain).await? {
      Some(session) => session,
      None => return Ok(None),
    };
    if !session.status.is_terminal() && session.probe_handle().await.is_err() {
      session.status = SessionStatus::Stale;
      self.store.save(&session).await?;
    }
    Ok(Some(session))
  }

  /// Discards the persisted session for `domain` and drops the domain's
  /// lock entry once no other task holds it, so the lock map does not grow
  /// with every domain ever cleared.
  #[instrument(level = Level::INFO, name = "dnscert::CertManager::clear", err, skip(self))]
  pub async fn clear(&self, domain: &str) -> Result<()> {
    let lock = self.lock_for(domain).await;
    let guard = lock.lock().await;
    let result = self.store.remove(domain).await;
    drop(guard);
    drop(lock);

    let mut locks = self.locks.lock().await;
    // strong_count == 1 means the map holds the only reference; an entry
    // another task still waits on must survive to keep exclusion intact
    if let Some(entry) = locks.get(domain) {
      if Arc::strong_count(entry) == 1 {
        locks.remove(domain);
      }
    }
    result
  }

  /// Analyzes a PEM bundle and verifies it against the system trust store
  /// (or `ca_bundle` when supplied). Standalone: usable for uploaded
  /// certificates outside any session.
  #[instrument(level = Level::DEBUG, name = "dnscert::CertManager::check_chain", err, skip_all)]
  pub fn check_chain(&self, bundle: &str, ca_bundle: Option<&str>) -> Result<ChainAnalysis> {
    let mut analysis = chain::parse_chain(bundle)?;
    let trust = chain::trust_verify(bundle, ca_bundle)?;
    analysis.trust_verified = Some(trust.verified);
    analysis.message = format!("{}; {}", analysis.message, trust.message);
    Ok(analysis)
  }

  /// Validates an uploaded certificate (expiry, key size, signature
  /// algorithm, hostname coverage) and, when a key is supplied, whether
  /// the key matches the certificate.
  #[instrument(level = Level::DEBUG, name = "dnscert::CertManager::validate_upload", err, skip_all, fields(hostname))]
  pub fn validate_upload(
    &self,
    cert_pem: &str,
    key_pem: Option<&str>,
    hostname: Option<&str>,
  ) -> Result<UploadValidation> {
    let report = chain::validate_certificate(cert_pem, hostname, self.expiry_warn_days)?;
    let key_matched = match key_pem {
      Some(key) => Some(chain::validate_key_match(cert_pem, key)?),
      None => None,
    };
    Ok(UploadValidation {
      report,
      key_matched,
    })
  }

  async fn require_session(&self, domain: &str) -> Result<ChallengeSession> {
    self
      .store
      .load(domain)
      .await?
      .ok_or_else(|| Error::StaleSession(domain.to_string()))
  }

  /// Per-domain mutual exclusion: the ACME client's opaque state has no
  /// internal concurrency guarantees.
  async fn lock_for(&self, domain: &str) -> Arc<Mutex<()>> {
    let mut locks = self.locks.lock().await;
    locks
      .entry(domain.to_string())
      .or_insert_with(|| Arc::new(Mutex::new(())))
      .clone()
  }
}
