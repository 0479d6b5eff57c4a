use crate::error::Error;
use crate::error::Result;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use tracing::debug;

/// The lifecycle status of a [`ChallengeSession`].
///
/// `PendingDns → Verified → Issued → Consumed` is the success path. A
/// verification failure keeps the session in `PendingDns`. `Stale` and
/// `Error` are terminal: the challenge must be regenerated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
  PendingDns,
  Verified,
  Issued,
  Consumed,
  Stale,
  Error,
}

impl SessionStatus {
  /// Whether the session can make no further forward progress.
  pub fn is_terminal(&self) -> bool {
    matches!(self, SessionStatus::Consumed | SessionStatus::Stale | SessionStatus::Error)
  }
}

/// A single TXT record the operator must publish to prove control of a
/// domain.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DnsChallengeRecord {
  /// Fully qualified record name, e.g. `_acme-challenge.example.com`.
  pub name: String,
  /// The exact TXT value the certificate authority expects at `name`.
  pub expected_value: String,
  /// Whether `expected_value` was observed at the last verification.
  pub matched: bool,
  /// Every TXT value observed at `name` during the last verification.
  /// A wildcard session publishes two values under one name, so a missing
  /// value must be reported against this full set, not as "no record".
  pub found_values: Vec<String>,
}

impl DnsChallengeRecord {
  pub fn new(name: String, expected_value: String) -> Self {
    DnsChallengeRecord {
      name,
      expected_value,
      matched: false,
      found_values: vec![],
    }
  }
}

/// An in-flight DNS-01 challenge for one domain.
///
/// The ACME client keeps its own opaque state on disk under
/// [`ChallengeSession::state_dir`]; this struct records only what the
/// engine needs to drive the workflow and is persisted as JSON so polling
/// can resume across process restarts. The external state is never assumed
/// live: [`ChallengeSession::probe_handle`] re-checks it before every
/// dependent operation.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeSession {
  /// The domain the certificate is requested for.
  pub domain: String,
  /// Whether the request covers `*.<domain>` in addition to `<domain>`.
  pub wildcard: bool,
  /// Contact email the challenge was generated with; replayed to the ACME
  /// client when the session is resumed.
  pub contact_email: String,
  /// Whether the CA's staging environment is in use.
  pub staging: bool,
  /// Whether the session was started via the renew subcommand.
  pub renew: bool,
  /// The TXT records to publish, in the order the ACME client produced
  /// them. Exactly two (one shared name, distinct values) for a wildcard
  /// session, exactly one otherwise.
  pub records: Vec<DnsChallengeRecord>,
  /// The ACME client's opaque per-domain state directory.
  pub state_dir: PathBuf,
  /// Random token written into `state_dir` at generation time. A newer
  /// `generate` overwrites it, which makes this session detectably stale.
  pub handle_token: String,
  /// Current lifecycle status.
  pub status: SessionStatus,
  /// When the challenge was generated.
  pub created_at: SystemTime,
}

/// Name of the handle token marker inside the opaque state directory.
pub(crate) const HANDLE_MARKER: &str = ".dnscert-session";

impl ChallengeSession {
  /// Checks that the opaque external state this session points at still
  /// exists and still belongs to this session. Returns
  /// [`Error::StaleSession`] if the directory or marker is gone, or if the
  /// marker was overwritten by a newer `generate` call.
  pub async fn probe_handle(&self) -> Result<()> {
    let marker = self.state_dir.join(HANDLE_MARKER);
    let token = match tokio::fs::read_to_string(&marker).await {
      Ok(token) => token,
      Err(_) => {
        debug!(domain = %self.domain, "handle marker missing at {}", marker.display());
        return Err(Error::StaleSession(self.domain.clone()));
      }
    };
    if token.trim() != self.handle_token {
      debug!(domain = %self.domain, "handle marker overwritten by a newer session");
      return Err(Error::StaleSession(self.domain.clone()));
    }
    Ok(())
  }

  /// The names the operator needs to publish, deduplicated. For wildcard
  /// sessions both records share one name.
  pub fn record_names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = vec![];
    for record in &self.records {
      if !names.contains(&record.name.as_str()) {
        names.push(&record.name);
      }
    }
    names
  }

  /// Whether every challenge record matched at the last verification.
  pub fn all_matched(&self) -> bool {
    !self.records.is_empty() && self.records.iter().all(|r| r.matched)
  }
}

/// On-disk persistence for [`ChallengeSession`]s: one JSON document per
/// domain, written atomically (temp file + rename) so a crash mid-write
/// never leaves a torn session behind.
#[derive(Debug, Clone)]
pub struct SessionStore {
  dir: PathBuf,
}

impl SessionStore {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    SessionStore { dir: dir.into() }
  }

  fn path_for(&self, domain: &str) -> PathBuf {
    self.dir.join(format!("{}.json", domain))
  }

  pub async fn save(&self, session: &ChallengeSession) -> Result<()> {
    tokio::fs::create_dir_all(&self.dir).await?;
    let path = self.path_for(&session.domain);
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(session)?;
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
  }

  /// Loads the persisted session for `domain`, or `None` if no challenge
  /// was ever generated (or it was cleared).
  pub async fn load(&self, domain: &str) -> Result<Option<ChallengeSession>> {
    let path = self.path_for(domain);
    let bytes = match tokio::fs::read(&path).await {
      Ok(bytes) => bytes,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(err) => return Err(err.into()),
    };
    let session = serde_json::from_slice(&bytes)?;
    Ok(Some(session))
  }

  pub async fn remove(&self, domain: &str) -> Result<()> {
    let path = self.path_for(domain);
    match tokio::fs::remove_file(&path).await {
      Ok(()) => Ok(()),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(err) => Err(err.into()),
    }
  }

  /// The directory sessions are persisted in.
  pub fn dir(&self) -> &Path {
    &self.dir
  }
}
