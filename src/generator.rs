use crate::acme::classify_failure;
use crate::acme::parse_challenge_output;
use crate::acme::AcmeClient;
use crate::acme::AcmeMode;
use crate::acme::AcmeRequest;
use crate::error::Error;
use crate::error::Result;
use crate::session::ChallengeSession;
use crate::session::DnsChallengeRecord;
use crate::session::SessionStatus;
use crate::session::HANDLE_MARKER;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// Options for generating (or regenerating) a challenge.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
  /// Contact email passed to the certificate authority.
  pub email: String,
  /// Request `*.<domain>` coverage in addition to the apex.
  pub wildcard: bool,
  /// Use the CA's staging environment.
  pub staging: bool,
  /// Run the client's renew subcommand instead of issue.
  pub renew: bool,
}

impl GenerateOptions {
  pub fn new(email: impl Into<String>) -> Self {
    GenerateOptions {
      email: email.into(),
      wildcard: false,
      staging: false,
      renew: false,
    }
  }
}

/// Starts a DNS-01 session for `domain` and returns it in `PENDING_DNS`.
///
/// This overwrites the ACME client's opaque state for the domain and
/// writes a fresh handle token, so any previously generated session for
/// the same domain becomes stale. Callers must treat regeneration as
/// destructive.
pub(crate) async fn generate_session(
  acme: &AcmeClient,
  state_root: &Path,
  domain: &str,
  opts: &GenerateOptions,
) -> Result<ChallengeSession> {
  let state_dir = state_root.join(domain);
  tokio::fs::create_dir_all(&state_dir).await?;

  let req = AcmeRequest {
    mode: if opts.renew { AcmeMode::Renew } else { AcmeMode::Issue },
    domain,
    email: &opts.email,
    wildcard: opts.wildcard,
    staging: opts.staging,
    state_dir: &state_dir,
  };
  let run = acme.generate(&req).await?;
  if !run.success {
    return Err(match classify_failure(&run) {
      Error::Completion(msg) => {
        Error::Parse(format!("ACME client exited unsuccessfully: {}", msg))
      }
      other => other,
    });
  }

  let pairs = parse_challenge_output(&run.stdout)?;
  check_record_shape(opts.wildcard, &pairs)?;
  debug!(domain, records = pairs.len(), "parsed challenge records");

  let handle_token = fresh_token()?;
  tokio::fs::write(state_dir.join(HANDLE_MARKER), &handle_token).await?;

  Ok(ChallengeSession {
    domain: domain.to_string(),
    wildcard: opts.wildcard,
    contact_email: opts.email.clone(),
    staging: opts.staging,
    renew: opts.renew,
    records: pairs
      .into_iter()
      .map(|(name, value)| DnsChallengeRecord::new(name, value))
      .collect(),
    state_dir,
    handle_token,
    status: SessionStatus::PendingDns,
    created_at: SystemTime::now(),
  })
}

/// Enforces the record-shape invariant: a wildcard session has exactly two
/// records sharing one name with distinct values, a non-wildcard session
/// exactly one.
pub(crate) fn check_record_shape(wildcard: bool, pairs: &[(String, String)]) -> Result<()> {
  if wildcard {
    if pairs.len() != 2 {
      return Err(Error::Parse(format!(
        "wildcard challenge must produce exactly 2 records, got {}",
        pairs.len()
      )));
    }
    if pairs[0].0 != pairs[1].0 {
      return Err(Error::Parse(format!(
        "wildcard challenge records must share one name, got {:?} and {:?}",
        pairs[0].0, pairs[1].0
      )));
    }
    if pairs[0].1 == pairs[1].1 {
      return Err(Error::Parse(
        "wildcard challenge records must carry distinct values".to_string(),
      ));
    }
  } else if pairs.len() != 1 {
    return Err(Error::Parse(format!(
      "challenge must produce exactly 1 record, got {}",
      pairs.len()
    )));
  }
  Ok(())
}

fn fresh_token() -> Result<String> {
  let mut bytes = [0u8; 16];
  openssl::rand::rand_bytes(&mut bytes)?;
  Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}
