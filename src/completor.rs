use crate::acme::classify_failure;
use crate::acme::AcmeClient;
use crate::acme::AcmeMode;
use crate::acme::AcmeRequest;
use crate::chain;
use crate::error::Error;
use crate::error::Result;
use crate::session::ChallengeSession;
use crate::session::SessionStatus;
use crate::verifier::summarize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

/// The issued certificate material, loaded from the ACME client's opaque
/// state directory after successful completion.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CertificateArtifactSet {
  pub domain: String,
  /// Whether the certificate's SANs cover `*.<domain>`.
  pub wildcard_covered: bool,
  /// End-entity certificate, PEM.
  pub certificate_pem: String,
  /// Private key, PEM.
  pub private_key_pem: String,
  /// Issuer chain (without the end-entity certificate), PEM.
  pub chain_pem: String,
  /// Validity window as reported by the certificate.
  pub not_before: String,
  pub not_after: String,
}

impl CertificateArtifactSet {
  /// End-entity certificate followed by the issuer chain.
  pub fn fullchain_pem(&self) -> String {
    let mut full = self.certificate_pem.trim_end().to_string();
    full.push('\n');
    full.push_str(self.chain_pem.trim_start());
    full
  }
}

/// Artifact filenames the ACME client writes into the state directory.
const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "privkey.pem";
const CHAIN_FILE: &str = "chain.pem";

/// Finalizes a verified session: re-probes the opaque handle, runs the
/// ACME client's completion step (the CA re-queries DNS on its own), then
/// loads and sanity-checks the issued artifacts.
///
/// The handle is re-checked here, not trusted from earlier calls: a
/// vanished or overwritten state directory marks the session `STALE` and
/// is terminal. CA-side DNS failures leave the session `VERIFIED` so the
/// caller can retry after propagation catches up; any other failure is
/// terminal (`ERROR`).
pub(crate) async fn complete_session(
  acme: &AcmeClient,
  session: &mut ChallengeSession,
  expiry_warn_days: i32,
) -> Result<CertificateArtifactSet> {
  match session.status {
    SessionStatus::Verified => {}
    SessionStatus::PendingDns => {
      // surface the recorded expected-vs-observed detail if we have any
      return Err(match summarize(session).into_result() {
        Err(err) => err,
        Ok(_) => Error::InvalidState {
          expected: SessionStatus::Verified,
          actual: SessionStatus::PendingDns,
        },
      });
    }
    actual => {
      return Err(Error::InvalidState {
        expected: SessionStatus::Verified,
        actual,
      })
    }
  }

  if let Err(err) = session.probe_handle().await {
    session.status = SessionStatus::Stale;
    return Err(err);
  }

  let req = AcmeRequest {
    mode: if session.renew { AcmeMode::Renew } else { AcmeMode::Issue },
    domain: &session.domain,
    email: &session.contact_email,
    wildcard: session.wildcard,
    staging: session.staging,
    state_dir: &session.state_dir,
  };
  let run = acme.complete(&req).await?;
  if !run.success {
    let err = classify_failure(&run);
    match &err {
      Error::CaValidationFailed(detail) => {
        warn!(domain = %session.domain, %detail, "CA-side DNS validation failed; session stays verified for retry");
      }
      _ => {
        session.status = SessionStatus::Error;
      }
    }
    return Err(err);
  }

  let artifacts = load_artifacts(session).await?;
  sanity_check(&artifacts, expiry_warn_days)?;
  session.status = SessionStatus::Issued;
  debug!(domain = %session.domain, not_after = %artifacts.not_after, "certificate issued");
  Ok(artifacts)
}

/// Loads the issued artifacts out of the session's opaque state
/// directory.
pub(crate) async fn load_artifacts(session: &ChallengeSession) -> Result<CertificateArtifactSet> {
  let certificate_pem = read_artifact(session, CERT_FILE).await?;
  let private_key_pem = read_artifact(session, KEY_FILE).await?;
  let chain_pem = read_artifact(session, CHAIN_FILE).await?;

  let cert = openssl::x509::X509::from_pem(certificate_pem.as_bytes())
    .map_err(|err| Error::ChainInvalid(format!("issued certificate is not PEM: {}", err)))?;
  let names = chain::dns_names(&cert);
  let wildcard_covered = names.iter().any(|n| n == &format!("*.{}", session.domain));

  Ok(CertificateArtifactSet {
    domain: session.domain.clone(),
    wildcard_covered,
    not_before: cert.not_before().to_string(),
    not_after: cert.not_after().to_string(),
    certificate_pem,
    private_key_pem,
    chain_pem,
  })
}

async fn read_artifact(session: &ChallengeSession, file: &str) -> Result<String> {
  let path = session.state_dir.join(file);
  tokio::fs::read_to_string(&path).await.map_err(|err| {
    Error::Completion(format!(
      "ACME client reported success but {} is unreadable: {}",
      path.display(),
      err
    ))
  })
}

/// Pre-return sanity pass over freshly issued artifacts: the bundle must
/// parse as a chain, the key must match the certificate, and the
/// certificate must not already be expired. A near-expiry certificate is
/// only warned about.
fn sanity_check(artifacts: &CertificateArtifactSet, expiry_warn_days: i32) -> Result<()> {
  let analysis = chain::parse_chain(&artifacts.fullchain_pem())?;
  debug!(chain = %analysis.message, "issued chain parsed");

  if !chain::validate_key_match(&artifacts.certificate_pem, &artifacts.private_key_pem)? {
    return Err(Error::KeyMismatch);
  }

  let report =
    chain::validate_certificate(&artifacts.certificate_pem, None, expiry_warn_days)?;
  if report.expired {
    return Err(Error::ChainInvalid(
      "issued certificate is already expired".to_string(),
    ));
  }
  if report.expiring_soon {
    warn!(
      domain = %artifacts.domain,
      days_left = report.days_until_expiry,
      "issued certificate is close to expiry"
    );
  }
  Ok(())
}
