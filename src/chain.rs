use crate::error::Error;
use crate::error::Result;
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509StoreContext;
use openssl::x509::X509VerifyResult;
use openssl::x509::X509;
use serde::Serialize;

/// Role of a certificate within a chain, derived from subject/issuer
/// relationships rather than bundle position.
#[derive(Serialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainRole {
  /// Issues no other certificate in the bundle.
  EndEntity,
  /// Issues at least one certificate and is itself issued within the
  /// bundle.
  Intermediate,
  /// Self-signed, or the final signer with no issuer in the bundle.
  Root,
}

/// One certificate in an analyzed chain.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChainNode {
  pub subject: String,
  pub issuer: String,
  /// SHA-256 fingerprint, lowercase hex.
  pub fingerprint: String,
  pub role: ChainRole,
  pub self_signed: bool,
}

/// Classification of a PEM certificate bundle.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChainAnalysis {
  /// Nodes in leaf-to-root order, regardless of the order the bundle was
  /// submitted in.
  pub nodes: Vec<ChainNode>,
  /// True iff the root is self-signed and the bundle carries no
  /// intermediate.
  pub self_signed: bool,
  pub has_intermediate: bool,
  /// `None` until a trust verification has been run against a store.
  pub trust_verified: Option<bool>,
  /// Human-readable summary, including the trust diagnostic when
  /// verification ran.
  pub message: String,
}

impl ChainAnalysis {
  pub fn chain_length(&self) -> usize {
    self.nodes.len()
  }
}

/// Outcome of verifying a chain against a trust store.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TrustVerification {
  pub verified: bool,
  /// The toolkit's diagnostic text, e.g. "unable to get local issuer
  /// certificate".
  pub message: String,
}

/// Validation findings for a single certificate.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
  pub subject: String,
  pub expired: bool,
  /// Days until `notAfter`; negative once expired.
  pub days_until_expiry: i32,
  /// Inside the configured pre-expiry warning window.
  pub expiring_soon: bool,
  pub key_bits: u32,
  /// Key below the 2048-bit minimum.
  pub weak_key: bool,
  pub signature_algorithm: String,
  /// Signed with a deprecated algorithm (MD5/SHA-1 family).
  pub deprecated_signature: bool,
  /// The hostname that coverage was checked for, when one was given.
  pub hostname: Option<String>,
  pub hostname_covered: Option<bool>,
  /// Fatal findings; empty means the certificate is deployable.
  pub problems: Vec<String>,
}

impl ValidationReport {
  /// Strict form of the report: fatal findings become
  /// [`Error::ChainInvalid`] and a certificate inside the warning window
  /// becomes [`Error::ExpiringSoon`]. Callers that treat near-expiry as a
  /// soft condition read the report fields directly instead.
  pub fn into_result(self) -> Result<ValidationReport> {
    if !self.problems.is_empty() {
      return Err(Error::ChainInvalid(self.problems.join("; ")));
    }
    if self.expiring_soon {
      return Err(Error::ExpiringSoon {
        days_left: self.days_until_expiry,
      });
    }
    Ok(self)
  }
}

const DEPRECATED_SIGNATURES: [Nid; 4] = [
  Nid::MD5WITHRSAENCRYPTION,
  Nid::SHA1WITHRSAENCRYPTION,
  Nid::DSAWITHSHA1,
  Nid::ECDSA_WITH_SHA1,
];

/// Minimum acceptable public key size in bits.
pub const MIN_KEY_BITS: u32 = 2048;

/// Default pre-expiry warning window in days.
pub const DEFAULT_EXPIRY_WARN_DAYS: i32 = 7;

/// Splits a PEM bundle into certificates and classifies each by its
/// subject/issuer relationships. Classification is invariant to the order
/// certificates appear in the bundle.
pub fn parse_chain(bundle: &str) -> Result<ChainAnalysis> {
  let certs = X509::stack_from_pem(bundle.as_bytes())
    .map_err(|err| Error::ChainInvalid(format!("not a PEM certificate bundle: {}", err)))?;
  if certs.is_empty() {
    return Err(Error::ChainInvalid(
      "bundle contains no certificates".to_string(),
    ));
  }

  let n = certs.len();
  let mut self_signed = vec![false; n];
  let mut issues_other = vec![false; n];
  let mut issued_by: Vec<Option<usize>> = vec![None; n];

  for (i, cert) in certs.iter().enumerate() {
    let own_key = cert.public_key()?;
    self_signed[i] =
      cert.issued(cert) == X509VerifyResult::OK && cert.verify(&own_key).unwrap_or(false);
  }
  for (i, issuer) in certs.iter().enumerate() {
    let issuer_key = issuer.public_key()?;
    for (j, subject) in certs.iter().enumerate() {
      if i == j {
        continue;
      }
      if issuer.issued(subject) == X509VerifyResult::OK
        && subject.verify(&issuer_key).unwrap_or(false)
      {
        issues_other[i] = true;
        issued_by[j] = Some(i);
      }
    }
  }

  let roles: Vec<ChainRole> = (0..n)
    .map(|i| {
      if self_signed[i] {
        ChainRole::Root
      } else if !issues_other[i] {
        ChainRole::EndEntity
      } else if issued_by[i].is_none() {
        // signs others but has no issuer in the bundle
        ChainRole::Root
      } else {
        ChainRole::Intermediate
      }
    })
    .collect();

  // leaf-to-root order: walk issuer links starting from the end entity
  let start = (0..n)
    .find(|&i| roles[i] == ChainRole::EndEntity)
    .unwrap_or(0);
  let mut order: Vec<usize> = vec![];
  let mut cursor = Some(start);
  while let Some(i) = cursor {
    if order.contains(&i) {
      break;
    }
    order.push(i);
    cursor = issued_by[i];
  }
  for i in 0..n {
    if !order.contains(&i) {
      order.push(i);
    }
  }

  let mut nodes = Vec::with_capacity(n);
  for &i in &order {
    let cert = &certs[i];
    nodes.push(ChainNode {
      subject: name_to_string(cert.subject_name()),
      issuer: name_to_string(cert.issuer_name()),
      fingerprint: hex(cert.digest(MessageDigest::sha256())?.as_ref()),
      role: roles[i],
      self_signed: self_signed[i],
    });
  }

  let has_intermediate = nodes.iter().any(|c| c.role == ChainRole::Intermediate);
  let root_self_signed = nodes
    .iter()
    .find(|c| c.role == ChainRole::Root)
    .map(|c| c.self_signed)
    .unwrap_or(false);
  let chain_self_signed = root_self_signed && !has_intermediate;

  let summary = nodes
    .iter()
    .map(|c| match c.role {
      ChainRole::EndEntity => "end-entity",
      ChainRole::Intermediate => "intermediate",
      ChainRole::Root => "root",
    })
    .collect::<Vec<_>>()
    .join(" -> ");
  let message = format!("{} certificate(s): {}", n, summary);

  Ok(ChainAnalysis {
    nodes,
    self_signed: chain_self_signed,
    has_intermediate,
    trust_verified: None,
    message,
  })
}

/// Verifies a leaf-to-root chain against the system trust store, or
/// against `ca_bundle` when one is supplied. Returns the toolkit's
/// pass/fail plus its diagnostic text.
pub fn trust_verify(chain_pem: &str, ca_bundle: Option<&str>) -> Result<TrustVerification> {
  let certs = X509::stack_from_pem(chain_pem.as_bytes())
    .map_err(|err| Error::ChainInvalid(format!("not a PEM certificate bundle: {}", err)))?;
  let mut certs = certs.into_iter();
  let leaf = certs
    .next()
    .ok_or_else(|| Error::ChainInvalid("bundle contains no certificates".to_string()))?;

  let mut untrusted = Stack::new()?;
  for cert in certs {
    untrusted.push(cert)?;
  }

  let mut store = X509StoreBuilder::new()?;
  match ca_bundle {
    Some(pem) => {
      let roots = X509::stack_from_pem(pem.as_bytes())
        .map_err(|err| Error::ChainInvalid(format!("CA bundle is not PEM: {}", err)))?;
      if roots.is_empty() {
        return Err(Error::ChainInvalid(
          "CA bundle contains no certificates".to_string(),
        ));
      }
      for root in roots {
        store.add_cert(root)?;
      }
    }
    None => store.set_default_paths()?,
  }
  let store = store.build();

  let mut ctx = X509StoreContext::new()?;
  let diagnostic = ctx.init(&store, &leaf, &untrusted, |c| {
    let ok = c.verify_cert()?;
    if ok {
      Ok(None)
    } else {
      Ok(Some(c.error()))
    }
  })?;

  Ok(match diagnostic {
    None => TrustVerification {
      verified: true,
      message: "chain verifies against the trust store".to_string(),
    },
    Some(err) => TrustVerification {
      verified: false,
      message: err.error_string().to_string(),
    },
  })
}

/// Validates a single certificate: expiry (with a pre-expiry warning
/// window), minimum key size, deprecated signature algorithms, and
/// optionally hostname coverage.
pub fn validate_certificate(
  cert_pem: &str,
  hostname: Option<&str>,
  expiry_warn_days: i32,
) -> Result<ValidationReport> {
  let cert = X509::from_pem(cert_pem.as_bytes())
    .map_err(|err| Error::ChainInvalid(format!("not a PEM certificate: {}", err)))?;

  let now = Asn1Time::days_from_now(0)?;
  let diff = now.diff(cert.not_after())?;
  let days_until_expiry = diff.days;
  let expired = diff.days < 0 || (diff.days == 0 && diff.secs < 0);
  let expiring_soon = !expired && days_until_expiry <= expiry_warn_days;

  let key_bits = cert.public_key()?.bits();
  let weak_key = key_bits < MIN_KEY_BITS;

  let sig_nid = cert.signature_algorithm().object().nid();
  let signature_algorithm = sig_nid
    .long_name()
    .unwrap_or("unknown")
    .to_string();
  let deprecated_signature = DEPRECATED_SIGNATURES.contains(&sig_nid);

  let hostname_covered = match hostname {
    Some(host) => Some(covers_hostname(&cert, host)),
    None => None,
  };

  let mut problems = vec![];
  if expired {
    problems.push("certificate has expired".to_string());
  }
  if weak_key {
    problems.push(format!(
      "public key is {} bits, below the {}-bit minimum",
      key_bits, MIN_KEY_BITS
    ));
  }
  if deprecated_signature {
    problems.push(format!(
      "deprecated signature algorithm: {}",
      signature_algorithm
    ));
  }
  if let (Some(host), Some(false)) = (hostname, hostname_covered) {
    problems.push(format!("certificate does not cover {}", host));
  }

  Ok(ValidationReport {
    subject: name_to_string(cert.subject_name()),
    expired,
    days_until_expiry,
    expiring_soon,
    key_bits,
    weak_key,
    signature_algorithm,
    deprecated_signature,
    hostname: hostname.map(str::to_string),
    hostname_covered,
    problems,
  })
}

/// Confirms the private key corresponds to the certificate's public key.
pub fn validate_key_match(cert_pem: &str, key_pem: &str) -> Result<bool> {
  let cert = X509::from_pem(cert_pem.as_bytes())
    .map_err(|err| Error::ChainInvalid(format!("not a PEM certificate: {}", err)))?;
  let key = PKey::private_key_from_pem(key_pem.as_bytes())
    .map_err(|err| Error::ChainInvalid(format!("not a PEM private key: {}", err)))?;
  let cert_key = cert.public_key()?;
  Ok(key.public_eq(&cert_key))
}

/// Whether `pattern` (a SAN or CN entry) covers `host`.
///
/// Wildcards cover exactly one label: `*.example.com` matches
/// `a.example.com` but neither `example.com` nor `a.b.example.com`.
pub(crate) fn hostname_matches(pattern: &str, host: &str) -> bool {
  let pattern = pattern.trim_end_matches('.').to_lowercase();
  let host = host.trim_end_matches('.').to_lowercase();
  if let Some(base) = pattern.strip_prefix("*.") {
    match host.strip_suffix(base) {
      Some(prefix) => {
        // exactly one extra label, non-empty
        prefix.len() > 1 && prefix.ends_with('.') && !prefix[..prefix.len() - 1].contains('.')
      }
      None => false,
    }
  } else {
    pattern == host
  }
}

/// All DNS names a certificate covers: SAN entries plus the subject CN.
pub(crate) fn dns_names(cert: &X509) -> Vec<String> {
  let mut names: Vec<String> = vec![];
  if let Some(sans) = cert.subject_alt_names() {
    for san in &sans {
      if let Some(dns) = san.dnsname() {
        names.push(dns.to_string());
      }
    }
  }
  for entry in cert.subject_name().entries_by_nid(Nid::COMMONNAME) {
    if let Ok(cn) = entry.data().as_utf8() {
      let cn = cn.to_string();
      if !names.contains(&cn) {
        names.push(cn);
      }
    }
  }
  names
}

fn covers_hostname(cert: &X509, host: &str) -> bool {
  dns_names(cert).iter().any(|name| hostname_matches(name, host))
}

fn hex(bytes: &[u8]) -> String {
  bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn name_to_string(name: &openssl::x509::X509NameRef) -> String {
  name
    .entries()
    .map(|entry| {
      let key = entry.object().nid().short_name().unwrap_or("?");
      let value = entry
        .data()
        .as_utf8()
        .map(|s| s.to_string())
        .unwrap_or_default();
      format!("{}={}", key, value)
    })
    .collect::<Vec<_>>()
    .join(", ")
}
