use crate::error::Error;
use crate::error::Result;
use crate::session::ChallengeSession;
use crate::session::DnsChallengeRecord;
use crate::session::SessionStatus;
use hickory_resolver::config::NameServerConfigGroup;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::config::ResolverOpts;
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::instrument;
use tracing::Level;

/// Public resolvers queried by default: Google, Cloudflare, Quad9 and
/// OpenDNS. Queries go straight to these IPs, never through the host's
/// configured resolver, so upstream cache staleness cannot mask a freshly
/// published record.
pub const DEFAULT_RESOLVERS: [IpAddr; 5] = [
  IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
  IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
  IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
  IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)),
  IpAddr::V4(Ipv4Addr::new(208, 67, 222, 222)),
];

/// What a single resolver returned for a TXT query.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum LookupOutcome {
  /// The name resolved; carries every TXT value observed.
  Found(Vec<String>),
  /// The name has no TXT records (authoritative negative answer).
  NotFound,
  /// The resolver could not be consulted (timeout, network failure).
  /// Reported as unknown, never as a mismatch.
  Unknown(String),
}

/// Per-resolver propagation status relative to one expected value.
#[derive(Serialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ResolverStatus {
  /// The expected value was observed at this resolver.
  Matched,
  /// TXT records were observed but none carried the expected value.
  Mismatched { found: Vec<String> },
  /// No TXT record exists at this resolver yet.
  NotFound,
  /// The resolver did not answer in time; no conclusion either way.
  Unknown { reason: String },
}

/// One resolver's contribution to a propagation check.
#[derive(Serialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolverOutcome {
  pub resolver: IpAddr,
  pub status: ResolverStatus,
}

/// Aggregate propagation of one TXT value across the resolver list.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PropagationResult {
  pub outcomes: Vec<ResolverOutcome>,
  pub matched_count: usize,
  pub total_resolvers: usize,
  /// `matched_count / total_resolvers` in percent.
  pub percentage: f64,
}

/// Result of a direct record check, aggregated across all resolvers.
#[derive(Serialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordCheck {
  /// Whether any resolver returned TXT records at all.
  pub exists: bool,
  /// Whether the expected value was among the observed values.
  pub matched: bool,
  /// Union of every TXT value observed across resolvers.
  pub found_values: Vec<String>,
}

/// Outcome of verifying a whole session.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VerificationOutcome {
  /// Snapshot of the session records after verification, including the
  /// observed value sets.
  pub records: Vec<DnsChallengeRecord>,
  pub matched_count: usize,
  pub total_records: usize,
  pub verified: bool,
}

impl VerificationOutcome {
  /// The records whose expected value was not observed.
  pub fn missing(&self) -> Vec<&DnsChallengeRecord> {
    self.records.iter().filter(|r| !r.matched).collect()
  }

  /// Converts an unverified outcome into the matching DNS error for the
  /// first missing record, carrying the full expected-vs-observed sets.
  pub fn into_result(self) -> Result<Self> {
    if self.verified {
      return Ok(self);
    }
    match self.records.into_iter().find(|r| !r.matched) {
      Some(record) if record.found_values.is_empty() => Err(Error::DnsNotFound {
        name: record.name,
      }),
      Some(record) => Err(Error::DnsMismatch {
        name: record.name,
        expected: record.expected_value,
        found: record.found_values,
      }),
      None => Err(Error::DnsNotFound {
        name: String::new(),
      }),
    }
  }
}

/// Cache-bypassing TXT verifier.
///
/// Every query builds a fresh resolver pointed at one explicit public IP
/// with hickory's cache disabled and the hosts file ignored, so repeated
/// checks observe live DNS state. Fan-out is one concurrent task per
/// resolver; dropping the returned future cancels in-flight queries
/// without corrupting already-collected outcomes.
#[derive(Debug, Clone)]
pub struct DnsVerifier {
  resolvers: Vec<IpAddr>,
  per_query_timeout: Duration,
}

impl Default for DnsVerifier {
  fn default() -> Self {
    DnsVerifier {
      resolvers: DEFAULT_RESOLVERS.to_vec(),
      per_query_timeout: Duration::from_secs(5),
    }
  }
}

impl DnsVerifier {
  pub fn new(resolvers: Vec<IpAddr>, per_query_timeout: Duration) -> Self {
    DnsVerifier {
      resolvers,
      per_query_timeout,
    }
  }

  pub fn resolvers(&self) -> &[IpAddr] {
    &self.resolvers
  }

  /// Resolves TXT records for `name` across the full resolver list and
  /// reports whether `expected` is among the observed values. Idempotent
  /// under unchanged DNS state.
  #[instrument(level = Level::DEBUG, name = "dnscert::DnsVerifier::verify_record", skip(self))]
  pub async fn verify_record(&self, name: &str, expected: &str) -> RecordCheck {
    let found_values = self.observed_values(name).await;
    let matched = found_values.iter().any(|v| v == expected);
    RecordCheck {
      exists: !found_values.is_empty(),
      matched,
      found_values,
    }
  }

  /// Union of every TXT value observed at `name` across the resolver
  /// list.
  async fn observed_values(&self, name: &str) -> Vec<String> {
    let outcomes = self.fan_out(name).await;
    let mut found_values: Vec<String> = vec![];
    for (_, outcome) in &outcomes {
      if let LookupOutcome::Found(values) = outcome {
        for value in values {
          if !found_values.contains(value) {
            found_values.push(value.clone());
          }
        }
      }
    }
    found_values
  }

  /// Queries each resolver concurrently and reports per-resolver detail
  /// plus the aggregate percentage of resolvers that already serve
  /// `expected` at `name`.
  #[instrument(level = Level::DEBUG, name = "dnscert::DnsVerifier::check_propagation", skip(self))]
  pub async fn check_propagation(&self, name: &str, expected: &str) -> PropagationResult {
    let outcomes = self.fan_out(name).await;
    let outcomes = outcomes
      .into_iter()
      .map(|(resolver, outcome)| ResolverOutcome {
        resolver,
        status: status_for(expected, &outcome),
      })
      .collect();
    aggregate(outcomes)
  }

  /// Verifies every record of a session, recording observed values on the
  /// records themselves. The session reaches `VERIFIED` only when every
  /// record matches; otherwise it stays in `PENDING_DNS` so the caller can
  /// re-publish and re-verify.
  ///
  /// Wildcard sessions publish two values under one name; the name is
  /// queried once and both expected values are checked against the same
  /// observed set, so a missing second value is reported as a mismatch
  /// against the full set rather than as "record missing".
  #[instrument(
    level = Level::INFO,
    name = "dnscert::DnsVerifier::verify_session",
    skip(self, session),
    fields(domain = %session.domain, wildcard = session.wildcard)
  )]
  pub async fn verify_session(&self, session: &mut ChallengeSession) -> VerificationOutcome {
    let names: Vec<String> = session
      .record_names()
      .into_iter()
      .map(str::to_string)
      .collect();

    for name in names {
      let found = self.observed_values(&name).await;
      for record in session.records.iter_mut().filter(|r| r.name == name) {
        apply_found_values(record, &found);
        if !record.matched {
          debug!(
            name = %record.name,
            expected = %record.expected_value,
            found = ?record.found_values,
            "challenge record not yet visible"
          );
        }
      }
    }

    let outcome = summarize(session);
    session.status = if outcome.verified {
      SessionStatus::Verified
    } else {
      SessionStatus::PendingDns
    };
    outcome
  }

  async fn fan_out(&self, name: &str) -> Vec<(IpAddr, LookupOutcome)> {
    let mut set = JoinSet::new();
    for &ip in &self.resolvers {
      let name = name.to_string();
      let timeout = self.per_query_timeout;
      set.spawn(async move {
        let outcome = match tokio::time::timeout(timeout, lookup_txt(ip, &name, timeout)).await {
          Ok(outcome) => outcome,
          Err(_) => LookupOutcome::Unknown("query timed out".to_string()),
        };
        (ip, outcome)
      });
    }

    let mut collected: Vec<(IpAddr, LookupOutcome)> = vec![];
    while let Some(joined) = set.join_next().await {
      match joined {
        Ok(pair) => collected.push(pair),
        Err(err) => debug!("resolver query task failed: {}", err),
      }
    }
    // stable report order regardless of completion order
    collected.sort_by_key(|(ip, _)| self.resolvers.iter().position(|r| r == ip));
    collected
  }
}

async fn lookup_txt(ip: IpAddr, name: &str, timeout: Duration) -> LookupOutcome {
  let group = NameServerConfigGroup::from_ips_clear(&[ip], 53, true);
  let config = ResolverConfig::from_parts(None, vec![], group);
  let mut opts = ResolverOpts::default();
  opts.timeout = timeout;
  opts.attempts = 1;
  opts.cache_size = 0;
  opts.use_hosts_file = false;
  let resolver = TokioAsyncResolver::tokio(config, opts);

  match resolver.txt_lookup(name).await {
    Ok(lookup) => LookupOutcome::Found(lookup.iter().map(|txt| txt.to_string()).collect()),
    Err(err) => match err.kind() {
      ResolveErrorKind::NoRecordsFound { .. } => LookupOutcome::NotFound,
      _ => LookupOutcome::Unknown(err.to_string()),
    },
  }
}

/// Maps a raw lookup outcome to a propagation status for one expected
/// value.
pub(crate) fn status_for(expected: &str, outcome: &LookupOutcome) -> ResolverStatus {
  match outcome {
    LookupOutcome::Found(values) if values.iter().any(|v| v == expected) => {
      ResolverStatus::Matched
    }
    LookupOutcome::Found(values) if values.is_empty() => ResolverStatus::NotFound,
    LookupOutcome::Found(values) => ResolverStatus::Mismatched {
      found: values.clone(),
    },
    LookupOutcome::NotFound => ResolverStatus::NotFound,
    LookupOutcome::Unknown(reason) => ResolverStatus::Unknown {
      reason: reason.clone(),
    },
  }
}

/// Folds per-resolver outcomes into an aggregate percentage.
pub(crate) fn aggregate(outcomes: Vec<ResolverOutcome>) -> PropagationResult {
  let total_resolvers = outcomes.len();
  let matched_count = outcomes
    .iter()
    .filter(|o| o.status == ResolverStatus::Matched)
    .count();
  let percentage = if total_resolvers == 0 {
    0.0
  } else {
    matched_count as f64 * 100.0 / total_resolvers as f64
  };
  PropagationResult {
    outcomes,
    matched_count,
    total_resolvers,
    percentage,
  }
}

/// Applies an observed value set to one challenge record.
pub(crate) fn apply_found_values(record: &mut DnsChallengeRecord, found: &[String]) {
  record.found_values = found.to_vec();
  record.matched = found.iter().any(|v| v == &record.expected_value);
}

/// Snapshots the per-record match state of a session.
pub(crate) fn summarize(session: &ChallengeSession) -> VerificationOutcome {
  let matched_count = session.records.iter().filter(|r| r.matched).count();
  let total_records = session.records.len();
  VerificationOutcome {
    records: session.records.clone(),
    matched_count,
    total_records,
    verified: total_records > 0 && matched_count == total_records,
  }
}
