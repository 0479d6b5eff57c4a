use crate::common::env::TestEnv;
use crate::common::proxy::StubProxy;
use dnscert::CertManager;
use dnscert::ChainRole;
use dnscert::Error;
use dnscert::GenerateOptions;
use dnscert::ManagerConfig;
use dnscert::SessionStatus;
use dnscert::SessionStore;
use std::os::unix::fs::PermissionsExt;


const NO_PROXY: &str = "http://127.0.0.1:1";

fn manager(config: &ManagerConfig) -> CertManager {
  CertManager::new(config.clone()).unwrap()
}

fn wildcard_opts() -> GenerateOptions {
  let mut opts = GenerateOptions::new("ops@example.com");
  opts.wildcard = true;
  opts.staging = true;
  opts
}

/// Marks the stored session verified, standing in for a successful DNS
/// verification pass.
async fn mark_verified(config: &ManagerConfig, domain: &str) {
  let store = SessionStore::new(config.sessions_dir.clone());
  let mut session = store.load(domain).await.unwrap().unwrap();
  for record in session.records.iter_mut() {
    record.matched = true;
    record.found_values = vec![record.expected_value.clone()];
  }
  session.status = SessionStatus::Verified;
  store.save(&session).await.unwrap();
}

#[tokio::test]
async fn generate_wildcard_yields_two_records_under_one_name() {
  let (env, _chain) = TestEnv::new("example.com");
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  let session = manager
    .generate("example.com", wildcard_opts())
    .await
    .unwrap();

  assert_eq!(session.status, SessionStatus::PendingDns);
  assert!(session.wildcard);
  assert_eq!(session.records.len(), 2);
  assert_eq!(session.records[0].name, "_acme-challenge.example.com");
  assert_eq!(session.records[0].name, session.records[1].name);
  assert_ne!(
    session.records[0].expected_value,
    session.records[1].expected_value
  );

  // persisted for resumption across restarts
  let stored = manager.session("example.com").await.unwrap().unwrap();
  assert_eq!(stored.records, session.records);
}

#[tokio::test]
async fn generate_single_domain_yields_one_record() {
  let (env, _chain) = TestEnv::new("example.com");
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  let session = manager
    .generate("example.com", GenerateOptions::new("ops@example.com"))
    .await
    .unwrap();

  assert!(!session.wildcard);
  assert_eq!(session.records.len(), 1);
  assert_eq!(session.records[0].name, "_acme-challenge.example.com");
}

#[tokio::test]
async fn regeneration_invalidates_the_previous_session() {
  let (env, _chain) = TestEnv::new("example.com");
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  let first = manager
    .generate("example.com", wildcard_opts())
    .await
    .unwrap();
  let second = manager
    .generate("example.com", wildcard_opts())
    .await
    .unwrap();

  assert_ne!(first.handle_token, second.handle_token);
  // the old session's handle no longer probes live
  assert!(matches!(
    first.probe_handle().await.unwrap_err(),
    Error::StaleSession(_)
  ));
  second.probe_handle().await.unwrap();
}

#[tokio::test]
async fn generate_fails_fast_on_unrecognized_client_output() {
  let (env, _chain) = TestEnv::new("example.com");
  env.use_garbage_acme();
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  let err = manager
    .generate("example.com", GenerateOptions::new("ops@example.com"))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::Parse(_)));
}

#[tokio::test]
async fn generate_reports_missing_client_binary() {
  let (env, _chain) = TestEnv::new("example.com");
  let mut config = env.config(NO_PROXY);
  config.acme_binary = env.scratch.path().join("does-not-exist");
  let manager = manager(&config);

  let err = manager
    .generate("example.com", GenerateOptions::new("ops@example.com"))
    .await
    .unwrap_err();
  assert!(matches!(err, Error::NotAvailable(_)));
}

#[tokio::test]
async fn complete_before_verification_names_the_missing_record() {
  let (env, _chain) = TestEnv::new("example.com");
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  manager
    .generate("example.com", GenerateOptions::new("ops@example.com"))
    .await
    .unwrap();

  match manager.complete("example.com").await.unwrap_err() {
    Error::DnsNotFound { name } => assert_eq!(name, "_acme-challenge.example.com"),
    other => panic!("expected DnsNotFound, got {:?}", other),
  }
}

#[tokio::test]
async fn complete_after_state_dir_deleted_is_stale_not_regenerated() {
  let (env, _chain) = TestEnv::new("example.com");
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  let session = manager
    .generate("example.com", wildcard_opts())
    .await
    .unwrap();
  mark_verified(&config, "example.com").await;

  tokio::fs::remove_dir_all(&session.state_dir).await.unwrap();

  let err = manager.complete("example.com").await.unwrap_err();
  assert!(matches!(err, Error::StaleSession(_)));

  // terminal: recorded as stale, not silently regenerated
  let stored = manager.session("example.com").await.unwrap().unwrap();
  assert_eq!(stored.status, SessionStatus::Stale);
  assert_eq!(stored.handle_token, session.handle_token);
}

#[tokio::test]
async fn complete_loads_and_sanity_checks_issued_artifacts() {
  let (env, chain) = TestEnv::new("example.com");
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  manager
    .generate("example.com", wildcard_opts())
    .await
    .unwrap();
  mark_verified(&config, "example.com").await;

  let artifacts = manager.complete("example.com").await.unwrap();
  assert_eq!(artifacts.domain, "example.com");
  assert!(artifacts.wildcard_covered);
  assert_eq!(
    artifacts.certificate_pem,
    common::certs::pem(&chain.leaf)
  );
  assert!(artifacts.fullchain_pem().contains(artifacts.chain_pem.trim_end()));

  let stored = manager.session("example.com").await.unwrap().unwrap();
  assert_eq!(stored.status, SessionStatus::Issued);
}

#[tokio::test]
async fn ca_side_dns_failure_is_retryable() {
  let (env, _chain) = TestEnv::new("example.com");
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  manager
    .generate("example.com", GenerateOptions::new("ops@example.com"))
    .await
    .unwrap();
  mark_verified(&config, "example.com").await;
  env.use_failing_acme("DNS problem: NXDOMAIN looking up TXT for _acme-challenge.example.com");

  let err = manager.complete("example.com").await.unwrap_err();
  assert!(matches!(err, Error::CaValidationFailed(_)));

  // the session stays verified so completion can be retried
  let stored = manager.session("example.com").await.unwrap().unwrap();
  assert_eq!(stored.status, SessionStatus::Verified);
}

#[tokio::test]
async fn rate_limit_is_surfaced_verbatim() {
  let (env, _chain) = TestEnv::new("example.com");
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  manager
    .generate("example.com", GenerateOptions::new("ops@example.com"))
    .await
    .unwrap();
  mark_verified(&config, "example.com").await;
  let detail = "Rate limit exceeded: too many certificates already issued for example.com";
  env.use_failing_acme(detail);

  match manager.complete("example.com").await.unwrap_err() {
    Error::RateLimited(message) => assert_eq!(message, detail),
    other => panic!("expected RateLimited, got {:?}", other),
  }
  let stored = manager.session("example.com").await.unwrap().unwrap();
  assert_eq!(stored.status, SessionStatus::Error);
}

#[tokio::test]
async fn install_restricts_key_updates_config_and_reloads() {
  let (env, _chain) = TestEnv::new("example.com");
  let proxy = StubProxy::start(200, 200).await.unwrap();
  let config = env.config(&proxy.base_url);
  let manager = manager(&config);

  manager
    .generate("example.com", wildcard_opts())
    .await
    .unwrap();
  mark_verified(&config, "example.com").await;
  manager.complete("example.com").await.unwrap();

  let outcome = manager.install("example.com").await.unwrap();
  assert!(outcome.reloaded);

  let key_path = outcome.cert_dir.join("privkey.pem");
  let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
  assert_eq!(mode & 0o777, 0o600);
  assert!(outcome.cert_dir.join("fullchain.pem").exists());

  let fragment = std::fs::read_to_string(&outcome.fragment_path).unwrap();
  assert!(fragment.contains("fullchain.pem"));
  assert!(fragment.contains("privkey.pem"));

  let paths = proxy.seen_paths().await;
  assert_eq!(paths, vec!["/validate".to_string(), "/reload".to_string()]);

  // consumed sessions are cleared
  assert!(manager.session("example.com").await.unwrap().is_none());
  proxy.stop();
}

#[tokio::test]
async fn install_survives_a_proxy_without_validate_endpoint() {
  let (env, _chain) = TestEnv::new("example.com");
  let proxy = StubProxy::start(404, 200).await.unwrap();
  let config = env.config(&proxy.base_url);
  let manager = manager(&config);

  manager
    .generate("example.com", wildcard_opts())
    .await
    .unwrap();
  mark_verified(&config, "example.com").await;
  manager.complete("example.com").await.unwrap();

  let outcome = manager.install("example.com").await.unwrap();
  assert!(outcome.reloaded);
  proxy.stop();
}

#[tokio::test]
async fn failed_reload_rolls_the_fragment_back() {
  let (env, _chain) = TestEnv::new("example.com");
  let proxy = StubProxy::start(200, 500).await.unwrap();
  let config = env.config(&proxy.base_url);
  let manager = manager(&config);

  manager
    .generate("example.com", wildcard_opts())
    .await
    .unwrap();
  mark_verified(&config, "example.com").await;
  manager.complete("example.com").await.unwrap();

  // a prior fragment is already in place
  std::fs::create_dir_all(&config.proxy_conf_dir).unwrap();
  let fragment_path = config.proxy_conf_dir.join("example.com.conf");
  let prior = "# previous fragment\n";
  std::fs::write(&fragment_path, prior).unwrap();

  let err = manager.install("example.com").await.unwrap_err();
  assert!(matches!(err, Error::InstallFailed(_)));

  // the proxy is never left pointing at the new config
  let restored = std::fs::read_to_string(&fragment_path).unwrap();
  assert_eq!(restored, prior);

  // the session survives for a later retry
  let stored = manager.session("example.com").await.unwrap().unwrap();
  assert_eq!(stored.status, SessionStatus::Issued);
  proxy.stop();
}

#[tokio::test]
async fn failed_reload_removes_a_fragment_that_did_not_exist_before() {
  let (env, _chain) = TestEnv::new("example.com");
  let proxy = StubProxy::start(200, 500).await.unwrap();
  let config = env.config(&proxy.base_url);
  let manager = manager(&config);

  manager
    .generate("example.com", wildcard_opts())
    .await
    .unwrap();
  mark_verified(&config, "example.com").await;
  manager.complete("example.com").await.unwrap();

  let err = manager.install("example.com").await.unwrap_err();
  assert!(matches!(err, Error::InstallFailed(_)));
  assert!(!config.proxy_conf_dir.join("example.com.conf").exists());
  proxy.stop();
}

#[tokio::test]
async fn check_chain_classifies_a_root_first_bundle() {
  let (env, chain) = TestEnv::new("example.com");
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  let bundle = format!(
    "{}{}{}",
    common::certs::pem(&chain.root),
    common::certs::pem(&chain.intermediate),
    common::certs::pem(&chain.leaf)
  );
  let ca_bundle = std::fs::read_to_string(env.fixtures.join("root.pem")).unwrap();
  let analysis = manager.check_chain(&bundle, Some(&ca_bundle)).unwrap();

  assert_eq!(analysis.chain_length(), 3);
  assert!(analysis.has_intermediate);
  assert!(!analysis.self_signed);
  assert_eq!(analysis.nodes[0].role, ChainRole::EndEntity);
  assert_eq!(analysis.nodes[1].role, ChainRole::Intermediate);
  assert_eq!(analysis.nodes[2].role, ChainRole::Root);
  assert_eq!(analysis.trust_verified, Some(true));
}

#[tokio::test]
async fn validate_upload_checks_coverage_and_key() {
  let (env, chain) = TestEnv::new("example.com");
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  let cert = common::certs::pem(&chain.leaf);
  let key = common::certs::key_pem(&chain.leaf_key);
  let validation = manager
    .validate_upload(&cert, Some(&key), Some("a.example.com"))
    .unwrap();
  assert_eq!(validation.report.hostname_covered, Some(true));
  assert_eq!(validation.key_matched, Some(true));
  assert!(validation.report.problems.is_empty());

  let foreign_key = common::certs::key_pem(&common::certs::make_key(2048));
  let validation = manager
    .validate_upload(&cert, Some(&foreign_key), Some("a.b.example.com"))
    .unwrap();
  assert_eq!(validation.report.hostname_covered, Some(false));
  assert_eq!(validation.key_matched, Some(false));
}

#[tokio::test]
async fn clear_discards_the_session_and_allows_a_fresh_start() {
  let (env, _chain) = TestEnv::new("example.com");
  let config = env.config(NO_PROXY);
  let manager = manager(&config);

  manager
    .generate("example.com", GenerateOptions::new("ops@example.com"))
    .await
    .unwrap();
  assert!(manager.session("example.com").await.unwrap().is_some());

  manager.clear("example.com").await.unwrap();
  assert!(manager.session("example.com").await.unwrap().is_none());
  // clearing an already-cleared domain is not an error
  manager.clear("example.com").await.unwrap();

  // the domain starts over cleanly after its lock entry was evicted
  let session = manager
    .generate("example.com", GenerateOptions::new("ops@example.com"))
    .await
    .unwrap();
  assert_eq!(session.status, SessionStatus::PendingDns);
  assert!(manager.session("example.com").await.unwrap().is_some());
}
