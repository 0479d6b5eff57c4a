use crate::chain;
use crate::completor::CertificateArtifactSet;
use crate::error::Error;
use crate::error::Result;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::error;
use tracing::warn;

/// Client for the reverse proxy's control API.
///
/// The API accepts a validate-only check of a config fragment (optional —
/// a 404 means the proxy does not support it) and a reload trigger. All
/// requests run under the client-level timeout.
#[derive(Debug, Clone)]
pub struct ProxyClient {
  http: reqwest::Client,
  base_url: String,
}

impl ProxyClient {
  pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
    let http = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(ProxyClient {
      http,
      base_url: base_url.into().trim_end_matches('/').to_string(),
    })
  }

  /// Asks the proxy to check a config fragment without applying it.
  /// Returns `false` when the proxy exposes no validate endpoint.
  pub async fn validate(&self, fragment: &str) -> Result<bool> {
    let url = format!("{}/validate", self.base_url);
    let resp = self
      .http
      .post(&url)
      .body(fragment.to_string())
      .send()
      .await?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
      debug!("proxy exposes no validate endpoint, skipping pre-check");
      return Ok(false);
    }
    if !resp.status().is_success() {
      let status = resp.status();
      let body = resp.text().await.unwrap_or_default();
      return Err(Error::InstallFailed(format!(
        "proxy rejected config fragment ({}): {}",
        status,
        body.trim()
      )));
    }
    Ok(true)
  }

  /// Triggers a proxy reload.
  pub async fn reload(&self) -> Result<()> {
    let url = format!("{}/reload", self.base_url);
    let resp = self.http.post(&url).send().await?;
    if !resp.status().is_success() {
      let status = resp.status();
      let body = resp.text().await.unwrap_or_default();
      return Err(Error::InstallFailed(format!(
        "proxy reload failed ({}): {}",
        status,
        body.trim()
      )));
    }
    Ok(())
  }
}

/// Where the installed artifacts and config fragment ended up.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
  pub cert_dir: PathBuf,
  pub fragment_path: PathBuf,
  pub reloaded: bool,
}

/// Installs issued artifacts for the reverse proxy.
///
/// Installation is atomic from the caller's perspective: the config
/// fragment is written, validated and the proxy reloaded in one critical
/// section, and any failure after the fragment write restores the prior
/// fragment before the error is returned. The proxy is never left serving
/// a config that references half-installed material.
#[derive(Debug, Clone)]
pub struct Installer {
  cert_root: PathBuf,
  conf_dir: PathBuf,
  proxy: ProxyClient,
  expiry_warn_days: i32,
}

impl Installer {
  pub fn new(
    cert_root: impl Into<PathBuf>,
    conf_dir: impl Into<PathBuf>,
    proxy: ProxyClient,
    expiry_warn_days: i32,
  ) -> Self {
    Installer {
      cert_root: cert_root.into(),
      conf_dir: conf_dir.into(),
      proxy,
      expiry_warn_days,
    }
  }

  pub(crate) async fn install(&self, artifacts: &CertificateArtifactSet) -> Result<InstallOutcome> {
    self.pre_install_checks(artifacts)?;

    let cert_dir = self.cert_root.join(&artifacts.domain);
    tokio::fs::create_dir_all(&cert_dir).await?;
    write_artifact(&cert_dir.join("cert.pem"), &artifacts.certificate_pem, false).await?;
    write_artifact(&cert_dir.join("chain.pem"), &artifacts.chain_pem, false).await?;
    write_artifact(&cert_dir.join("fullchain.pem"), &artifacts.fullchain_pem(), false).await?;
    write_artifact(&cert_dir.join("privkey.pem"), &artifacts.private_key_pem, true).await?;

    tokio::fs::create_dir_all(&self.conf_dir).await?;
    let fragment_path = self.conf_dir.join(format!("{}.conf", artifacts.domain));
    let prior = match tokio::fs::read_to_string(&fragment_path).await {
      Ok(body) => Some(body),
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
      Err(err) => return Err(err.into()),
    };

    let fragment = render_fragment(&artifacts.domain, &cert_dir);
    tokio::fs::write(&fragment_path, &fragment).await?;

    if let Err(err) = self.proxy.validate(&fragment).await {
      self.rollback(&fragment_path, &prior).await;
      return Err(into_install_failed(err));
    }
    if let Err(err) = self.proxy.reload().await {
      self.rollback(&fragment_path, &prior).await;
      return Err(into_install_failed(err));
    }

    debug!(domain = %artifacts.domain, fragment = %fragment_path.display(), "proxy reloaded with new certificate");
    Ok(InstallOutcome {
      cert_dir,
      fragment_path,
      reloaded: true,
    })
  }

  fn pre_install_checks(&self, artifacts: &CertificateArtifactSet) -> Result<()> {
    if !chain::validate_key_match(&artifacts.certificate_pem, &artifacts.private_key_pem)? {
      return Err(Error::KeyMismatch);
    }
    chain::parse_chain(&artifacts.fullchain_pem())?;

    let report = chain::validate_certificate(
      &artifacts.certificate_pem,
      Some(&artifacts.domain),
      self.expiry_warn_days,
    )?;
    if !report.problems.is_empty() {
      return Err(Error::ChainInvalid(report.problems.join("; ")));
    }
    if report.expiring_soon {
      warn!(
        domain = %artifacts.domain,
        days_left = report.days_until_expiry,
        "installing a certificate that expires soon"
      );
    }
    Ok(())
  }

  /// Restores the config fragment to its pre-install state.
  async fn rollback(&self, fragment_path: &Path, prior: &Option<String>) {
    let restored = match prior {
      Some(body) => tokio::fs::write(fragment_path, body).await,
      None => match tokio::fs::remove_file(fragment_path).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
      },
    };
    match restored {
      Ok(()) => debug!(fragment = %fragment_path.display(), "config fragment rolled back"),
      Err(err) => error!(
        fragment = %fragment_path.display(),
        "failed to roll back config fragment: {}", err
      ),
    }
  }
}

fn into_install_failed(err: Error) -> Error {
  match err {
    Error::InstallFailed(_) => err,
    other => Error::InstallFailed(other.to_string()),
  }
}

pub(crate) async fn write_artifact(path: &Path, body: &str, private: bool) -> Result<()> {
  if private {
    // the key must never exist on disk with default permissions, so it is
    // recreated with a restrictive mode instead of chmod'd after the write
    match tokio::fs::remove_file(path).await {
      Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
      _ => {}
    }
    let mut file = tokio::fs::OpenOptions::new()
      .write(true)
      .create_new(true)
      .mode(0o600)
      .open(path)
      .await?;
    file.write_all(body.as_bytes()).await?;
    file.flush().await?;
  } else {
    tokio::fs::write(path, body).await?;
  }
  Ok(())
}

fn render_fragment(domain: &str, cert_dir: &Path) -> String {
  format!(
    "# managed by dnscert for {domain} - do not edit\n\
     ssl_certificate {dir}/fullchain.pem;\n\
     ssl_certificate_key {dir}/privkey.pem;\n\
     ssl_trusted_certificate {dir}/chain.pem;\n",
    domain = domain,
    dir = cert_dir.display()
  )
}
