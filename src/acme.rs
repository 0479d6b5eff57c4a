use crate::error::Error;
use crate::error::Result;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Whether to run the ACME client's issue or renew subcommand.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AcmeMode {
  Issue,
  Renew,
}

/// Wrapper around the external ACME client subprocess.
///
/// The client is driven in manual DNS mode and keeps its own opaque state
/// in a per-domain directory. Two invocations are used:
///
/// * **generate** (`--defer-completion`): requests validation but stops
///   before completing it, printing each required TXT record to stdout as
///   two header/value line groups:
///
///   ```text
///   Please deploy a DNS TXT record under the name:
///   _acme-challenge.example.com
///   with the following value:
///   dW5pcXVlLXRva2Vu...
///   ```
///
/// * **complete** (`--resume`): answers the client's continuation prompt
///   on stdin; on exit code 0 the client has written `cert.pem`,
///   `privkey.pem` and `chain.pem` into the state directory.
///
/// Every invocation runs under an enforced wall-clock timeout; the child
/// is killed if the runtime drops it.
#[derive(Debug, Clone)]
pub struct AcmeClient {
  binary: PathBuf,
  timeout: Duration,
}

/// Captured result of one ACME client run.
#[derive(Debug)]
pub(crate) struct AcmeRun {
  pub stdout: String,
  pub stderr: String,
  pub success: bool,
}

/// Arguments shared by generate and complete runs.
#[derive(Debug)]
pub(crate) struct AcmeRequest<'a> {
  pub mode: AcmeMode,
  pub domain: &'a str,
  pub email: &'a str,
  pub wildcard: bool,
  pub staging: bool,
  pub state_dir: &'a Path,
}

impl AcmeClient {
  pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
    AcmeClient {
      binary: binary.into(),
      timeout,
    }
  }

  fn command(&self, req: &AcmeRequest<'_>) -> Command {
    let mut cmd = Command::new(&self.binary);
    cmd.arg(match req.mode {
      AcmeMode::Issue => "issue",
      AcmeMode::Renew => "renew",
    });
    cmd.arg("--manual-dns");
    cmd.arg("-d").arg(req.domain);
    if req.wildcard {
      cmd.arg("-d").arg(format!("*.{}", req.domain));
    }
    cmd.arg("-m").arg(req.email);
    if req.staging {
      cmd.arg("--staging");
    }
    cmd.arg("--state-dir").arg(req.state_dir);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
  }

  /// Runs the client in deferred mode and returns its raw output for the
  /// challenge parser.
  pub(crate) async fn generate(&self, req: &AcmeRequest<'_>) -> Result<AcmeRun> {
    let mut cmd = self.command(req);
    cmd.arg("--defer-completion");
    cmd.stdin(Stdio::null());
    self.run(cmd, false).await
  }

  /// Resumes the deferred session, answering the continuation prompt.
  pub(crate) async fn complete(&self, req: &AcmeRequest<'_>) -> Result<AcmeRun> {
    let mut cmd = self.command(req);
    cmd.arg("--resume");
    cmd.stdin(Stdio::piped());
    self.run(cmd, true).await
  }

  async fn run(&self, mut cmd: Command, answer_prompt: bool) -> Result<AcmeRun> {
    debug!(command = ?cmd.as_std(), "running ACME client");
    let mut child = cmd.spawn().map_err(|err| {
      if err.kind() == std::io::ErrorKind::NotFound {
        Error::NotAvailable(format!("{}: {}", self.binary.display(), err))
      } else {
        Error::Io(err)
      }
    })?;

    if answer_prompt {
      if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(b"\n").await?;
      }
    }

    let output = tokio::time::timeout(self.timeout, child.wait_with_output())
      .await
      .map_err(|_| {
        Error::NotAvailable(format!(
          "{} did not finish within {:?}",
          self.binary.display(),
          self.timeout
        ))
      })??;

    Ok(AcmeRun {
      stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
      stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
      success: output.status.success(),
    })
  }
}

/// Maps a failed ACME client run to the error taxonomy.
///
/// Rate-limit messages are surfaced verbatim; CA-side DNS failures are
/// marked retryable; anything else is an opaque completion failure.
pub(crate) fn classify_failure(run: &AcmeRun) -> Error {
  let text = if run.stderr.trim().is_empty() {
    run.stdout.trim()
  } else {
    run.stderr.trim()
  };
  let lower = text.to_lowercase();
  if lower.contains("rate limit") || lower.contains("too many certificates") {
    return Error::RateLimited(text.to_string());
  }
  if lower.contains("dns problem")
    || lower.contains("nxdomain")
    || lower.contains("no txt record")
    || lower.contains("incorrect txt record")
  {
    return Error::CaValidationFailed(text.to_string());
  }
  Error::Completion(text.to_string())
}

const NAME_HEADER: &str = "dns txt record under the name";
const VALUE_HEADER: &str = "with the following value";

/// Extracts ordered `(record name, expected value)` pairs from the ACME
/// client's generate-mode stdout.
///
/// The text contract is line oriented and deliberately parsed narrowly: a
/// name header must be followed by a `_acme-challenge.` name, a value
/// header, and a value. Anything that breaks that shape fails with
/// [`Error::Parse`] instead of guessing.
pub(crate) fn parse_challenge_output(output: &str) -> Result<Vec<(String, String)>> {
  enum Expect {
    NameHeader,
    Name,
    ValueHeader,
    Value,
  }

  let mut state = Expect::NameHeader;
  let mut pending_name: Option<String> = None;
  let mut pairs: Vec<(String, String)> = vec![];

  for raw in output.lines() {
    let line = raw.trim();
    if line.is_empty() {
      continue;
    }
    let lower = line.to_lowercase();
    match state {
      Expect::NameHeader => {
        if lower.contains(NAME_HEADER) {
          state = Expect::Name;
        }
        // banners and progress lines between records are ignored
      }
      Expect::Name => {
        let name = line.trim_end_matches('.').to_string();
        if !name.starts_with("_acme-challenge.") {
          return Err(Error::Parse(format!(
            "expected a _acme-challenge name after the record header, got {:?}",
            line
          )));
        }
        pending_name = Some(name);
        state = Expect::ValueHeader;
      }
      Expect::ValueHeader => {
        if lower.contains(VALUE_HEADER) {
          state = Expect::Value;
        } else {
          return Err(Error::Parse(format!(
            "expected the value header after the record name, got {:?}",
            line
          )));
        }
      }
      Expect::Value => {
        let name = pending_name.take().unwrap_or_default();
        pairs.push((name, line.to_string()));
        state = Expect::NameHeader;
      }
    }
  }

  match state {
    Expect::NameHeader if !pairs.is_empty() => Ok(pairs),
    Expect::NameHeader => Err(Error::Parse(
      "no challenge records found in ACME client output".to_string(),
    )),
    _ => Err(Error::Parse(
      "ACME client output ended mid-record".to_string(),
    )),
  }
}
