//! A stub ACME client honoring the subprocess contract the engine drives:
//! `--defer-completion` prints challenge records, `--resume` answers a
//! stdin prompt and drops artifact files into the state directory.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const ARG_PARSING: &str = r#"
mode=""
domain=""
wildcard=0
state_dir=""
prev=""
for arg in "$@"; do
  case "$prev" in
    -d)
      case "$arg" in
        \*.*) wildcard=1 ;;
        *) [ -z "$domain" ] && domain="$arg" ;;
      esac
      ;;
    --state-dir) state_dir="$arg" ;;
  esac
  case "$arg" in
    --defer-completion) mode=generate ;;
    --resume) mode=complete ;;
  esac
  prev="$arg"
done
"#;

fn write_script(path: &Path, body: &str) {
  std::fs::write(path, body).unwrap();
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A well-behaved client: deterministic challenge values on generate,
/// artifacts copied from `fixture_dir` on complete.
pub fn write_stub(path: &Path, fixture_dir: &Path) {
  let body = format!(
    r#"#!/bin/sh
{parsing}
case "$mode" in
generate)
  echo "Requesting a certificate for $domain"
  echo "Please deploy a DNS TXT record under the name:"
  echo "_acme-challenge.$domain"
  echo "with the following value:"
  echo "stub-value-one"
  if [ "$wildcard" = "1" ]; then
    echo "Please deploy a DNS TXT record under the name:"
    echo "_acme-challenge.$domain"
    echo "with the following value:"
    echo "stub-value-two"
  fi
  ;;
complete)
  read _answer
  [ -d "$state_dir" ] || exit 1
  cp "{fixtures}/cert.pem" "$state_dir/cert.pem"
  cp "{fixtures}/privkey.pem" "$state_dir/privkey.pem"
  cp "{fixtures}/chain.pem" "$state_dir/chain.pem"
  ;;
*)
  echo "unknown mode" >&2
  exit 2
  ;;
esac
"#,
    parsing = ARG_PARSING,
    fixtures = fixture_dir.display()
  );
  write_script(path, &body);
}

/// A client whose completion step fails with `message` on stderr.
pub fn write_failing_stub(path: &Path, message: &str) {
  let body = format!(
    r#"#!/bin/sh
{parsing}
case "$mode" in
generate)
  echo "Please deploy a DNS TXT record under the name:"
  echo "_acme-challenge.$domain"
  echo "with the following value:"
  echo "stub-value-one"
  ;;
complete)
  read _answer
  echo "{message}" >&2
  exit 1
  ;;
esac
"#,
    parsing = ARG_PARSING,
    message = message
  );
  write_script(path, &body);
}

/// A client that prints output the challenge parser must reject.
pub fn write_garbage_stub(path: &Path) {
  write_script(
    path,
    "#!/bin/sh\necho \"Certificate issuance has moved to the new workflow.\"\n",
  );
}
