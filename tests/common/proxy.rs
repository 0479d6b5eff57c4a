//! A loopback stand-in for the reverse proxy's control API: answers
//! `/validate` and `/reload` with configurable statuses and records the
//! request paths it saw.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct StubProxy {
  pub base_url: String,
  pub requests: Arc<Mutex<Vec<String>>>,
  handle: JoinHandle<()>,
}

impl StubProxy {
  /// Starts a proxy answering `/validate` with `validate_status` and
  /// `/reload` with `reload_status`.
  pub async fn start(validate_status: u16, reload_status: u16) -> Result<StubProxy> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec![]));

    let seen = requests.clone();
    let handle = tokio::spawn(async move {
      loop {
        let (socket, _) = match listener.accept().await {
          Ok(conn) => conn,
          Err(_) => return,
        };
        let seen = seen.clone();
        tokio::spawn(async move {
          handle_connection(socket, seen, validate_status, reload_status).await;
        });
      }
    });

    Ok(StubProxy {
      base_url: format!("http://{}", addr),
      requests,
      handle,
    })
  }

  pub async fn seen_paths(&self) -> Vec<String> {
    self.requests.lock().await.clone()
  }

  pub fn stop(&self) {
    self.handle.abort();
  }
}

async fn handle_connection(
  mut socket: tokio::net::TcpStream,
  seen: Arc<Mutex<Vec<String>>>,
  validate_status: u16,
  reload_status: u16,
) {
  let mut buf: Vec<u8> = vec![];
  let mut chunk = [0u8; 4096];

  // read headers, then the content-length body
  let header_end = loop {
    match socket.read(&mut chunk).await {
      Ok(0) => return,
      Ok(n) => buf.extend_from_slice(&chunk[..n]),
      Err(_) => return,
    }
    if let Some(pos) = find_header_end(&buf) {
      break pos;
    }
  };
  let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
  let content_length = head
    .lines()
    .find_map(|line| {
      let (name, value) = line.split_once(':')?;
      if name.eq_ignore_ascii_case("content-length") {
        value.trim().parse::<usize>().ok()
      } else {
        None
      }
    })
    .unwrap_or(0);
  while buf.len() < header_end + 4 + content_length {
    match socket.read(&mut chunk).await {
      Ok(0) => break,
      Ok(n) => buf.extend_from_slice(&chunk[..n]),
      Err(_) => return,
    }
  }

  let path = head
    .lines()
    .next()
    .and_then(|line| line.split_whitespace().nth(1))
    .unwrap_or("/")
    .to_string();
  seen.lock().await.push(path.clone());

  let status = if path.ends_with("/reload") {
    reload_status
  } else if path.ends_with("/validate") {
    validate_status
  } else {
    404
  };
  let reason = match status {
    200 => "OK",
    400 => "Bad Request",
    404 => "Not Found",
    _ => "Internal Server Error",
  };
  let body = reason;
  let response = format!(
    "HTTP/1.1 {} {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
    status,
    reason,
    body.len(),
    body
  );
  let _ = socket.write_all(response.as_bytes()).await;
  let _ = socket.shutdown().await;
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
  buf.windows(4).position(|w| w == b"\r\n\r\n")
}
