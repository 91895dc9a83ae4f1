//! Test stand-ins: shell scripts for the git and deploy binaries, and a
//! recording HTTP endpoint for the status APIs.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Records its arguments, creates the target directory on clone and writes the
/// checked-out commit to `.checked-out` in the working copy.
pub struct FakeGit {
    pub bin: PathBuf,
    pub log: PathBuf,
}

impl FakeGit {
    pub fn install(dir: &Path) -> Self {
        Self::install_failing(dir, "")
    }

    /// Like [`FakeGit::install`], but `fail_on` (e.g. `fetch`) exits 128 with a
    /// message that mentions the credentialed URL.
    pub fn install_failing(dir: &Path, fail_on: &str) -> Self {
        let log = dir.join("git.log");
        let body = format!(
            r#"echo "$@" >> "{log}"
if [ "$1" = "{fail_on}" ]; then
  echo "fatal: could not read from remote https://gh-secret-token@github.com/acme/widgets.git" >&2
  exit 128
fi
case "$1" in
  clone)
    for last; do :; done
    mkdir -p "$last" && touch "$last/.remote-origin"
    ;;
  remote)
    if [ "$2" = "set-url" ] && [ ! -f ".remote-$3" ]; then
      echo "error: No such remote '$3'" >&2
      exit 2
    fi
    if [ "$2" = "add" ]; then touch ".remote-$3"; fi
    ;;
  checkout)
    echo "$2" > .checked-out
    ;;
esac
exit 0
"#,
            log = log.display(),
            fail_on = fail_on,
        );
        let bin = write_script(dir, "fake-git", &body);
        FakeGit { bin, log }
    }

    pub fn checked_out(&self, working_dir: &Path) -> Option<String> {
        fs::read_to_string(working_dir.join(".checked-out"))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

/// Prints `url` (after an optional blank line) on deploy; `alias set` succeeds
/// unless `alias_stderr` is given. Every invocation is logged.
pub struct FakeDeploy {
    pub bin: PathBuf,
    pub log: PathBuf,
}

impl FakeDeploy {
    pub fn install(dir: &Path, url: &str) -> Self {
        Self::install_with(dir, &format!("echo\necho '{}'", url), "")
    }

    pub fn install_with(dir: &Path, deploy_body: &str, alias_body: &str) -> Self {
        let log = dir.join("deploy.log");
        let body = format!(
            r#"echo "$@" >> "{log}"
if [ "$1" = "alias" ]; then
{alias_body}
  exit 0
fi
{deploy_body}
exit 0
"#,
            log = log.display(),
            alias_body = alias_body,
            deploy_body = deploy_body,
        );
        let bin = write_script(dir, "fake-deploy", &body);
        FakeDeploy { bin, log }
    }
}

/// One request as seen by [`StubServer`]. Header names are lower-cased.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: serde_json::Value,
}

type Responder = dyn Fn(&RecordedRequest) -> (u16, String) + Send + Sync;

/// Minimal HTTP/1.1 endpoint on an ephemeral port. Records every request and
/// answers each with whatever `respond` returns, then closes the connection.
pub struct StubServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubServer {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&RecordedRequest) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond: Arc<Responder> = Arc::new(respond);

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let Ok(request) = read_request(&mut stream).await else {
                    continue;
                };
                let (status, body) = respond(&request);
                recorded.lock().unwrap().push(request);

                let response = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        StubServer {
            base_url: format!("http://{}", addr),
            requests,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = serde_json::from_slice(&buf[header_end..header_end + length])
        .unwrap_or(serde_json::Value::Null);
    Ok(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}
