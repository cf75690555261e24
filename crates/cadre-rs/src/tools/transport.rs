//! Concrete [`RemoteTransport`]s: JSON over HTTP and line-delimited JSON
//! over a child process's stdio.

use super::remote::{RemoteRequest, RemoteResponse, RemoteToolInfo, RemoteTransport, TransportFuture};
use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Default time to wait for a tool server reply.
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize, Serialize, Debug)]
struct CatalogResponse {
    tools: Vec<RemoteToolInfo>,
}

// ── HTTP ───────────────────────────────────────────────────────────

/// Tool server reachable over HTTP.
///
/// Calls are `POST {base}/tools/call` with a [`RemoteRequest`] body; the
/// catalog is `GET {base}/tools/list` returning `{"tools": [...]}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TRANSPORT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, TransportError> {
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        if !status.is_success() {
            return Err(TransportError::Protocol(format!("HTTP {status}: {body}")));
        }
        serde_json::from_str(&body)
            .map_err(|e| TransportError::Protocol(format!("malformed reply: {e}")))
    }

    async fn post_call(&self, request: RemoteRequest) -> Result<RemoteResponse, TransportError> {
        debug!("HTTP tool call {} -> {}", request.tool, self.base_url);
        let resp = self
            .client
            .post(format!("{}/tools/call", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Self::read_json(resp).await
    }

    async fn get_catalog(&self) -> Result<Vec<RemoteToolInfo>, TransportError> {
        let resp = self
            .client
            .get(format!("{}/tools/list", self.base_url))
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self::read_json::<CatalogResponse>(resp).await?.tools)
    }
}

impl RemoteTransport for HttpTransport {
    fn call(&self, request: RemoteRequest) -> TransportFuture<'_, RemoteResponse> {
        Box::pin(self.post_call(request))
    }

    fn list_tools(&self) -> TransportFuture<'_, Vec<RemoteToolInfo>> {
        Box::pin(self.get_catalog())
    }
}

// ── Stdio ──────────────────────────────────────────────────────────

/// One line written to the tool server. The server echoes `id` in its
/// reply.
#[derive(Serialize, Debug)]
struct StdioLine<'a> {
    id: u64,
    #[serde(flatten)]
    request: StdioRequest<'a>,
}

#[derive(Serialize, Debug)]
#[serde(tag = "method", rename_all = "lowercase")]
enum StdioRequest<'a> {
    Call(&'a RemoteRequest),
    List,
}

struct StdioPipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
    /// Set while a request line is being written. Still set on the next call
    /// means a write was abandoned halfway and the stream is unusable.
    writing: bool,
}

/// Tool server running as a child process.
///
/// Each request is one JSON line on the child's stdin and each reply one JSON
/// line on its stdout carrying the request's `id`. Requests are serialized;
/// replies to abandoned requests (timed out or cancelled callers) are
/// skipped by id. The child is killed when the transport is dropped.
pub struct StdioTransport {
    program: String,
    pipes: Mutex<StdioPipes>,
    _child: Child,
    timeout: Duration,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl StdioTransport {
    pub fn spawn<S: AsRef<str>>(program: &str, args: &[S]) -> Result<Self, TransportError> {
        let mut child = Command::new(program)
            .args(args.iter().map(|a| AsRef::<str>::as_ref(a)))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Connection(format!("failed to spawn '{program}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connection("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Connection("failed to capture stdout".into()))?;

        debug!("Spawned stdio tool server: {program}");
        Ok(Self {
            program: program.to_string(),
            pipes: Mutex::new(StdioPipes {
                stdin,
                stdout: BufReader::new(stdout),
                next_id: 1,
                writing: false,
            }),
            _child: child,
            timeout: DEFAULT_TRANSPORT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn round_trip<T: serde::de::DeserializeOwned>(
        &self,
        request: StdioRequest<'_>,
    ) -> Result<T, TransportError> {
        let mut pipes = self.pipes.lock().await;
        if pipes.writing {
            return Err(TransportError::Closed);
        }
        let id = pipes.next_id;
        pipes.next_id += 1;

        let mut line = serde_json::to_string(&StdioLine { id, request })
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        line.push('\n');

        pipes.writing = true;
        pipes.stdin.write_all(line.as_bytes()).await?;
        pipes.stdin.flush().await?;
        pipes.writing = false;
        trace!("stdio -> {}: {}", self.program, line.trim_end());

        let reply = tokio::time::timeout(self.timeout, read_reply_for(&mut pipes.stdout, id))
            .await
            .map_err(|_| {
                TransportError::Connection(format!(
                    "'{}' did not reply within {:.0}s",
                    self.program,
                    self.timeout.as_secs_f64()
                ))
            })??;
        trace!("stdio <- {}: {reply}", self.program);
        serde_json::from_value(reply)
            .map_err(|e| TransportError::Protocol(format!("malformed reply: {e}")))
    }
}

/// Read replies until the one for `id`, skipping replies to earlier
/// requests whose callers went away.
async fn read_reply_for(
    stdout: &mut BufReader<ChildStdout>,
    id: u64,
) -> Result<serde_json::Value, TransportError> {
    loop {
        let line = read_reply(stdout).await?;
        let reply: serde_json::Value = serde_json::from_str(&line)
            .map_err(|e| TransportError::Protocol(format!("malformed reply: {e}")))?;
        match reply.get("id").and_then(serde_json::Value::as_u64) {
            Some(got) if got == id => return Ok(reply),
            Some(got) if got < id => debug!("Skipping stale stdio reply (id {got}, want {id})"),
            Some(got) => {
                return Err(TransportError::Protocol(format!(
                    "reply for unknown request {got} (want {id})"
                )));
            }
            None => return Err(TransportError::Protocol("reply without id".into())),
        }
    }
}

/// Next non-empty line from the server.
async fn read_reply(stdout: &mut BufReader<ChildStdout>) -> Result<String, TransportError> {
    let mut buf = String::new();
    loop {
        buf.clear();
        if stdout.read_line(&mut buf).await? == 0 {
            return Err(TransportError::Closed);
        }
        let trimmed = buf.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
}

impl RemoteTransport for StdioTransport {
    fn call(&self, request: RemoteRequest) -> TransportFuture<'_, RemoteResponse> {
        Box::pin(async move { self.round_trip(StdioRequest::Call(&request)).await })
    }

    fn list_tools(&self) -> TransportFuture<'_, Vec<RemoteToolInfo>> {
        Box::pin(async move {
            let catalog: CatalogResponse = self.round_trip(StdioRequest::List).await?;
            Ok(catalog.tools)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const ECHO_SERVER: &str = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed 's/^{"id":\([0-9]*\),.*/\1/')
  case "$line" in
    *'"method":"list"'*) echo "{\"id\":$id,\"tools\":[{\"name\":\"ping\",\"description\":\"Ping\"}]}" ;;
    *) echo "{\"id\":$id,\"status\":\"ok\",\"content\":\"pong\"}" ;;
  esac
done"#;

    /// Answers the first request after a second, later ones at once.
    const SLOW_FIRST_SERVER: &str = r#"n=0
while IFS= read -r line; do
  n=$((n+1))
  id=$(printf '%s\n' "$line" | sed 's/^{"id":\([0-9]*\),.*/\1/')
  if [ "$n" = 1 ]; then
    sleep 1
    echo "{\"id\":$id,\"status\":\"ok\",\"content\":\"first\"}"
  else
    echo "{\"id\":$id,\"status\":\"ok\",\"content\":\"second\"}"
  fi
done"#;

    fn request() -> RemoteRequest {
        RemoteRequest {
            tool: "ping".into(),
            arguments: serde_json::json!({}),
        }
    }

    #[test]
    fn stdio_request_shape() {
        let req = request();
        let line = serde_json::to_string(&StdioLine {
            id: 7,
            request: StdioRequest::Call(&req),
        })
        .unwrap();
        assert!(line.starts_with(r#"{"id":7,"#));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["method"], "call");
        assert_eq!(value["tool"], "ping");
        let list = serde_json::to_value(StdioLine {
            id: 1,
            request: StdioRequest::List,
        })
        .unwrap();
        assert_eq!(list, serde_json::json!({"id": 1, "method": "list"}));
    }

    #[tokio::test]
    async fn stdio_round_trip() {
        let transport = StdioTransport::spawn("sh", &["-c", ECHO_SERVER]).unwrap();
        let catalog = transport.list_tools().await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, "ping");

        let reply = transport.call(request()).await.unwrap();
        assert_eq!(
            reply,
            RemoteResponse::Ok {
                content: "pong".into()
            }
        );
    }

    #[tokio::test]
    async fn abandoned_call_reply_is_not_handed_to_next_call() {
        let transport = StdioTransport::spawn("sh", &["-c", SLOW_FIRST_SERVER]).unwrap();
        let first =
            tokio::time::timeout(Duration::from_millis(200), transport.call(request())).await;
        assert!(first.is_err());

        let reply = transport.call(request()).await.unwrap();
        assert_eq!(
            reply,
            RemoteResponse::Ok {
                content: "second".into()
            }
        );
    }

    #[tokio::test]
    async fn reply_without_id_is_protocol_error() {
        let transport = StdioTransport::spawn(
            "sh",
            &["-c", r#"read -r line; echo '{"status":"ok","content":"x"}'"#],
        )
        .unwrap();
        let err = transport.call(request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn stdio_exited_server_is_transport_error() {
        let transport = StdioTransport::spawn("sh", &["-c", "exit 0"]).unwrap();
        assert!(transport.call(request()).await.is_err());
    }

    #[test]
    fn spawn_failure_is_connection_error() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let err = StdioTransport::spawn::<&str>("/nonexistent/cadre-tool-server", &[]).unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
    }

    /// Serve a single canned HTTP response.
    async fn one_shot_server(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn http_catalog() {
        let base = one_shot_server(r#"{"tools":[{"name":"search","read_only":true}]}"#).await;
        let transport = HttpTransport::new(base).unwrap();
        let catalog = transport.list_tools().await.unwrap();
        assert_eq!(catalog[0].name, "search");
        assert!(catalog[0].read_only);
    }

    #[tokio::test]
    async fn http_unreachable_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let transport = HttpTransport::new(format!("http://{addr}/")).unwrap();
        let err = transport.call(request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
    }
}
