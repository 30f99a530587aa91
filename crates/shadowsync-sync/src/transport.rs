//! The network side of a flush: reachability, diff submission and remote
//! file creation.

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use shadowsync_core::config::TransportConfig;
use shadowsync_core::error::TransportError;
use shadowsync_core::types::DiffRecord;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use tracing::debug;

/// A new file to register remotely.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileUpload {
    pub repo_path: String,
    pub server_repo_id: Option<i64>,
    pub branch: String,
    pub file_relative_path: String,
    pub is_binary: bool,
    pub size: u64,
    /// UTF-8 content; empty for binary files.
    pub content: String,
    pub created_at: String,
}

/// One diff as transmitted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingDiff {
    pub repo_path: String,
    pub branch: String,
    pub file_relative_path: String,
    pub file_id: i64,
    pub diff: String,
    pub is_binary: bool,
    pub is_deleted: bool,
    pub created_at: String,
    pub source: String,
}

impl OutgoingDiff {
    pub fn new(record: &DiffRecord, file_id: i64) -> Self {
        Self {
            repo_path: record.repo_path.clone(),
            branch: record.branch.clone(),
            file_relative_path: record.path.clone(),
            file_id,
            diff: record.payload(),
            is_binary: record.is_binary,
            is_deleted: record.kind == shadowsync_core::types::ChangeKind::Deleted,
            created_at: record.created_at.clone(),
            source: record.source.clone(),
        }
    }
}

/// Remote side of the sync. Every failure is retryable from the caller's
/// point of view; nothing here is fatal.
pub trait Transport: Send + Sync {
    fn is_reachable(&self) -> bool;

    /// `Ok(())` only when the server confirmed the diff.
    fn send(&self, diff: &OutgoingDiff) -> Result<(), TransportError>;

    /// Register a file and return its server id.
    fn create_remote_file(&self, upload: &FileUpload) -> Result<i64, TransportError>;
}

/// Run a transport call on its own thread and give up after `timeout`.
///
/// A timed-out call keeps running in the background; its result is dropped.
pub fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TransportError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("shadowsync-send".into())
        .spawn(move || {
            let _ = tx.send(call());
        })
        .map_err(TransportError::unreachable)?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(TransportError::unreachable(
            "transport call ended without a result",
        )),
    }
}

/// Send a diff through `transport` with a deadline.
pub fn send_with_timeout(
    transport: &Arc<dyn Transport>,
    diff: OutgoingDiff,
    timeout: Duration,
) -> Result<(), TransportError> {
    let transport = Arc::clone(transport);
    call_with_timeout(timeout, move || transport.send(&diff))
}

/// Create a remote file through `transport` with a deadline.
pub fn upload_with_timeout(
    transport: &Arc<dyn Transport>,
    upload: FileUpload,
    timeout: Duration,
) -> Result<i64, TransportError> {
    let transport = Arc::clone(transport);
    call_with_timeout(timeout, move || transport.create_remote_file(&upload))
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: i64,
}

/// JSON-over-HTTP transport.
///
/// `GET {endpoint}/healthcheck`, `POST {endpoint}/files` answering
/// `{"id": n}`, and `POST {endpoint}/diffs` where any 2xx confirms the diff.
pub struct HttpTransport {
    endpoint: String,
    access_token: Option<String>,
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(TransportError::unreachable)?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.endpoint)
    }

    fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::blocking::Response, TransportError> {
        let mut request = self
            .client
            .post(self.url(path))
            .header("content-type", "application/json")
            .json(body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().map_err(TransportError::unreachable)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(TransportError::Rejected { status, body });
        }
        Ok(response)
    }
}

impl Transport for HttpTransport {
    fn is_reachable(&self) -> bool {
        match self.client.get(self.url("healthcheck")).send() {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "Healthcheck failed");
                false
            }
        }
    }

    fn send(&self, diff: &OutgoingDiff) -> Result<(), TransportError> {
        self.post("diffs", diff)?;
        Ok(())
    }

    fn create_remote_file(&self, upload: &FileUpload) -> Result<i64, TransportError> {
        let response = self.post("files", upload)?;
        let created: CreatedFile = response
            .json()
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        Ok(created.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn bind_test_listener() -> Option<TcpListener> {
        match TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => None,
            Err(err) => panic!("mock server bind failed: {err}"),
        }
    }

    fn respond_once(listener: TcpListener, status: &'static str, body: &'static str) -> thread::JoinHandle<String> {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("mock server accept failed");
            stream
                .set_read_timeout(Some(Duration::from_millis(300)))
                .unwrap();
            let mut request_buf = [0_u8; 8192];
            let n = stream.read(&mut request_buf).unwrap_or(0);
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream
                .write_all(response.as_bytes())
                .expect("mock server write failed");
            String::from_utf8_lossy(&request_buf[..n]).into_owned()
        })
    }

    fn transport_for(addr: std::net::SocketAddr) -> HttpTransport {
        HttpTransport::new(&TransportConfig {
            endpoint: format!("http://{addr}/v1/"),
            timeout_ms: 2_000,
            access_token: Some("tok".into()),
        })
        .unwrap()
    }

    fn upload() -> FileUpload {
        FileUpload {
            repo_path: "/w/app".into(),
            server_repo_id: Some(1),
            branch: "main".into(),
            file_relative_path: "a.txt".into(),
            is_binary: false,
            size: 1,
            content: "x".into(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn create_remote_file_parses_id() {
        let Some(listener) = bind_test_listener() else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        let server = respond_once(listener, "200 OK", r#"{"id": 42}"#);

        let id = transport_for(addr).create_remote_file(&upload()).unwrap();
        let request = server.join().unwrap();
        assert_eq!(id, 42);
        assert!(request.starts_with("POST /v1/files"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer tok"));
    }

    #[test]
    fn non_success_status_is_rejected() {
        let Some(listener) = bind_test_listener() else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        let server = respond_once(listener, "500 Internal Server Error", r#"{"error":"boom"}"#);

        let diff = OutgoingDiff::new(
            &DiffRecord::modified("/w/app", "main", "a.txt", "@@".into()),
            7,
        );
        let err = transport_for(addr).send(&diff).unwrap_err();
        server.join().unwrap();
        assert!(matches!(err, TransportError::Rejected { status: 500, .. }));
    }

    #[test]
    fn unreachable_endpoint_reports_false() {
        let Some(listener) = bind_test_listener() else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(!transport_for(addr).is_reachable());
    }

    #[test]
    fn call_with_timeout_gives_up() {
        let result: Result<(), TransportError> =
            call_with_timeout(Duration::from_millis(20), || {
                thread::sleep(Duration::from_millis(200));
                Ok(())
            });
        assert!(matches!(result, Err(TransportError::Timeout { timeout_ms: 20 })));
        assert_eq!(call_with_timeout(Duration::from_secs(1), || Ok(5)).unwrap(), 5);
    }
}
