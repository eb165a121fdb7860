//! Daemon control client
//!
//! Talks JSON-RPC 2.0 over HTTP POST to an aria2-compatible download daemon.
//! Calls are never retried here; callers decide using [`Error::is_retryable`].

use crate::backend::{StartRequest, TransferBackend};
use crate::error::{Error, Result};
use crate::types::{Backend, DownloadOptions, GlobalStats, Settings, TaskStatus, TransferSnapshot};
use crate::utils::clamp_u32;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Keys requested by the synchronizer; everything a snapshot needs
pub const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "uploadSpeed",
    "connections",
    "errorCode",
    "errorMessage",
    "files",
];

/// Status of one daemon transfer as reported by `tellStatus`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    #[serde(default)]
    pub gid: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "de_u64")]
    pub total_length: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub completed_length: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub download_speed: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub upload_speed: u64,
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub connections: Option<u64>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub files: Vec<DaemonFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonFile {
    #[serde(default)]
    pub path: String,
    #[serde(default, deserialize_with = "de_u64")]
    pub length: u64,
    #[serde(default, deserialize_with = "de_u64")]
    pub completed_length: u64,
}

impl StatusSnapshot {
    pub fn task_status(&self) -> TaskStatus {
        TaskStatus::from_daemon(&self.status)
    }

    /// Convert to the backend-neutral snapshot for `handle`
    pub fn to_transfer(&self, handle: &str) -> TransferSnapshot {
        let status = self.task_status();
        let error_message = match status {
            TaskStatus::Error => Some(
                self.error_message
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("daemon error code {}", self.error_code.as_deref().unwrap_or("?"))),
            ),
            _ => None,
        };

        TransferSnapshot {
            id: handle.to_string(),
            status,
            completed_bytes: self.completed_length,
            total_bytes: (self.total_length > 0).then_some(self.total_length),
            download_speed: Some(self.download_speed),
            connections: self.connections.and_then(|c| u32::try_from(c).ok()),
            error_message,
            display_name: self
                .files
                .first()
                .and_then(|f| Path::new(&f.path).file_name())
                .map(|name| name.to_string_lossy().to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGlobalStat {
    #[serde(default, deserialize_with = "de_u64")]
    download_speed: u64,
    #[serde(default, deserialize_with = "de_u64")]
    upload_speed: u64,
    #[serde(default, deserialize_with = "de_u64")]
    num_active: u64,
    #[serde(default, deserialize_with = "de_u64")]
    num_waiting: u64,
    #[serde(default, deserialize_with = "de_u64")]
    num_stopped: u64,
}

/// JSON-RPC client for the download daemon
pub struct DaemonClient {
    http: reqwest::Client,
    endpoint: String,
    secret: Option<String>,
    namespace: String,
    call_timeout: Duration,
    next_id: AtomicU64,
}

impl DaemonClient {
    pub fn new(endpoint: &str, secret: Option<String>, namespace: &str, call_timeout: Duration) -> Result<Self> {
        reqwest::Url::parse(endpoint)
            .map_err(|e| Error::Validation(format!("invalid daemon RPC URL {:?}: {}", endpoint, e)))?;

        Ok(Self {
            http: reqwest::Client::builder().build()?,
            endpoint: endpoint.to_string(),
            secret: secret.filter(|s| !s.is_empty()),
            namespace: namespace.to_string(),
            call_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            &settings.daemon_rpc_url,
            settings.daemon_secret.clone(),
            &settings.daemon_namespace,
            Duration::from_millis(settings.rpc_timeout_ms),
        )
    }

    /// Issue one RPC call
    ///
    /// An `error` member in the body wins over the HTTP status, since the
    /// daemon reports RPC failures with 4xx codes.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut full_params = Vec::with_capacity(params.len() + 1);
        if let Some(secret) = &self.secret {
            full_params.push(Value::String(format!("token:{}", secret)));
        }
        full_params.extend(params);

        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": format!("{}.{}", self.namespace, method),
            "params": full_params,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("daemon unreachable: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read daemon response: {}", e)))?;

        let envelope = serde_json::from_str::<RpcEnvelope>(&text);
        if let Ok(RpcEnvelope { error: Some(err), .. }) = &envelope {
            return Err(Error::Rpc {
                code: err.code,
                message: err.message.clone(),
            });
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("daemon returned HTTP {}", status)));
        }

        let result = envelope
            .map_err(|e| Error::Parse(format!("malformed daemon response: {}", e)))?
            .result
            .ok_or_else(|| Error::Parse(format!("{} response has no result", method)))?;
        serde_json::from_value(result).map_err(|e| Error::Parse(format!("unexpected {} result: {}", method, e)))
    }

    /// Queue a URI; returns the daemon handle
    pub async fn add_uri(&self, uri: &str, options: &DownloadOptions) -> Result<String> {
        let handle: String = self
            .call("addUri", vec![json!([uri]), serde_json::to_value(options)?])
            .await?;
        log::info!("Daemon accepted {} as {}", uri, handle);
        Ok(handle)
    }

    pub async fn tell_status(&self, handle: &str, keys: Option<&[&str]>) -> Result<StatusSnapshot> {
        let mut params = vec![json!(handle)];
        if let Some(keys) = keys {
            params.push(json!(keys));
        }
        self.call("tellStatus", params).await
    }

    /// `tellStatus` bounded by `limit`; expiry is a transport failure
    pub async fn tell_status_with_timeout(&self, handle: &str, limit: Duration) -> Result<StatusSnapshot> {
        tokio::time::timeout(limit, self.tell_status(handle, Some(STATUS_KEYS)))
            .await
            .map_err(|_| Error::Transport(format!("tellStatus {} timed out after {:?}", handle, limit)))?
    }

    pub async fn pause(&self, handle: &str) -> Result<()> {
        let _: String = self.call("pause", vec![json!(handle)]).await?;
        Ok(())
    }

    pub async fn unpause(&self, handle: &str) -> Result<()> {
        let _: String = self.call("unpause", vec![json!(handle)]).await?;
        Ok(())
    }

    pub async fn remove(&self, handle: &str) -> Result<()> {
        let _: String = self.call("remove", vec![json!(handle)]).await?;
        Ok(())
    }

    pub async fn global_stats(&self) -> Result<GlobalStats> {
        let raw: RawGlobalStat = self.call("getGlobalStat", vec![]).await?;
        Ok(GlobalStats {
            download_speed: raw.download_speed,
            upload_speed: raw.upload_speed,
            num_active: clamp_u32(raw.num_active),
            num_waiting: clamp_u32(raw.num_waiting),
            num_stopped: clamp_u32(raw.num_stopped),
        })
    }
}

#[async_trait]
impl TransferBackend for DaemonClient {
    fn kind(&self) -> Backend {
        Backend::Daemon
    }

    async fn start(&self, request: &StartRequest) -> Result<TransferSnapshot> {
        let options = DownloadOptions {
            dir: Some(request.destination.to_string_lossy().to_string()),
            out: request.filename.clone(),
            ..Default::default()
        };
        let handle = self.add_uri(&request.source_uri, &options).await?;

        match self.tell_status_with_timeout(&handle, self.call_timeout).await {
            Ok(status) => Ok(status.to_transfer(&handle)),
            Err(e) => {
                log::warn!("Initial status for {} unavailable: {}", handle, e);
                Ok(TransferSnapshot {
                    id: handle,
                    ..Default::default()
                })
            }
        }
    }

    async fn pause(&self, id: &str) -> Result<()> {
        DaemonClient::pause(self, id).await
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.unpause(id).await
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        self.remove(id).await
    }

    async fn snapshot(&self, id: &str) -> Result<TransferSnapshot> {
        let status = self.tell_status_with_timeout(id, self.call_timeout).await?;
        Ok(status.to_transfer(id))
    }
}

/// The daemon encodes integers as decimal strings
fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Int(u64),
        Text(String),
    }

    match Number::deserialize(deserializer)? {
        Number::Int(n) => Ok(n),
        Number::Text(s) if s.is_empty() => Ok(0),
        Number::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<u64>, D::Error> {
    de_u64(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, secret: Option<&str>) -> DaemonClient {
        DaemonClient::new(
            &format!("{}/jsonrpc", server.uri()),
            secret.map(String::from),
            "aria2",
            Duration::from_secs(3),
        )
        .unwrap()
    }

    fn rpc_result(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
    }

    async fn request_bodies(server: &MockServer) -> Vec<Value> {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| serde_json::from_slice(&r.body).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_tell_status_parses_string_numbers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_partial_json(json!({"method": "aria2.tellStatus"})))
            .respond_with(rpc_result(json!({
                "gid": "2089b05ecca3d829",
                "status": "active",
                "totalLength": "1000",
                "completedLength": "500",
                "downloadSpeed": "100",
                "uploadSpeed": "0",
                "connections": "4",
                "files": [{"path": "/media/Movies/Heat/Heat.1995.mkv", "length": "1000", "completedLength": "500"}]
            })))
            .mount(&server)
            .await;

        let status = client(&server, None)
            .tell_status("2089b05ecca3d829", Some(STATUS_KEYS))
            .await
            .unwrap();
        assert_eq!(status.task_status(), TaskStatus::Downloading);
        assert_eq!(status.total_length, 1000);
        assert_eq!(status.completed_length, 500);
        assert_eq!(status.connections, Some(4));

        let snapshot = status.to_transfer("2089b05ecca3d829");
        assert_eq!(snapshot.status, TaskStatus::Downloading);
        assert_eq!(snapshot.total_bytes, Some(1000));
        assert_eq!(snapshot.display_name.as_deref(), Some("Heat.1995.mkv"));
    }

    #[tokio::test]
    async fn test_secret_is_first_param_and_ids_increase() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!("2089b05ecca3d829")))
            .mount(&server)
            .await;

        let client = client(&server, Some("s3cret"));
        let options = DownloadOptions {
            dir: Some("/media/Movies/Heat".into()),
            ..Default::default()
        };
        let handle = client.add_uri("https://example.org/heat.mkv", &options).await.unwrap();
        assert_eq!(handle, "2089b05ecca3d829");
        client.pause(&handle).await.unwrap();

        let bodies = request_bodies(&server).await;
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["jsonrpc"], "2.0");
        assert_eq!(bodies[0]["method"], "aria2.addUri");
        assert_eq!(bodies[0]["params"][0], "token:s3cret");
        assert_eq!(bodies[0]["params"][1], json!(["https://example.org/heat.mkv"]));
        assert_eq!(bodies[0]["params"][2], json!({"dir": "/media/Movies/Heat"}));
        assert_eq!(bodies[1]["method"], "aria2.pause");
        assert_eq!(bodies[1]["params"], json!(["token:s3cret", "2089b05ecca3d829"]));

        let first = bodies[0]["id"].as_u64().unwrap();
        let second = bodies[1]["id"].as_u64().unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_no_secret_means_no_token_param() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!("OK")))
            .mount(&server)
            .await;

        client(&server, None).unpause("abc").await.unwrap();
        let bodies = request_bodies(&server).await;
        assert_eq!(bodies[0]["method"], "aria2.unpause");
        assert_eq!(bodies[0]["params"], json!(["abc"]));
    }

    #[tokio::test]
    async fn test_rpc_error_carries_code_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": 1, "message": "GID 2089b05ecca3d829 is not found"}
            })))
            .mount(&server)
            .await;

        let err = client(&server, None).remove("2089b05ecca3d829").await.unwrap_err();
        match err {
            Error::Rpc { code, message } => {
                assert_eq!(code, 1);
                assert!(message.contains("not found"));
            }
            other => panic!("expected RPC error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_failure_without_rpc_error_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&server)
            .await;

        let err = client(&server, None).global_stats().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_status_timeout_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(rpc_result(json!({"status": "active"})).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let err = client(&server, None)
            .tell_status_with_timeout("abc", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_global_stats() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "aria2.getGlobalStat"})))
            .respond_with(rpc_result(json!({
                "downloadSpeed": "2048",
                "uploadSpeed": "0",
                "numActive": "2",
                "numWaiting": "1",
                "numStopped": "7"
            })))
            .mount(&server)
            .await;

        let stats = client(&server, None).global_stats().await.unwrap();
        assert_eq!(stats.download_speed, 2048);
        assert_eq!(stats.num_active, 2);
        assert_eq!(stats.num_stopped, 7);
    }

    #[tokio::test]
    async fn test_start_seeds_from_first_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "aria2.addUri"})))
            .respond_with(rpc_result(json!("d00d")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "aria2.tellStatus"})))
            .respond_with(rpc_result(json!({
                "status": "waiting",
                "totalLength": "0",
                "completedLength": "0",
                "downloadSpeed": "0",
                "uploadSpeed": "0"
            })))
            .mount(&server)
            .await;

        let request = StartRequest {
            source_uri: "https://example.org/show.mkv".into(),
            display_name: "Show".into(),
            destination: PathBuf::from("/media/TV/Show/Season_01"),
            filename: Some("show.mkv".into()),
            correlation_id: "c1".into(),
        };
        let snapshot = client(&server, None).start(&request).await.unwrap();
        assert_eq!(snapshot.id, "d00d");
        assert_eq!(snapshot.status, TaskStatus::Queued);
        assert_eq!(snapshot.total_bytes, None);

        let bodies = request_bodies(&server).await;
        assert_eq!(
            bodies[0]["params"][1],
            json!({"dir": "/media/TV/Show/Season_01", "out": "show.mkv"})
        );
    }

    #[test]
    fn test_error_snapshot_prefers_daemon_message() {
        let status = StatusSnapshot {
            status: "error".into(),
            error_code: Some("3".into()),
            ..Default::default()
        };
        let snapshot = status.to_transfer("x");
        assert_eq!(snapshot.status, TaskStatus::Error);
        assert_eq!(snapshot.error_message.as_deref(), Some("daemon error code 3"));
    }

    #[test]
    fn test_oversized_connection_count_is_dropped() {
        let status = StatusSnapshot {
            status: "active".into(),
            connections: Some(u64::from(u32::MAX) + 5),
            ..Default::default()
        };
        assert_eq!(status.to_transfer("x").connections, None);

        let status = StatusSnapshot {
            status: "active".into(),
            connections: Some(12),
            ..Default::default()
        };
        assert_eq!(status.to_transfer("x").connections, Some(12));
    }
}
