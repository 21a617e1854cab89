//! etcd-backed store
//!
//! Talks to the etcd v3 JSON gateway (`/v3/kv/*`, `/v3/watch`). Keys and
//! values travel base64-encoded; int64 fields arrive as decimal strings.
//! Per-key revision history is reconstructed by walking the key's
//! create-revision..mod-revision window, which keeps rollback working
//! against any etcd that has not compacted the window away.

use crate::kv::{KvStore, Namespace, WatchEvent, WatchEventKind};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use berth_core::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Client for the etcd v3 JSON gateway
pub struct EtcdStore {
    endpoint: String,
    client: Client,
}

#[derive(Debug, Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    revision: Option<String>,
}

#[derive(Debug, Serialize)]
struct PutRequest {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct DeleteRangeRequest {
    key: String,
}

#[derive(Debug, Deserialize, Default)]
struct KeyValueEntry {
    key: Option<String>,
    value: Option<String>,
    create_revision: Option<String>,
    mod_revision: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValueEntry>,
}

#[derive(Debug, Serialize)]
struct WatchCreateRequest {
    key: String,
    range_end: String,
}

#[derive(Debug, Serialize)]
struct WatchRequest {
    create_request: WatchCreateRequest,
}

#[derive(Debug, Deserialize)]
struct WatchStreamFrame {
    #[serde(default)]
    result: Option<WatchResult>,
}

#[derive(Debug, Deserialize, Default)]
struct WatchResult {
    #[serde(default)]
    events: Vec<WatchStreamEvent>,
}

#[derive(Debug, Deserialize)]
struct WatchStreamEvent {
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    #[serde(default)]
    kv: Option<KeyValueEntry>,
}

fn parse_rev(field: &Option<String>) -> i64 {
    field
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0)
}

fn decode_b64(field: &Option<String>) -> Result<Vec<u8>> {
    match field {
        Some(encoded) => B64
            .decode(encoded)
            .map_err(|e| Error::store(format!("invalid base64 in etcd response: {}", e))),
        None => Ok(Vec::new()),
    }
}

/// `range_end` that covers every key starting with `prefix`
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    for i in (0..end.len()).rev() {
        if end[i] < 0xff {
            end[i] += 1;
            end.truncate(i + 1);
            return end;
        }
    }
    // all 0xff: watch to the end of the keyspace
    vec![0]
}

impl EtcdStore {
    /// Connect to an etcd JSON gateway endpoint and verify it responds
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::store(format!("failed to build etcd client: {}", e)))?;

        let store = Self { endpoint, client };

        // fail fast at boot rather than on the first lifecycle request
        store
            .client
            .post(format!("{}/v3/maintenance/status", store.endpoint))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| Error::store(format!("etcd connect failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::store(format!("etcd status check failed: {}", e)))?;

        info!(endpoint = %store.endpoint, "connected to etcd");
        Ok(store)
    }

    async fn range_at(&self, key: &[u8], revision: Option<i64>) -> Result<RangeResponse> {
        let request = RangeRequest {
            key: B64.encode(key),
            range_end: None,
            revision: revision.map(|r| r.to_string()),
        };
        self.post("/v3/kv/range", &request).await
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp> {
        let response = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .json(request)
            .send()
            .await
            .map_err(|e| Error::store(format!("etcd {} failed: {}", path, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::store(format!(
                "etcd {} returned {}: {}",
                path, status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::store(format!("invalid etcd {} response: {}", path, e)))
    }

    /// Walk a key's revision window and return each historical value in
    /// write order. One entry per write; the index + 1 is the per-key
    /// revision number handed to callers.
    async fn history(&self, full_key: &str) -> Result<Vec<Vec<u8>>> {
        let live = self.range_at(full_key.as_bytes(), None).await?;
        let entry = live
            .kvs
            .first()
            .ok_or_else(|| Error::NotExistInStore(full_key.to_string()))?;

        let create_revision = parse_rev(&entry.create_revision);
        let mod_revision = parse_rev(&entry.mod_revision);

        let mut values = Vec::new();
        for rev in create_revision..=mod_revision {
            let at_rev = self.range_at(full_key.as_bytes(), Some(rev)).await?;
            if let Some(kv) = at_rev.kvs.first() {
                if parse_rev(&kv.mod_revision) == rev {
                    values.push(decode_b64(&kv.value)?);
                }
            }
        }
        debug!(key = full_key, revisions = values.len(), "walked etcd history");
        Ok(values)
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn put(&self, ns: Namespace, key: &str, value: Vec<u8>) -> Result<()> {
        let request = PutRequest {
            key: B64.encode(ns.prefixed(key)),
            value: B64.encode(value),
        };
        let _: serde_json::Value = self.post("/v3/kv/put", &request).await?;
        Ok(())
    }

    async fn get(&self, ns: Namespace, key: &str) -> Result<Vec<u8>> {
        let full = ns.prefixed(key);
        let response = self.range_at(full.as_bytes(), None).await?;
        match response.kvs.first() {
            Some(entry) => decode_b64(&entry.value),
            None => Err(Error::NotExistInStore(full)),
        }
    }

    async fn delete(&self, ns: Namespace, key: &str) -> Result<()> {
        let request = DeleteRangeRequest {
            key: B64.encode(ns.prefixed(key)),
        };
        let _: serde_json::Value = self.post("/v3/kv/deleterange", &request).await?;
        Ok(())
    }

    async fn revision(&self, ns: Namespace, key: &str, n: i64) -> Result<Vec<u8>> {
        let full = ns.prefixed(key);
        let history = self.history(&full).await?;
        if n < 1 || n as usize > history.len() {
            return Err(Error::store(format!(
                "revision {} out of range for key {} ({} revisions)",
                n,
                full,
                history.len()
            )));
        }
        Ok(history[(n - 1) as usize].clone())
    }

    async fn range(&self, ns: Namespace, key: &str) -> Result<Vec<(i64, Vec<u8>)>> {
        let full = ns.prefixed(key);
        let history = self.history(&full).await?;
        Ok(history
            .into_iter()
            .enumerate()
            .map(|(i, value)| ((i + 1) as i64, value))
            .collect())
    }

    async fn list(&self, ns: Namespace) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = format!("{}/", ns.as_str());
        let request = RangeRequest {
            key: B64.encode(prefix.as_bytes()),
            range_end: Some(B64.encode(prefix_end(prefix.as_bytes()))),
            revision: None,
        };
        let response: RangeResponse = self.post("/v3/kv/range", &request).await?;

        let mut live = Vec::with_capacity(response.kvs.len());
        for entry in &response.kvs {
            let key_bytes = decode_b64(&entry.key)?;
            let key = String::from_utf8(key_bytes)
                .map_err(|e| Error::store(format!("non-utf8 key in etcd: {}", e)))?;
            live.push((key[prefix.len()..].to_string(), decode_b64(&entry.value)?));
        }
        Ok(live)
    }

    async fn watch(&self, ns: Namespace) -> Result<mpsc::UnboundedReceiver<WatchEvent>> {
        let prefix = format!("{}/", ns.as_str());
        let request = WatchRequest {
            create_request: WatchCreateRequest {
                key: B64.encode(prefix.as_bytes()),
                range_end: B64.encode(prefix_end(prefix.as_bytes())),
            },
        };

        let response = self
            .client
            .post(format!("{}/v3/watch", self.endpoint))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::store(format!("etcd watch failed: {}", e)))?
            .error_for_status()
            .map_err(|e| Error::store(format!("etcd watch rejected: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "etcd watch stream ended");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);
                // the gateway emits one JSON frame per line
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let frame: WatchStreamFrame = match serde_json::from_slice(&line) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    };
                    let Some(result) = frame.result else { continue };
                    for event in result.events {
                        let Some(kv) = event.kv else { continue };
                        let kind = match event.event_type.as_deref() {
                            Some("DELETE") => WatchEventKind::Delete,
                            _ => WatchEventKind::Put,
                        };
                        let key = decode_b64(&kv.key)
                            .ok()
                            .and_then(|bytes| String::from_utf8(bytes).ok())
                            .unwrap_or_default();
                        let value = decode_b64(&kv.value).unwrap_or_default();
                        if tx.send(WatchEvent { kind, key, value }).is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
