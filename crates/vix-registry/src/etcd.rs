use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    TxnOpResponse, WatchOptions,
};
use tokio::sync::mpsc;

use crate::{
    session_key, session_prefix, CasResult, KeyValue, MetaKv, RegistryError, Session,
    SessionGuard, SessionHandle, WatchEvent, WatchStream,
};

const SESSION_TTL_SECS: i64 = 10;

/// Registry backed by etcd. All keys live under a root path; CAS maps to a
/// txn on `mod_revision`, sessions to lease-attached keys with a keepalive
/// task.
pub struct EtcdRegistry {
    client: Client,
    root: String,
}

fn map_err(err: etcd_client::Error) -> RegistryError {
    RegistryError::Unavailable(err.to_string())
}

impl EtcdRegistry {
    /// `rest` is an `etcd://` URL with the scheme stripped:
    /// `host:port,host:port/root/path`.
    pub async fn connect_from_url(rest: &str) -> Result<Self, RegistryError> {
        let trimmed = rest.trim().trim_start_matches('/');
        let (endpoints_raw, root) = match trimmed.split_once('/') {
            Some((eps, root)) => (eps, root.trim_matches('/').to_string()),
            None => (trimmed, String::new()),
        };
        let endpoints: Vec<&str> = endpoints_raw
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(RegistryError::UnsupportedRoot(format!("etcd://{rest}")));
        }

        let client = Client::connect(&endpoints, None).await.map_err(map_err)?;
        Ok(Self { client, root })
    }

    pub fn new(client: Client, root: impl Into<String>) -> Self {
        Self {
            client,
            root: root.into(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.root)
        }
    }

    fn strip_key(&self, full: &str) -> String {
        if self.root.is_empty() {
            return full.to_string();
        }
        full.strip_prefix(&format!("{}/", self.root))
            .unwrap_or(full)
            .to_string()
    }
}

#[async_trait]
impl MetaKv for EtcdRegistry {
    async fn load_with_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.full_key(prefix), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_err)?;

        let mut out = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            out.push(KeyValue {
                key: self.strip_key(kv.key_str().map_err(map_err)?),
                value: kv.value_str().map_err(map_err)?.to_string(),
                mod_revision: kv.mod_revision(),
            });
        }
        Ok(out)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RegistryError> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.full_key(key), None)
            .await
            .map_err(map_err)?;
        let Some(kv) = resp.kvs().first() else {
            return Ok(None);
        };
        Ok(Some(KeyValue {
            key: key.to_string(),
            value: kv.value_str().map_err(map_err)?.to_string(),
            mod_revision: kv.mod_revision(),
        }))
    }

    async fn put(&self, key: &str, value: &str) -> Result<i64, RegistryError> {
        let mut client = self.client.clone();
        let resp = client
            .put(self.full_key(key), value, None)
            .await
            .map_err(map_err)?;
        let revision = resp
            .header()
            .map(|h| h.revision())
            .ok_or_else(|| RegistryError::Unavailable("put response missing header".to_string()))?;
        Ok(revision)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: i64,
        value: &str,
    ) -> Result<CasResult, RegistryError> {
        let full = self.full_key(key);
        let cmp = if expected_revision == 0 {
            Compare::create_revision(full.as_str(), CompareOp::Equal, 0)
        } else {
            Compare::mod_revision(full.as_str(), CompareOp::Equal, expected_revision)
        };
        let txn = Txn::new()
            .when([cmp])
            .and_then([TxnOp::put(full.as_str(), value, None)])
            .or_else([TxnOp::get(full.as_str(), None)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await.map_err(map_err)?;
        if resp.succeeded() {
            let revision = resp.header().map(|h| h.revision()).ok_or_else(|| {
                RegistryError::Unavailable("txn response missing header".to_string())
            })?;
            return Ok(CasResult::Ok { revision });
        }

        let actual = match resp.op_responses().into_iter().next() {
            Some(TxnOpResponse::Get(get)) => {
                get.kvs().first().map(|kv| kv.mod_revision()).unwrap_or(0)
            }
            _ => 0,
        };
        Ok(CasResult::Conflict { actual })
    }

    async fn delete(&self, key: &str) -> Result<bool, RegistryError> {
        let mut client = self.client.clone();
        let resp = client
            .delete(self.full_key(key), None)
            .await
            .map_err(map_err)?;
        Ok(resp.deleted() > 0)
    }

    async fn remove_with_prefix(&self, prefix: &str) -> Result<(), RegistryError> {
        let mut client = self.client.clone();
        client
            .delete(
                self.full_key(prefix),
                Some(DeleteOptions::new().with_prefix()),
            )
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<WatchStream, RegistryError> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(
                self.full_key(prefix),
                Some(
                    WatchOptions::new()
                        .with_prefix()
                        .with_start_revision(start_revision + 1),
                ),
            )
            .await
            .map_err(map_err)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let root = self.root.clone();
        tokio::spawn(async move {
            // Keep the watcher alive for the lifetime of the stream.
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "registry watch stream failed");
                        break;
                    }
                };
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let key = match kv.key_str() {
                        Ok(k) => strip_root(&root, k),
                        Err(err) => {
                            tracing::warn!(error = %err, "registry watch event key not utf-8");
                            continue;
                        }
                    };
                    let translated = match event.event_type() {
                        EventType::Put => match kv.value_str() {
                            Ok(v) => WatchEvent::Put(KeyValue {
                                key,
                                value: v.to_string(),
                                mod_revision: kv.mod_revision(),
                            }),
                            Err(err) => {
                                tracing::warn!(error = %err, "registry watch event value not utf-8");
                                continue;
                            }
                        },
                        EventType::Delete => WatchEvent::Delete {
                            key,
                            revision: kv.mod_revision(),
                        },
                    };
                    if tx.send(translated).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn register_session(
        &self,
        role: &str,
        session: &Session,
    ) -> Result<SessionGuard, RegistryError> {
        let key = self.full_key(&session_key(role, session.server_id));
        let value = serde_json::to_string(session).map_err(|e| RegistryError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;

        let mut client = self.client.clone();
        let lease = client
            .lease_grant(SESSION_TTL_SECS, None)
            .await
            .map_err(map_err)?;
        let lease_id = lease.id();
        client
            .put(
                key.as_str(),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await
            .map_err(map_err)?;

        let (mut keeper, mut responses) = client
            .lease_keep_alive(lease_id)
            .await
            .map_err(map_err)?;
        let keepalive = tokio::spawn(async move {
            let interval = Duration::from_secs((SESSION_TTL_SECS as u64 / 3).max(1));
            loop {
                if let Err(err) = keeper.keep_alive().await {
                    tracing::warn!(error = %err, "session keepalive failed");
                    break;
                }
                match responses.message().await {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "session keepalive stream failed");
                        break;
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        Ok(Box::new(EtcdSessionGuard {
            client: self.client.clone(),
            lease_id,
            keepalive,
        }))
    }

    async fn list_sessions(&self, role: &str) -> Result<(Vec<Session>, i64), RegistryError> {
        let prefix = session_prefix(role);
        let mut client = self.client.clone();
        let resp = client
            .get(self.full_key(&prefix), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_err)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

        let mut sessions = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let raw = kv.value_str().map_err(map_err)?;
            let session: Session =
                serde_json::from_str(raw).map_err(|e| RegistryError::Corrupt {
                    key: self.strip_key(kv.key_str().unwrap_or_default()),
                    reason: e.to_string(),
                })?;
            sessions.push(session);
        }
        Ok((sessions, revision))
    }

    async fn current_revision(&self) -> Result<i64, RegistryError> {
        let mut client = self.client.clone();
        let resp = client
            .get(
                self.full_key(""),
                Some(GetOptions::new().with_prefix().with_count_only()),
            )
            .await
            .map_err(map_err)?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
    }
}

fn strip_root(root: &str, full: &str) -> String {
    if root.is_empty() {
        return full.to_string();
    }
    full.strip_prefix(&format!("{root}/"))
        .unwrap_or(full)
        .to_string()
}

struct EtcdSessionGuard {
    client: Client,
    lease_id: i64,
    keepalive: tokio::task::JoinHandle<()>,
}

impl SessionHandle for EtcdSessionGuard {}

impl Drop for EtcdSessionGuard {
    fn drop(&mut self) {
        self.keepalive.abort();
        // Revoke eagerly so watchers see the delete without waiting out the
        // lease TTL. Best effort; the lease expires on its own otherwise.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let mut client = self.client.clone();
            let lease_id = self.lease_id;
            handle.spawn(async move {
                let _ = client.lease_revoke(lease_id).await;
            });
        }
    }
}
