use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    session_key, session_prefix, CasResult, KeyValue, MetaKv, RegistryError, Session,
    SessionGuard, SessionHandle, WatchEvent, WatchStream,
};

/// Process-local registry with the same revision/CAS/watch semantics as the
/// real store. Used by tests and `mem://` single-process runs.
#[derive(Clone, Default)]
pub struct MemRegistry {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    revision: i64,
    kv: BTreeMap<String, Stored>,
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
}

struct Stored {
    value: String,
    mod_revision: i64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Inner {
    fn emit(&mut self, event: WatchEvent) {
        self.watchers
            .retain(|w| !event.key().starts_with(w.prefix.as_str()) || w.tx.send(event.clone()).is_ok());
        self.history.push(event);
    }

    fn put(&mut self, key: &str, value: &str) -> i64 {
        self.revision += 1;
        let revision = self.revision;
        self.kv.insert(
            key.to_string(),
            Stored {
                value: value.to_string(),
                mod_revision: revision,
            },
        );
        self.emit(WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            mod_revision: revision,
        }));
        revision
    }

    fn delete(&mut self, key: &str) -> bool {
        if self.kv.remove(key).is_none() {
            return false;
        }
        self.revision += 1;
        let revision = self.revision;
        self.emit(WatchEvent::Delete {
            key: key.to_string(),
            revision,
        });
        true
    }
}

impl MemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MetaKv for MemRegistry {
    async fn load_with_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, RegistryError> {
        let inner = self.lock();
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, s)| KeyValue {
                key: k.clone(),
                value: s.value.clone(),
                mod_revision: s.mod_revision,
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>, RegistryError> {
        let inner = self.lock();
        Ok(inner.kv.get(key).map(|s| KeyValue {
            key: key.to_string(),
            value: s.value.clone(),
            mod_revision: s.mod_revision,
        }))
    }

    async fn put(&self, key: &str, value: &str) -> Result<i64, RegistryError> {
        Ok(self.lock().put(key, value))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: i64,
        value: &str,
    ) -> Result<CasResult, RegistryError> {
        let mut inner = self.lock();
        let actual = inner.kv.get(key).map(|s| s.mod_revision).unwrap_or(0);
        if actual != expected_revision {
            return Ok(CasResult::Conflict { actual });
        }
        let revision = inner.put(key, value);
        Ok(CasResult::Ok { revision })
    }

    async fn delete(&self, key: &str) -> Result<bool, RegistryError> {
        Ok(self.lock().delete(key))
    }

    async fn remove_with_prefix(&self, prefix: &str) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let keys: Vec<String> = inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            inner.delete(&key);
        }
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<WatchStream, RegistryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        for event in &inner.history {
            if event.revision() > start_revision && event.key().starts_with(prefix) {
                let _ = tx.send(event.clone());
            }
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn register_session(
        &self,
        role: &str,
        session: &Session,
    ) -> Result<SessionGuard, RegistryError> {
        let key = session_key(role, session.server_id);
        let value = serde_json::to_string(session).map_err(|e| RegistryError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.lock().put(&key, &value);
        Ok(Box::new(MemSessionGuard {
            inner: self.inner.clone(),
            key,
        }))
    }

    async fn list_sessions(&self, role: &str) -> Result<(Vec<Session>, i64), RegistryError> {
        let prefix = session_prefix(role);
        let inner = self.lock();
        let revision = inner.revision;
        let mut sessions = Vec::new();
        for (key, stored) in inner
            .kv
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(prefix.as_str()))
        {
            let session: Session =
                serde_json::from_str(&stored.value).map_err(|e| RegistryError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            sessions.push(session);
        }
        Ok((sessions, revision))
    }

    async fn current_revision(&self) -> Result<i64, RegistryError> {
        Ok(self.lock().revision)
    }
}

struct MemSessionGuard {
    inner: Arc<Mutex<Inner>>,
    key: String,
}

impl SessionHandle for MemSessionGuard {}

impl Drop for MemSessionGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.delete(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_creates_only_when_absent() -> anyhow::Result<()> {
        let kv = MemRegistry::new();

        let created = kv.compare_and_swap("a", 0, "v1").await?;
        assert!(created.is_ok());

        // Second create must conflict with the actual revision.
        match kv.compare_and_swap("a", 0, "v2").await? {
            CasResult::Conflict { actual } => assert!(actual > 0),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(kv.get("a").await?.map(|k| k.value), Some("v1".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn cas_swaps_on_matching_revision() -> anyhow::Result<()> {
        let kv = MemRegistry::new();
        let rev = kv.put("a", "v1").await?;

        assert!(kv.compare_and_swap("a", rev, "v2").await?.is_ok());
        // Stale revision is rejected.
        assert!(!kv.compare_and_swap("a", rev, "v3").await?.is_ok());
        assert_eq!(kv.get("a").await?.map(|k| k.value), Some("v2".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn watch_replays_from_start_revision() -> anyhow::Result<()> {
        let kv = MemRegistry::new();
        let first = kv.put("indexes/1", "a").await?;
        kv.put("indexes/2", "b").await?;
        kv.put("other/3", "c").await?;

        let mut watch = kv.watch_prefix("indexes/", first).await?;
        match watch.try_recv() {
            Ok(WatchEvent::Put(kv)) => assert_eq!(kv.key, "indexes/2"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(watch.try_recv().is_err());

        kv.delete("indexes/2").await?;
        match watch.try_recv() {
            Ok(WatchEvent::Delete { key, .. }) => assert_eq!(key, "indexes/2"),
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn remove_with_prefix_is_exact_on_strings() -> anyhow::Result<()> {
        let kv = MemRegistry::new();
        kv.put("1/1/a", "x").await?;
        kv.put("1/2/b", "y").await?;
        kv.put("12/1/c", "z").await?;

        kv.remove_with_prefix("1/").await?;
        assert!(kv.get("1/1/a").await?.is_none());
        assert!(kv.get("1/2/b").await?.is_none());
        assert!(kv.get("12/1/c").await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_session_fires_delete_event() -> anyhow::Result<()> {
        let kv = MemRegistry::new();
        let (sessions, revision) = kv.list_sessions("vixd-node").await?;
        assert!(sessions.is_empty());

        let mut watch = kv.watch_prefix(&session_prefix("vixd-node"), revision).await?;
        let guard = kv
            .register_session(
                "vixd-node",
                &Session {
                    server_id: 9,
                    address: "127.0.0.1:4000".to_string(),
                },
            )
            .await?;

        let (sessions, _) = kv.list_sessions("vixd-node").await?;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].server_id, 9);
        match watch.try_recv() {
            Ok(WatchEvent::Put(kv)) => assert_eq!(kv.key, session_key("vixd-node", 9)),
            other => panic!("unexpected event {other:?}"),
        }

        drop(guard);
        match watch.try_recv() {
            Ok(WatchEvent::Delete { key, .. }) => assert_eq!(key, session_key("vixd-node", 9)),
            other => panic!("unexpected event {other:?}"),
        }
        let (sessions, _) = kv.list_sessions("vixd-node").await?;
        assert!(sessions.is_empty());
        Ok(())
    }
}
