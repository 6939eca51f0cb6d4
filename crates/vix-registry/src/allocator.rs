use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{CasResult, MetaKv, RegistryError};

/// Ids handed out per persisted block. The heartbeat re-extends the persisted
/// high-water mark before the in-memory block drains.
const ALLOC_STEP: i64 = 2000;
const CAS_ATTEMPTS: usize = 16;

/// Monotonic 64-bit id allocator over a single CAS'd registry counter.
///
/// The persisted value is the exclusive high-water mark of every id ever
/// handed out; a restarted allocator resumes past it, so ids are globally
/// unique and strictly increasing for the lifetime of the registry key.
pub struct GlobalIdAllocator {
    kv: Arc<dyn MetaKv>,
    key: String,
    block: Mutex<Block>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Block {
    next: i64,
    limit: i64,
}

impl GlobalIdAllocator {
    pub fn new(kv: Arc<dyn MetaKv>, key: impl Into<String>) -> Self {
        Self {
            kv,
            key: key.into(),
            block: Mutex::new(Block::default()),
        }
    }

    /// Loads (or creates) the persisted high-water mark. Must be called once
    /// before `alloc_one`.
    pub async fn initialize(&self) -> Result<(), RegistryError> {
        let persisted = match self.kv.get(&self.key).await? {
            Some(kv) => parse_counter(&self.key, &kv.value)?,
            None => {
                // Create-once; a racing peer winning the create is fine.
                let _ = self.kv.compare_and_swap(&self.key, 0, "0").await?;
                match self.kv.get(&self.key).await? {
                    Some(kv) => parse_counter(&self.key, &kv.value)?,
                    None => 0,
                }
            }
        };

        let mut block = self.block.lock().await;
        block.next = persisted;
        block.limit = persisted;
        Ok(())
    }

    /// Allocates one id, extending the persisted block when the local one is
    /// spent.
    pub async fn alloc_one(&self) -> Result<i64, RegistryError> {
        let mut block = self.block.lock().await;
        if block.next >= block.limit {
            self.extend(&mut block).await?;
        }
        let id = block.next;
        block.next += 1;
        Ok(id)
    }

    /// Heartbeat: keeps the persisted high-water mark comfortably ahead of
    /// the ids handed out so far, so a crash never re-issues an id.
    pub async fn update_id(&self) -> Result<(), RegistryError> {
        let mut block = self.block.lock().await;
        if block.limit - block.next < ALLOC_STEP / 2 {
            self.extend(&mut block).await?;
        }
        Ok(())
    }

    async fn extend(&self, block: &mut Block) -> Result<(), RegistryError> {
        for _ in 0..CAS_ATTEMPTS {
            let (persisted, revision) = match self.kv.get(&self.key).await? {
                Some(kv) => (parse_counter(&self.key, &kv.value)?, kv.mod_revision),
                None => (0, 0),
            };
            // 0 is the "unassigned" sentinel everywhere; never hand it out.
            let base = persisted.max(block.next).max(1);
            let new_limit = base + ALLOC_STEP;
            match self
                .kv
                .compare_and_swap(&self.key, revision, &new_limit.to_string())
                .await?
            {
                CasResult::Ok { .. } => {
                    block.next = base;
                    block.limit = new_limit;
                    return Ok(());
                }
                CasResult::Conflict { .. } => continue,
            }
        }
        Err(RegistryError::CasExhausted(self.key.clone()))
    }
}

fn parse_counter(key: &str, raw: &str) -> Result<i64, RegistryError> {
    raw.trim().parse().map_err(|_| RegistryError::Corrupt {
        key: key.to_string(),
        reason: format!("not a counter: {raw:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemRegistry;

    #[tokio::test]
    async fn ids_strictly_increase() -> anyhow::Result<()> {
        let kv: Arc<dyn MetaKv> = Arc::new(MemRegistry::new());
        let alloc = GlobalIdAllocator::new(kv, "gid/index_gid");
        alloc.initialize().await?;

        let mut last = -1;
        for _ in 0..(ALLOC_STEP as usize * 2 + 10) {
            let id = alloc.alloc_one().await?;
            assert!(id > last, "id {id} not greater than {last}");
            last = id;
        }
        Ok(())
    }

    #[tokio::test]
    async fn restart_resumes_past_high_water() -> anyhow::Result<()> {
        let kv: Arc<dyn MetaKv> = Arc::new(MemRegistry::new());

        let alloc = GlobalIdAllocator::new(kv.clone(), "gid/index_gid");
        alloc.initialize().await?;
        let mut max_id = 0;
        for _ in 0..10 {
            max_id = alloc.alloc_one().await?;
        }
        drop(alloc);

        let alloc2 = GlobalIdAllocator::new(kv, "gid/index_gid");
        alloc2.initialize().await?;
        let first = alloc2.alloc_one().await?;
        assert!(first > max_id);
        Ok(())
    }

    #[tokio::test]
    async fn heartbeat_extends_before_block_drains() -> anyhow::Result<()> {
        let kv: Arc<dyn MetaKv> = Arc::new(MemRegistry::new());
        let alloc = GlobalIdAllocator::new(kv.clone(), "gid/index_gid");
        alloc.initialize().await?;
        let _ = alloc.alloc_one().await?;

        alloc.update_id().await?;
        let persisted: i64 = kv
            .get("gid/index_gid")
            .await?
            .map(|kv| kv.value.parse())
            .transpose()?
            .unwrap_or(0);
        assert!(persisted >= ALLOC_STEP);
        Ok(())
    }
}
