// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Key-value substrate the ring descriptor is shared through.
//!
//! Production deployments plug in a client for their coordination store; the
//! in-memory implementation serves single binary setups and tests.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use common_util::define_result;
use snafu::{Backtrace, Snafu};

use crate::ring::RingDesc;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to access ring kv store, msg:{}.\nBacktrace:\n{}", msg, backtrace))]
    Access { msg: String, backtrace: Backtrace },
}

define_result!(Error);

/// Update callback for [RingKvStore::cas]: receives the current descriptor
/// (empty when the key is unset) and returns the descriptor to write, or
/// `None` to leave the key untouched.
pub type CasFn<'a> = &'a mut (dyn FnMut(RingDesc) -> Option<RingDesc> + Send);

/// Contract of the coordination store backing the ring.
#[async_trait]
pub trait RingKvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<RingDesc>>;

    /// Atomically read-modify-write the descriptor under `key`.
    async fn cas(&self, key: &str, f: CasFn<'_>) -> Result<()>;
}

pub type RingKvStoreRef = std::sync::Arc<dyn RingKvStore>;

/// In-memory ring kv store.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, RingDesc>>,
}

#[async_trait]
impl RingKvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<RingDesc>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).cloned())
    }

    async fn cas(&self, key: &str, f: CasFn<'_>) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let current = entries.get(key).cloned().unwrap_or_default();
        if let Some(updated) = f(current) {
            entries.insert(key.to_string(), updated);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{InstanceDesc, InstanceState};

    #[tokio::test]
    async fn test_memory_kv_cas() {
        let kv = MemoryKvStore::default();
        assert!(kv.get("ring").await.unwrap().is_none());

        kv.cas("ring", &mut |mut desc| {
            desc.instances.insert(
                "a".to_string(),
                InstanceDesc {
                    addr: "10.0.0.1".to_string(),
                    tokens: vec![7],
                    state: InstanceState::Joining,
                    heartbeat_ts: 0,
                },
            );
            Some(desc)
        })
        .await
        .unwrap();

        let desc = kv.get("ring").await.unwrap().unwrap();
        assert_eq!(1, desc.instances.len());

        // Returning None leaves the stored value untouched.
        kv.cas("ring", &mut |_| None).await.unwrap();
        assert_eq!(desc, kv.get("ring").await.unwrap().unwrap());
    }
}
