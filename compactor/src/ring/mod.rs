// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Hash ring membership used to elect the compactor leader.
//!
//! Every replica publishes exactly one token into a shared ring descriptor.
//! The replica owning the token range that contains [RING_KEY_OF_LEADER] is
//! the leader. During handover there may briefly be zero or two leaders; all
//! work driven from leadership is idempotent so this is tolerated.

pub mod kv;
pub mod lifecycler;

use std::{collections::BTreeMap, time::Duration};

use common_util::{
    define_result,
    time::{ClockRef, Timestamp},
};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};

use crate::ring::kv::RingKvStoreRef;

/// Key under which the compactor ring descriptor is stored.
pub const RING_KEY: &str = "compactor";

/// One token per instance is all leader election needs.
pub const RING_NUM_TOKENS: usize = 1;

/// A single owner per key range.
pub const RING_REPLICATION_FACTOR: usize = 1;

/// Arbitrary fixed key: whoever owns it runs the compactor.
pub const RING_KEY_OF_LEADER: u32 = 0;

/// Heartbeat timeouts after which an unhealthy instance is removed from the
/// ring automatically.
pub const RING_AUTO_FORGET_UNHEALTHY_PERIODS: u32 = 10;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to access ring kv, err:{}", source))]
    Kv { source: kv::Error },

    #[snafu(display(
        "Timed out waiting for instance state, instance:{}, state:{:?}.\nBacktrace:\n{}",
        instance_id,
        state,
        backtrace
    ))]
    WaitStateTimeout {
        instance_id: String,
        state: InstanceState,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to persist ring tokens, path:{}, err:{}", path, source))]
    PersistTokens {
        path: String,
        source: std::io::Error,
    },
}

define_result!(Error);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Joining,
    Active,
    Leaving,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstanceDesc {
    pub addr: String,
    pub tokens: Vec<u32>,
    pub state: InstanceState,
    /// Unix millis of the last heartbeat.
    pub heartbeat_ts: i64,
}

impl InstanceDesc {
    pub fn is_healthy(&self, heartbeat_timeout: Duration, now: Timestamp) -> bool {
        now.millis_since(Timestamp::new(self.heartbeat_ts)) <= heartbeat_timeout.as_millis() as u64
    }
}

/// The shared ring state. Serialized as JSON into the kv substrate.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RingDesc {
    pub instances: BTreeMap<String, InstanceDesc>,
}

impl RingDesc {
    /// All tokens taken by any instance.
    pub fn taken_tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self
            .instances
            .values()
            .flat_map(|i| i.tokens.iter().copied())
            .collect();
        tokens.sort_unstable();
        tokens
    }

    /// The healthy ACTIVE instance owning `key`: the instance holding the
    /// first token greater than `key`, wrapping around to the smallest token.
    pub fn lookup_owner(
        &self,
        key: u32,
        heartbeat_timeout: Duration,
        now: Timestamp,
    ) -> Option<(&str, &InstanceDesc)> {
        let mut tokens: Vec<(u32, &str)> = self
            .instances
            .iter()
            .filter(|(_, desc)| {
                desc.state == InstanceState::Active && desc.is_healthy(heartbeat_timeout, now)
            })
            .flat_map(|(id, desc)| desc.tokens.iter().map(move |t| (*t, id.as_str())))
            .collect();
        if tokens.is_empty() {
            return None;
        }
        tokens.sort_unstable();

        let (_, owner) = tokens
            .iter()
            .find(|(token, _)| *token > key)
            .unwrap_or(&tokens[0]);
        self.instances
            .get_key_value(*owner)
            .map(|(id, desc)| (id.as_str(), desc))
    }

    /// Drop instances whose heartbeat is older than `forget_period`. Returns
    /// the removed instance ids.
    pub fn prune_stale(&mut self, forget_period: Duration, now: Timestamp) -> Vec<String> {
        let stale: Vec<String> = self
            .instances
            .iter()
            .filter(|(_, desc)| !desc.is_healthy(forget_period, now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.instances.remove(id);
        }
        stale
    }
}

/// Read view of the ring.
#[derive(Clone)]
pub struct Ring {
    kv: RingKvStoreRef,
    ring_key: String,
    heartbeat_timeout: Duration,
    clock: ClockRef,
}

impl Ring {
    pub fn new(kv: RingKvStoreRef, heartbeat_timeout: Duration, clock: ClockRef) -> Self {
        Self {
            kv,
            ring_key: RING_KEY.to_string(),
            heartbeat_timeout,
            clock,
        }
    }

    pub async fn desc(&self) -> Result<RingDesc> {
        Ok(self
            .kv
            .get(&self.ring_key)
            .await
            .map_err(|source| Error::Kv { source })?
            .unwrap_or_default())
    }

    /// Address of the current leader, if the ring has a healthy owner for the
    /// leader key.
    pub async fn leader_addr(&self) -> Result<Option<String>> {
        let desc = self.desc().await?;
        Ok(desc
            .lookup_owner(RING_KEY_OF_LEADER, self.heartbeat_timeout, self.clock.now())
            .map(|(_, instance)| instance.addr.clone()))
    }

    /// Poll until the ring view reports `instance_id` in `state`.
    pub async fn wait_instance_state(
        &self,
        instance_id: &str,
        state: InstanceState,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let desc = self.desc().await?;
            if desc
                .instances
                .get(instance_id)
                .map(|i| i.state == state)
                .unwrap_or(false)
            {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return WaitStateTimeout { instance_id, state }.fail();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
