// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Ring lifecycle of one compactor instance.
//!
//! Registration publishes the instance as JOINING with its token; the caller
//! flips it to ACTIVE once the local view has caught up. A background task
//! refreshes the heartbeat and gives every delegate a chance to observe it.
//!
//! Delegates chain like middlewares, declared in reverse call order:
//! auto-forget -> tokens persistence -> leave on stop -> base.

use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use common_util::time::{ClockRef, Timestamp};
use log::{info, warn};
use rand::Rng;
use snafu::ResultExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ring::{
    kv::RingKvStoreRef, InstanceDesc, InstanceState, PersistTokens, Result, RingDesc,
};

/// Observer hooks around ring lifecycle events. Implementations wrap the next
/// delegate in the chain and may rewrite the ring state they are handed.
pub trait LifecyclerDelegate: Send + Sync {
    /// Decide the registration state and tokens of this instance.
    /// `existing` carries the descriptor left over from a previous life, if
    /// the instance is already known to the ring.
    fn on_register(
        &self,
        ring: &RingDesc,
        existing: Option<&InstanceDesc>,
    ) -> (InstanceState, Vec<u32>);

    /// The instance's tokens became known.
    fn on_tokens(&self, tokens: &[u32]);

    /// A heartbeat is being written; `ring` may be rewritten.
    fn on_heartbeat(&self, ring: &mut RingDesc, now: Timestamp);

    /// The instance is shutting down; `ring` may be rewritten.
    fn on_stopping(&self, ring: &mut RingDesc, instance_id: &str);
}

/// End of the chain: keep existing tokens, otherwise generate fresh random
/// ones avoiding collisions, and always (re)join as JOINING.
pub struct RandomTokenDelegate {
    pub num_tokens: usize,
}

impl LifecyclerDelegate for RandomTokenDelegate {
    fn on_register(
        &self,
        ring: &RingDesc,
        existing: Option<&InstanceDesc>,
    ) -> (InstanceState, Vec<u32>) {
        let mut tokens = existing.map(|i| i.tokens.clone()).unwrap_or_default();
        let taken = ring.taken_tokens();
        let mut rng = rand::thread_rng();
        while tokens.len() < self.num_tokens {
            let candidate: u32 = rng.gen_range(1..=u32::MAX);
            if !taken.contains(&candidate) && !tokens.contains(&candidate) {
                tokens.push(candidate);
            }
        }
        tokens.sort_unstable();

        (InstanceState::Joining, tokens)
    }

    fn on_tokens(&self, _tokens: &[u32]) {}

    fn on_heartbeat(&self, _ring: &mut RingDesc, _now: Timestamp) {}

    fn on_stopping(&self, _ring: &mut RingDesc, _instance_id: &str) {}
}

/// Loads tokens from a file on register and saves them whenever they change,
/// so restarts keep their ring position.
pub struct TokensPersistencyDelegate {
    pub path: PathBuf,
    pub next: Box<dyn LifecyclerDelegate>,
}

impl TokensPersistencyDelegate {
    fn load_tokens(&self) -> Option<Vec<u32>> {
        let data = fs::read(&self.path).ok()?;
        match serde_json::from_slice::<Vec<u32>>(&data) {
            Ok(tokens) if !tokens.is_empty() => Some(tokens),
            _ => {
                warn!(
                    "Ignoring unreadable tokens file, path:{}",
                    self.path.display()
                );
                None
            }
        }
    }

    fn save_tokens(&self, tokens: &[u32]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context(PersistTokens {
                path: self.path.display().to_string(),
            })?;
        }
        let data = serde_json::to_vec(tokens).expect("tokens serialize");
        fs::write(&self.path, data).context(PersistTokens {
            path: self.path.display().to_string(),
        })
    }
}

impl LifecyclerDelegate for TokensPersistencyDelegate {
    fn on_register(
        &self,
        ring: &RingDesc,
        existing: Option<&InstanceDesc>,
    ) -> (InstanceState, Vec<u32>) {
        if existing.is_none() {
            if let Some(tokens) = self.load_tokens() {
                info!(
                    "Loaded ring tokens from file, path:{}, tokens:{}",
                    self.path.display(),
                    tokens.len()
                );
                return (InstanceState::Joining, tokens);
            }
        }
        self.next.on_register(ring, existing)
    }

    fn on_tokens(&self, tokens: &[u32]) {
        if let Err(e) = self.save_tokens(tokens) {
            warn!("Failed to persist ring tokens, err:{}", e);
        }
        self.next.on_tokens(tokens);
    }

    fn on_heartbeat(&self, ring: &mut RingDesc, now: Timestamp) {
        self.next.on_heartbeat(ring, now);
    }

    fn on_stopping(&self, ring: &mut RingDesc, instance_id: &str) {
        self.next.on_stopping(ring, instance_id);
    }
}

/// Removes instances whose heartbeat went stale for `forget_period`.
pub struct AutoForgetDelegate {
    pub forget_period: Duration,
    pub next: Box<dyn LifecyclerDelegate>,
}

impl LifecyclerDelegate for AutoForgetDelegate {
    fn on_register(
        &self,
        ring: &RingDesc,
        existing: Option<&InstanceDesc>,
    ) -> (InstanceState, Vec<u32>) {
        self.next.on_register(ring, existing)
    }

    fn on_tokens(&self, tokens: &[u32]) {
        self.next.on_tokens(tokens);
    }

    fn on_heartbeat(&self, ring: &mut RingDesc, now: Timestamp) {
        for id in ring.prune_stale(self.forget_period, now) {
            warn!("Auto-forgot unhealthy ring instance, instance:{}", id);
        }
        self.next.on_heartbeat(ring, now);
    }

    fn on_stopping(&self, ring: &mut RingDesc, instance_id: &str) {
        self.next.on_stopping(ring, instance_id);
    }
}

/// Unregisters the instance when it stops, so followers take over quickly.
pub struct LeaveOnStoppingDelegate {
    pub next: Box<dyn LifecyclerDelegate>,
}

impl LifecyclerDelegate for LeaveOnStoppingDelegate {
    fn on_register(
        &self,
        ring: &RingDesc,
        existing: Option<&InstanceDesc>,
    ) -> (InstanceState, Vec<u32>) {
        self.next.on_register(ring, existing)
    }

    fn on_tokens(&self, tokens: &[u32]) {
        self.next.on_tokens(tokens);
    }

    fn on_heartbeat(&self, ring: &mut RingDesc, now: Timestamp) {
        self.next.on_heartbeat(ring, now);
    }

    fn on_stopping(&self, ring: &mut RingDesc, instance_id: &str) {
        ring.instances.remove(instance_id);
        self.next.on_stopping(ring, instance_id);
    }
}

/// Manages this instance's entry in the ring descriptor.
pub struct Lifecycler {
    kv: RingKvStoreRef,
    ring_key: String,
    instance_id: String,
    instance_addr: String,
    heartbeat_period: Duration,
    delegate: Box<dyn LifecyclerDelegate>,
    clock: ClockRef,
}

impl Lifecycler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: RingKvStoreRef,
        ring_key: &str,
        instance_id: &str,
        instance_addr: &str,
        heartbeat_period: Duration,
        heartbeat_timeout: Duration,
        num_tokens: usize,
        tokens_file_path: Option<PathBuf>,
        clock: ClockRef,
    ) -> Self {
        // Delegates are declared last-to-first: each wraps the next one.
        let mut delegate: Box<dyn LifecyclerDelegate> = Box::new(RandomTokenDelegate { num_tokens });
        delegate = Box::new(LeaveOnStoppingDelegate { next: delegate });
        if let Some(path) = tokens_file_path {
            delegate = Box::new(TokensPersistencyDelegate {
                path,
                next: delegate,
            });
        }
        delegate = Box::new(AutoForgetDelegate {
            forget_period: heartbeat_timeout
                * super::RING_AUTO_FORGET_UNHEALTHY_PERIODS,
            next: delegate,
        });

        Self {
            kv,
            ring_key: ring_key.to_string(),
            instance_id: instance_id.to_string(),
            instance_addr: instance_addr.to_string(),
            heartbeat_period,
            delegate,
            clock,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn instance_addr(&self) -> &str {
        &self.instance_addr
    }

    /// Publish this instance into the ring, JOINING. Returns its tokens.
    pub async fn register(&self) -> Result<Vec<u32>> {
        let now = self.clock.now();
        let mut registered_tokens = Vec::new();
        self.kv
            .cas(&self.ring_key, &mut |mut ring| {
                let existing = ring.instances.get(&self.instance_id).cloned();
                let (state, tokens) = self.delegate.on_register(&ring, existing.as_ref());
                registered_tokens = tokens.clone();
                ring.instances.insert(
                    self.instance_id.clone(),
                    InstanceDesc {
                        addr: self.instance_addr.clone(),
                        tokens,
                        state,
                        heartbeat_ts: now.as_i64(),
                    },
                );
                Some(ring)
            })
            .await
            .map_err(|source| super::Error::Kv { source })?;

        self.delegate.on_tokens(&registered_tokens);
        info!(
            "Registered compactor in the ring, instance:{}, tokens:{:?}",
            self.instance_id, registered_tokens
        );
        Ok(registered_tokens)
    }

    /// Flip this instance to `state`.
    pub async fn change_state(&self, state: InstanceState) -> Result<()> {
        let now = self.clock.now();
        self.kv
            .cas(&self.ring_key, &mut |mut ring| {
                match ring.instances.get_mut(&self.instance_id) {
                    Some(instance) => {
                        instance.state = state;
                        instance.heartbeat_ts = now.as_i64();
                        Some(ring)
                    }
                    None => None,
                }
            })
            .await
            .map_err(|source| super::Error::Kv { source })
    }

    /// Heartbeat until cancelled, then leave the ring.
    pub fn spawn_heartbeat_loop(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let lifecycler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(lifecycler.heartbeat_period) => {
                        if let Err(e) = lifecycler.heartbeat().await {
                            warn!("Ring heartbeat failed, will retry, err:{}", e);
                        }
                    }
                }
            }

            if let Err(e) = lifecycler.unregister().await {
                warn!("Failed to leave the ring on shutdown, err:{}", e);
            }
        })
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let now = self.clock.now();
        self.kv
            .cas(&self.ring_key, &mut |mut ring| {
                if let Some(instance) = ring.instances.get_mut(&self.instance_id) {
                    instance.heartbeat_ts = now.as_i64();
                }
                self.delegate.on_heartbeat(&mut ring, now);
                Some(ring)
            })
            .await
            .map_err(|source| super::Error::Kv { source })
    }

    pub async fn unregister(&self) -> Result<()> {
        self.kv
            .cas(&self.ring_key, &mut |mut ring| {
                self.delegate.on_stopping(&mut ring, &self.instance_id);
                Some(ring)
            })
            .await
            .map_err(|source| super::Error::Kv { source })?;
        info!("Left the ring, instance:{}", self.instance_id);
        Ok(())
    }
}
