//! Maskable cancellation and abort-by-name.
//!
//! A [`MaskableToken`] wraps a `CancellationToken` with a mask counter: a cancel
//! requested while at least one [`MaskGuard`] is alive is held pending and
//! delivered the moment the last guard drops.
//!
//! [`AbortRegistry`] maps worker names to tokens so an unrelated caller (for
//! example a network collaborator) can interrupt a blocking call by naming the
//! worker that owns it.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace};

use crate::lock::lock;

#[derive(Default)]
struct MaskState {
    depth: usize,
    pending: bool,
}

#[derive(Clone, Default)]
pub struct MaskableToken {
    token: CancellationToken,
    state: Arc<Mutex<MaskState>>,
}

impl MaskableToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    ///
    /// Returns `true` if delivered now, `false` if deferred by a mask (or
    /// already delivered).
    pub fn cancel(&self) -> bool {
        let mut state = lock(&self.state);
        if self.token.is_cancelled() {
            return false;
        }
        if state.depth > 0 {
            state.pending = true;
            trace!(target: "runq.core.cancel", "cancel deferred by mask");
            return false;
        }
        self.token.cancel();
        true
    }

    /// Defer cancellation until the returned guard (and every other live guard) drops.
    pub fn mask(&self) -> MaskGuard {
        lock(&self.state).depth += 1;
        MaskGuard {
            token: self.clone(),
        }
    }

    /// `true` once cancellation has been delivered.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// `true` while a cancel waits for the mask to lift.
    pub fn is_pending(&self) -> bool {
        lock(&self.state).pending
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn same(&self, other: &MaskableToken) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl std::fmt::Debug for MaskableToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskableToken")
            .field("cancelled", &self.is_cancelled())
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[must_use = "the mask lifts as soon as the guard is dropped"]
pub struct MaskGuard {
    token: MaskableToken,
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.token.state);
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 && state.pending {
            state.pending = false;
            self.token.token.cancel();
            trace!(target: "runq.core.cancel", "deferred cancel delivered");
        }
    }
}

#[derive(Clone, Default)]
pub struct AbortRegistry {
    inner: Arc<Mutex<HashMap<String, MaskableToken>>>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `token` under `name` until the guard drops.
    pub fn register(&self, name: impl Into<String>, token: MaskableToken) -> AbortGuard {
        let name = name.into();
        if lock(&self.inner)
            .insert(name.clone(), token.clone())
            .is_some()
        {
            debug!(target: "runq.core.abort", %name, "abort name reused; previous owner replaced");
        }
        AbortGuard {
            registry: self.clone(),
            name,
            token,
        }
    }

    /// Interrupt the worker registered as `name`.
    pub fn abort(&self, name: &str) -> bool {
        let token = lock(&self.inner).get(name).cloned();
        match token {
            Some(token) => {
                debug!(target: "runq.core.abort", %name, "abort requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Interrupt every registered worker; returns how many were signalled.
    pub fn abort_all(&self) -> usize {
        let tokens: Vec<MaskableToken> = lock(&self.inner).values().cloned().collect();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner).keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct AbortGuard {
    registry: AbortRegistry,
    name: String,
    token: MaskableToken,
}

impl AbortGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        let mut map = lock(&self.registry.inner);
        // Only remove our own entry; a later owner of the same name stays.
        if map.get(&self.name).is_some_and(|t| t.same(&self.token)) {
            map.remove(&self.name);
        }
    }
}
