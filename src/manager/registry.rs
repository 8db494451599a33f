//! Per-owner registry of background activations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::identity::SandboxId;

#[derive(Debug)]
struct Activation {
    sandbox: SandboxId,
    token: CancellationToken,
    generation: u64,
}

/// Tracks the in-flight activation of each owner.
///
/// An owner has at most one entry. Inserting a new activation cancels the
/// previous one; a finishing task only removes its own entry, identified by
/// the generation it was handed.
#[derive(Debug, Default)]
pub struct ActivationRegistry {
    entries: Mutex<HashMap<String, Activation>>,
    next_generation: AtomicU64,
}

impl ActivationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an activation of `sandbox` for `owner`.
    ///
    /// The returned token is a child of `parent`, so cancelling `parent`
    /// cancels every activation.
    pub fn insert(
        &self,
        owner: &str,
        sandbox: &SandboxId,
        parent: &CancellationToken,
    ) -> (CancellationToken, u64) {
        let token = parent.child_token();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let previous = self.lock().insert(
            owner.to_string(),
            Activation {
                sandbox: sandbox.clone(),
                token: token.clone(),
                generation,
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        (token, generation)
    }

    /// Drops the entry for `owner` if it still belongs to `generation`.
    pub fn finish(&self, owner: &str, generation: u64) {
        let mut entries = self.lock();
        if entries.get(owner).is_some_and(|a| a.generation == generation) {
            entries.remove(owner);
        }
    }

    /// Cancels and drops the in-flight activation of `owner`, if any.
    pub fn cancel(&self, owner: &str) -> bool {
        match self.lock().remove(owner) {
            Some(activation) => {
                activation.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Sandbox currently being activated for `owner`.
    #[must_use]
    pub fn active(&self, owner: &str) -> Option<SandboxId> {
        self.lock().get(owner).map(|a| a.sandbox.clone())
    }

    /// Number of in-flight activations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Activation>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
