use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use story_core::GameCode;
use tokio::sync::OwnedMutexGuard;

/// One async mutex per game code. Holding the guard serializes
/// read-advance-commit for that game within this process.
#[derive(Clone, Default)]
pub struct GameLocks {
    locks: Arc<Mutex<HashMap<GameCode, Arc<tokio::sync::Mutex<()>>>>>,
}

impl GameLocks {
    pub async fn acquire(&self, code: &GameCode) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(code.clone()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
