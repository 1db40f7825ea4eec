use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use story_core::{Contribution, GameCode, GameError, GameState};

mod memory;
mod sqlite;

pub use memory::{GameRecord, MemoryStore};
pub use sqlite::SqliteStore;

/// How many fresh codes `create` draws before giving up.
pub const MAX_CODE_ATTEMPTS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("game {0} not found")]
    NotFound(GameCode),
    #[error("game {0} was modified by another submission")]
    Conflict(GameCode),
    #[error(transparent)]
    Rejected(#[from] GameError),
    #[error("storage unavailable: {0}")]
    Persistence(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Persistence(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Persistence(err.to_string())
    }
}

/// Persistence boundary for games and their contribution logs.
///
/// Backends never interpret the turn rules; they store whatever state the
/// turn engine produced.
#[async_trait]
pub trait GameStore: Send + Sync {
    /// Allocates an unused code and stores a fresh game under it.
    async fn create(&self, max_players: u32) -> Result<GameCode, StoreError>;

    async fn get(&self, code: &GameCode) -> Result<GameState, StoreError>;

    /// Adds one line to the log of `contribution.code`.
    async fn append(&self, contribution: &Contribution) -> Result<(), StoreError>;

    /// Replaces the stored counters for `state.code()`.
    async fn save(&self, state: &GameState) -> Result<(), StoreError>;

    /// Appends `contribution` and stores `next` as one unit. Fails with
    /// `Conflict` and changes nothing when the stored counters no longer
    /// match `previous`.
    async fn commit_turn(
        &self,
        previous: &GameState,
        next: &GameState,
        contribution: &Contribution,
    ) -> Result<(), StoreError>;

    /// All contributions ordered by round, then player, then creation.
    async fn list_contributions(&self, code: &GameCode) -> Result<Vec<Contribution>, StoreError>;

    /// The most recently created contribution, if any.
    async fn last_contribution(&self, code: &GameCode)
        -> Result<Option<Contribution>, StoreError>;

    /// Only finished games accept an illustration.
    async fn set_image_reference(&self, code: &GameCode, reference: &str)
        -> Result<(), StoreError>;
}

/// Draws short lowercase hex game codes.
pub struct CodeGenerator {
    rng: Mutex<ChaCha8Rng>,
}

impl CodeGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = seed
            .map(ChaCha8Rng::seed_from_u64)
            .unwrap_or_else(ChaCha8Rng::from_entropy);
        Self {
            rng: Mutex::new(rng),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(Some(seed))
    }

    pub fn next_code(&self) -> GameCode {
        let bytes: [u8; 4] = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen();
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        GameCode::new(hex)
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new(None)
    }
}
