use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use story_core::{Contribution, GameCode, GameState};
use tokio::sync::RwLock;
use tracing::{error, info};

use super::{CodeGenerator, GameStore, StoreError, MAX_CODE_ATTEMPTS};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameRecord {
    pub state: GameState,
    pub contributions: Vec<Contribution>,
}

type Games = HashMap<GameCode, GameRecord>;

/// In-process store. With a snapshot path every mutation is written to disk
/// before it becomes visible.
#[derive(Clone)]
pub struct MemoryStore {
    games: Arc<RwLock<Games>>,
    codes: Arc<CodeGenerator>,
    persist_path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(CodeGenerator::default()))
    }
}

impl MemoryStore {
    pub fn new(codes: Arc<CodeGenerator>) -> Self {
        Self {
            games: Arc::new(RwLock::new(HashMap::new())),
            codes,
            persist_path: None,
        }
    }

    /// Loads the snapshot at `path` if there is one.
    pub async fn with_persistence(
        path: impl Into<PathBuf>,
        codes: Arc<CodeGenerator>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let mut store = Self::new(codes);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let saved: Games = serde_json::from_slice(&bytes)?;
                info!(path = %path.display(), games = saved.len(), "loaded game snapshot");
                *store.games.write().await = saved;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        store.persist_path = Some(path);
        Ok(store)
    }

    pub async fn len(&self) -> usize {
        self.games.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.games.read().await.is_empty()
    }

    async fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut Games) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut games = self.games.write().await;
        let Some(path) = &self.persist_path else {
            return apply(&mut games);
        };

        let mut draft = games.clone();
        let out = apply(&mut draft)?;
        if let Err(err) = write_snapshot(path, &draft).await {
            error!(path = %path.display(), %err, "snapshot write failed");
            return Err(err);
        }
        *games = draft;
        Ok(out)
    }
}

async fn write_snapshot(path: &Path, games: &Games) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(games)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn record_mut<'a>(games: &'a mut Games, code: &GameCode) -> Result<&'a mut GameRecord, StoreError> {
    games
        .get_mut(code)
        .ok_or_else(|| StoreError::NotFound(code.clone()))
}

impl GameRecord {
    /// One contribution per `(round, player)` slot.
    fn push(&mut self, contribution: &Contribution) -> Result<(), StoreError> {
        let taken = self.contributions.iter().any(|c| {
            c.round_number == contribution.round_number
                && c.player_number == contribution.player_number
        });
        if taken {
            return Err(StoreError::Conflict(contribution.code.clone()));
        }
        self.contributions.push(contribution.clone());
        Ok(())
    }
}

#[async_trait]
impl GameStore for MemoryStore {
    async fn create(&self, max_players: u32) -> Result<GameCode, StoreError> {
        let codes = Arc::clone(&self.codes);
        self.mutate(move |games| {
            for _ in 0..MAX_CODE_ATTEMPTS {
                let code = codes.next_code();
                if games.contains_key(&code) {
                    continue;
                }
                let state = GameState::new(code.clone(), max_players)?;
                games.insert(
                    code.clone(),
                    GameRecord {
                        state,
                        contributions: Vec::new(),
                    },
                );
                return Ok(code);
            }
            Err(StoreError::Persistence(
                "could not allocate a unique game code".into(),
            ))
        })
        .await
    }

    async fn get(&self, code: &GameCode) -> Result<GameState, StoreError> {
        self.games
            .read()
            .await
            .get(code)
            .map(|record| record.state.clone())
            .ok_or_else(|| StoreError::NotFound(code.clone()))
    }

    async fn append(&self, contribution: &Contribution) -> Result<(), StoreError> {
        self.mutate(|games| record_mut(games, &contribution.code)?.push(contribution))
        .await
    }

    async fn save(&self, state: &GameState) -> Result<(), StoreError> {
        self.mutate(|games| {
            record_mut(games, state.code())?.state = state.clone();
            Ok(())
        })
        .await
    }

    async fn commit_turn(
        &self,
        previous: &GameState,
        next: &GameState,
        contribution: &Contribution,
    ) -> Result<(), StoreError> {
        self.mutate(|games| {
            let record = record_mut(games, previous.code())?;
            if record.state.current_player() != previous.current_player()
                || record.state.round() != previous.round()
            {
                return Err(StoreError::Conflict(previous.code().clone()));
            }
            record.push(contribution)?;
            record.state = next.clone();
            Ok(())
        })
        .await
    }

    async fn list_contributions(&self, code: &GameCode) -> Result<Vec<Contribution>, StoreError> {
        let games = self.games.read().await;
        let record = games
            .get(code)
            .ok_or_else(|| StoreError::NotFound(code.clone()))?;
        let mut contributions = record.contributions.clone();
        contributions.sort_by_key(|c| (c.round_number, c.player_number));
        Ok(contributions)
    }

    async fn last_contribution(
        &self,
        code: &GameCode,
    ) -> Result<Option<Contribution>, StoreError> {
        let games = self.games.read().await;
        let record = games
            .get(code)
            .ok_or_else(|| StoreError::NotFound(code.clone()))?;
        Ok(record.contributions.last().cloned())
    }

    async fn set_image_reference(
        &self,
        code: &GameCode,
        reference: &str,
    ) -> Result<(), StoreError> {
        self.mutate(|games| {
            let record = record_mut(games, code)?;
            record.state = record.state.attach_image(reference)?;
            Ok(())
        })
        .await
    }
}
