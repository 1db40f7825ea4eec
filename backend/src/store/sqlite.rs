use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use story_core::{Contribution, GameCode, GameError, GameState};
use tracing::{debug, info};

use super::{CodeGenerator, GameStore, StoreError, MAX_CODE_ATTEMPTS};

/// Relational backend: one `games` row per code, one `contributions` row per
/// submission.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    codes: Arc<CodeGenerator>,
}

impl SqliteStore {
    pub async fn connect(database_url: &str, codes: Arc<CodeGenerator>) -> Result<Self, StoreError> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` is a separate database.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::Persistence(format!("migration failed: {err}")))?;
        info!(%database_url, "sqlite store ready");
        Ok(Self { pool, codes })
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn exists(&self, code: &GameCode) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM games WHERE code = ?")
            .bind(code.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn require(&self, code: &GameCode) -> Result<(), StoreError> {
        if self.exists(code).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(code.clone()))
        }
    }
}

fn column_u32(row: &SqliteRow, column: &str) -> Result<u32, StoreError> {
    let raw: i64 = row.try_get(column)?;
    u32::try_from(raw)
        .map_err(|_| StoreError::Persistence(format!("column {column} holds {raw}")))
}

fn row_to_state(row: &SqliteRow) -> Result<GameState, StoreError> {
    let code = GameCode::new(row.try_get::<String, _>("code")?);
    GameState::restore(
        code.clone(),
        column_u32(row, "max_players")?,
        column_u32(row, "current_player")?,
        column_u32(row, "round")?,
        row.try_get("image_reference")?,
    )
    .map_err(|err| StoreError::Persistence(format!("corrupt game record {code}: {err}")))
}

fn row_to_contribution(row: &SqliteRow) -> Result<Contribution, StoreError> {
    Ok(Contribution {
        code: GameCode::new(row.try_get::<String, _>("game_code")?),
        player_number: column_u32(row, "player_number")?,
        round_number: column_u32(row, "round_number")?,
        text: row.try_get("text")?,
    })
}

fn map_insert_error(err: sqlx::Error, code: &GameCode) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict(code.clone());
        }
    }
    err.into()
}

#[async_trait]
impl GameStore for SqliteStore {
    async fn create(&self, max_players: u32) -> Result<GameCode, StoreError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = self.codes.next_code();
            let state = GameState::new(code.clone(), max_players)?;
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO games (code, max_players, current_player, round, is_complete)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(code.as_str())
            .bind(i64::from(state.max_players()))
            .bind(i64::from(state.current_player()))
            .bind(i64::from(state.round()))
            .bind(state.is_complete())
            .execute(&self.pool)
            .await?
            .rows_affected();
            if inserted == 1 {
                return Ok(code);
            }
            debug!(%code, "game code collision, drawing another");
        }
        Err(StoreError::Persistence(
            "could not allocate a unique game code".into(),
        ))
    }

    async fn get(&self, code: &GameCode) -> Result<GameState, StoreError> {
        let row = sqlx::query(
            "SELECT code, max_players, current_player, round, image_reference
             FROM games WHERE code = ?",
        )
        .bind(code.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(code.clone()))?;
        row_to_state(&row)
    }

    async fn append(&self, contribution: &Contribution) -> Result<(), StoreError> {
        let code = &contribution.code;
        let inserted = sqlx::query(
            "INSERT INTO contributions (game_code, round_number, player_number, text)
             SELECT ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM games WHERE code = ?)",
        )
        .bind(code.as_str())
        .bind(i64::from(contribution.round_number))
        .bind(i64::from(contribution.player_number))
        .bind(&contribution.text)
        .bind(code.as_str())
        .execute(&self.pool)
        .await
        .map_err(|err| map_insert_error(err, code))?
        .rows_affected();
        if inserted == 0 {
            return Err(StoreError::NotFound(code.clone()));
        }
        Ok(())
    }

    async fn save(&self, state: &GameState) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE games
             SET current_player = ?, round = ?, is_complete = ?, image_reference = ?,
                 updated_at = CURRENT_TIMESTAMP
             WHERE code = ?",
        )
        .bind(i64::from(state.current_player()))
        .bind(i64::from(state.round()))
        .bind(state.is_complete())
        .bind(state.image_reference())
        .bind(state.code().as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(state.code().clone()));
        }
        Ok(())
    }

    async fn commit_turn(
        &self,
        previous: &GameState,
        next: &GameState,
        contribution: &Contribution,
    ) -> Result<(), StoreError> {
        let code = previous.code();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE games
             SET current_player = ?, round = ?, is_complete = ?, updated_at = CURRENT_TIMESTAMP
             WHERE code = ? AND current_player = ? AND round = ?",
        )
        .bind(i64::from(next.current_player()))
        .bind(i64::from(next.round()))
        .bind(next.is_complete())
        .bind(code.as_str())
        .bind(i64::from(previous.current_player()))
        .bind(i64::from(previous.round()))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM games WHERE code = ?")
                .bind(code.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Err(match found {
                Some(_) => StoreError::Conflict(code.clone()),
                None => StoreError::NotFound(code.clone()),
            });
        }

        sqlx::query(
            "INSERT INTO contributions (game_code, round_number, player_number, text)
             VALUES (?, ?, ?, ?)",
        )
        .bind(code.as_str())
        .bind(i64::from(contribution.round_number))
        .bind(i64::from(contribution.player_number))
        .bind(&contribution.text)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_insert_error(err, code))?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_contributions(&self, code: &GameCode) -> Result<Vec<Contribution>, StoreError> {
        self.require(code).await?;
        let rows = sqlx::query(
            "SELECT game_code, round_number, player_number, text
             FROM contributions WHERE game_code = ?
             ORDER BY round_number, player_number, seq",
        )
        .bind(code.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_contribution).collect()
    }

    async fn last_contribution(
        &self,
        code: &GameCode,
    ) -> Result<Option<Contribution>, StoreError> {
        self.require(code).await?;
        let row = sqlx::query(
            "SELECT game_code, round_number, player_number, text
             FROM contributions WHERE game_code = ?
             ORDER BY seq DESC LIMIT 1",
        )
        .bind(code.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_contribution).transpose()
    }

    async fn set_image_reference(
        &self,
        code: &GameCode,
        reference: &str,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE games SET image_reference = ?, updated_at = CURRENT_TIMESTAMP
             WHERE code = ? AND is_complete = 1",
        )
        .bind(reference)
        .bind(code.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            self.require(code).await?;
            return Err(StoreError::Rejected(GameError::InvalidState(
                "illustrations can only be attached to a finished story",
            )));
        }
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<(), StoreError> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    fs::create_dir_all(parent).map_err(|err| {
        StoreError::Persistence(format!(
            "failed to create '{}' for database url '{database_url}': {err}",
            parent.display()
        ))
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return None;
    }
    Some(Path::new(path).to_path_buf())
}
