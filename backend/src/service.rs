use std::sync::Arc;

use serde::{Deserialize, Serialize};
use story_core::{advance, Contribution, GameCode, GameState, StoryResult, TurnView};
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::feed::{LiveFeed, ServerMessage};
use crate::locks::GameLocks;
use crate::store::{GameStore, StoreError};
use crate::uploads::ImageStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub state: GameState,
    pub contribution: Contribution,
    pub completed: bool,
}

/// An illustration as received from the client.
#[derive(Debug, Clone, Default)]
pub struct ImageUpload {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Drives the game operations on top of a store. Live updates are published
/// while the game's lock is still held, so subscribers see them in commit
/// order.
#[derive(Clone)]
pub struct StoryService {
    store: Arc<dyn GameStore>,
    locks: GameLocks,
    feed: LiveFeed,
    images: ImageStore,
}

impl StoryService {
    pub fn new(store: Arc<dyn GameStore>, images: ImageStore) -> Self {
        Self {
            store,
            locks: GameLocks::default(),
            feed: LiveFeed::default(),
            images,
        }
    }

    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    pub async fn start_game(&self, max_players: u32) -> Result<GameState, ApiError> {
        let code = self.store.create(max_players).await?;
        let state = self.store.get(&code).await?;
        info!(%code, max_players, "game started");
        Ok(state)
    }

    /// Unknown codes fail before a lock entry is made for them.
    async fn lock_existing(
        &self,
        code: &GameCode,
    ) -> Result<(OwnedMutexGuard<()>, GameState), ApiError> {
        self.store.get(code).await?;
        let guard = self.locks.acquire(code).await;
        let state = self.store.get(code).await?;
        Ok((guard, state))
    }

    pub async fn submit(&self, code: &GameCode, text: String) -> Result<Submission, ApiError> {
        let (_turn, state) = self.lock_existing(code).await?;

        let (next, contribution) = advance(&state, text)?;
        if let Err(err) = self.store.commit_turn(&state, &next, &contribution).await {
            if matches!(err, StoreError::Conflict(_)) {
                warn!(%code, "turn committed concurrently elsewhere");
            }
            return Err(err.into());
        }

        info!(
            %code,
            player = contribution.player_number,
            round = contribution.round_number,
            "contribution recorded"
        );
        if next.is_complete() {
            info!(%code, "story complete");
        }
        self.feed.publish(
            code,
            ServerMessage::State(next.view(Some(&contribution), false)),
        );
        let completed = next.is_complete();
        Ok(Submission {
            state: next,
            contribution,
            completed,
        })
    }

    /// Current view plus a receiver for every later update. Taken under the
    /// game lock so nothing is published between the two.
    pub async fn watch(
        &self,
        code: &GameCode,
    ) -> Result<(TurnView, broadcast::Receiver<ServerMessage>), ApiError> {
        let (_turn, state) = self.lock_existing(code).await?;
        let last = self.store.last_contribution(code).await?;
        let rx = self.feed.subscribe(code);
        Ok((state.view(last.as_ref(), false), rx))
    }

    /// Read-only.
    pub async fn view(&self, code: &GameCode, show_all: bool) -> Result<TurnView, ApiError> {
        let state = self.store.get(code).await?;
        let last = self.store.last_contribution(code).await?;
        Ok(state.view(last.as_ref(), show_all))
    }

    pub async fn result(&self, code: &GameCode) -> Result<StoryResult, ApiError> {
        let state = self.store.get(code).await?;
        let contributions = self.store.list_contributions(code).await?;
        Ok(StoryResult::new(&state, contributions))
    }

    /// Attaches an illustration to a finished story. Nothing is written for
    /// unknown codes, unfinished games or rejected files.
    pub async fn upload_image(
        &self,
        code: &GameCode,
        upload: ImageUpload,
    ) -> Result<String, ApiError> {
        let (_turn, state) = self.lock_existing(code).await?;
        // dry run of the completion rule before anything touches the disk
        state.attach_image("")?;

        let ext = self
            .images
            .validate(
                upload.filename.as_deref(),
                upload.content_type.as_deref(),
                &upload.bytes,
            )
            .map_err(|err| {
                warn!(%code, %err, "image rejected");
                err
            })?;

        let reference = self.images.save(code, ext, &upload.bytes).await?;
        if let Err(err) = self.store.set_image_reference(code, &reference).await {
            if let Err(cleanup) = self.images.remove(&reference).await {
                warn!(%code, %reference, %cleanup, "orphaned image left on disk");
            }
            return Err(err.into());
        }

        if let Some(old) = state.image_reference() {
            if let Err(err) = self.images.remove(old).await {
                warn!(%code, reference = old, %err, "could not remove replaced image");
            }
        }
        info!(%code, %reference, size = upload.bytes.len(), "image attached");
        self.feed.publish(
            code,
            ServerMessage::ImageAttached {
                reference: reference.clone(),
            },
        );
        Ok(reference)
    }

    /// Bytes and content type of the story's illustration.
    pub async fn image(&self, code: &GameCode) -> Result<(Vec<u8>, &'static str), ApiError> {
        let state = self.store.get(code).await?;
        let reference = state
            .image_reference()
            .ok_or_else(|| ApiError::NotFound(code.clone()))?;
        Ok(self.images.load(reference).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::store::{CodeGenerator, MemoryStore, SqliteStore};
    use crate::uploads::DEFAULT_MAX_IMAGE_BYTES;

    fn service_with(store: Arc<dyn GameStore>, dir: &tempfile::TempDir) -> StoryService {
        StoryService::new(
            store,
            ImageStore::new(dir.path().join("uploads"), DEFAULT_MAX_IMAGE_BYTES),
        )
    }

    fn memory_service(dir: &tempfile::TempDir) -> StoryService {
        service_with(Arc::new(MemoryStore::default()), dir)
    }

    async fn finish(service: &StoryService, code: &GameCode, turns: u32) {
        for n in 0..turns {
            service.submit(code, format!("line {n}")).await.unwrap();
        }
    }

    fn png(bytes: &[u8]) -> ImageUpload {
        ImageUpload {
            filename: Some("drawing.png".into()),
            content_type: Some("image/png".into()),
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn three_player_scenarios() {
        let dir = tempfile::tempdir().unwrap();
        let service = memory_service(&dir);
        let code = service.start_game(3).await.unwrap().code().clone();

        let mut last = None;
        for text in ["a", "b", "c"] {
            last = Some(service.submit(&code, text.into()).await.unwrap());
        }
        let after_round = last.unwrap();
        assert_eq!(after_round.state.round(), 2);
        assert_eq!(after_round.state.current_player(), 1);
        assert!(!after_round.completed);

        for text in ["d", "e", "f", "g", "h"] {
            let step = service.submit(&code, text.into()).await.unwrap();
            assert!(!step.completed);
        }
        let finished = service.submit(&code, "i".into()).await.unwrap();
        assert!(finished.completed);
        assert_eq!(finished.state.round(), 4);

        let result = service.result(&code).await.unwrap();
        assert_eq!(result.story, "a\nb\nc\nd\ne\nf\ng\nh\ni");
    }

    #[tokio::test]
    async fn submitting_to_finished_game_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let service = memory_service(&dir);
        let code = service.start_game(1).await.unwrap().code().clone();
        finish(&service, &code, 3).await;

        let err = service.submit(&code, "extra".into()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
        assert_eq!(service.result(&code).await.unwrap().contributions.len(), 3);
    }

    #[tokio::test]
    async fn view_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let service = memory_service(&dir);
        let code = service.start_game(2).await.unwrap().code().clone();
        service.submit(&code, "hello".into()).await.unwrap();

        let first = service.view(&code, false).await.unwrap();
        for _ in 0..5 {
            assert_eq!(service.view(&code, false).await.unwrap(), first);
        }
        assert_eq!(first.last_contribution, "hello");
        assert_eq!(first.current_player, 2);
        assert!(!first.show_input);
        assert!(service.view(&code, true).await.unwrap().show_input);
    }

    #[tokio::test]
    async fn concurrent_submissions_take_distinct_slots() {
        let dir = tempfile::tempdir().unwrap();
        let service = memory_service(&dir);
        let code = service.start_game(4).await.unwrap().code().clone();

        let tasks: Vec<_> = (0..12)
            .map(|n| {
                let service = service.clone();
                let code = code.clone();
                tokio::spawn(async move { service.submit(&code, format!("line {n}")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let result = service.result(&code).await.unwrap();
        let mut slots: Vec<_> = result
            .contributions
            .iter()
            .map(|c| (c.round_number, c.player_number))
            .collect();
        slots.dedup();
        assert_eq!(slots.len(), 12);
        assert!(service.view(&code, false).await.unwrap().is_complete);
    }

    fn turn_index(view: &TurnView) -> (u32, u32) {
        (view.round, view.current_player)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn live_updates_arrive_in_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        let service = memory_service(&dir);
        let code = service.start_game(5).await.unwrap().code().clone();
        let (snapshot, mut rx) = service.watch(&code).await.unwrap();
        assert_eq!(turn_index(&snapshot), (1, 1));

        let tasks: Vec<_> = (0..15)
            .map(|n| {
                let service = service.clone();
                let code = code.clone();
                tokio::spawn(async move { service.submit(&code, format!("line {n}")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut seen = vec![turn_index(&snapshot)];
        for _ in 0..15 {
            match rx.recv().await.unwrap() {
                ServerMessage::State(view) => seen.push(turn_index(&view)),
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        assert_eq!(seen.last(), Some(&(4, 1)));
    }

    #[tokio::test]
    async fn watch_starts_from_current_view() {
        let dir = tempfile::tempdir().unwrap();
        let service = memory_service(&dir);
        let code = service.start_game(2).await.unwrap().code().clone();
        service.submit(&code, "before".into()).await.unwrap();

        let (snapshot, mut rx) = service.watch(&code).await.unwrap();
        assert_eq!(snapshot.last_contribution, "before");
        assert_eq!(snapshot.current_player, 2);
        assert!(rx.try_recv().is_err());

        service.submit(&code, "after".into()).await.unwrap();
        match rx.try_recv().unwrap() {
            ServerMessage::State(view) => {
                assert_eq!(view.last_contribution, "after");
                assert_eq!(turn_index(&view), (2, 1));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_codes_leave_no_lock_entries() {
        let dir = tempfile::tempdir().unwrap();
        let service = memory_service(&dir);
        for n in 0..100 {
            let code = GameCode::new(format!("bogus-{n}"));
            let err = service.submit(&code, "hi".into()).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::NotFound);
            let err = service.upload_image(&code, png(b"\x89PNG")).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::NotFound);
            assert!(service.watch(&code).await.is_err());
        }
        assert!(service.locks.is_empty());
        assert!(service.feed.is_empty());
    }

    #[tokio::test]
    async fn upload_on_unknown_code_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let service = memory_service(&dir);
        let err = service
            .upload_image(&GameCode::from("00000000"), png(b"\x89PNG"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(!dir.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn upload_rules() {
        let dir = tempfile::tempdir().unwrap();
        let service = memory_service(&dir);
        let code = service.start_game(1).await.unwrap().code().clone();

        let err = service.upload_image(&code, png(b"\x89PNG")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);

        finish(&service, &code, 3).await;

        let pdf = ImageUpload {
            filename: Some("story.pdf".into()),
            content_type: Some("application/pdf".into()),
            bytes: b"%PDF".to_vec(),
        };
        let err = service.upload_image(&code, pdf).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);

        let huge = png(&vec![0u8; DEFAULT_MAX_IMAGE_BYTES + 1]);
        let err = service.upload_image(&code, huge).await.unwrap_err();
        assert!(matches!(err, ApiError::PayloadTooLarge(_)));

        let reference = service.upload_image(&code, png(b"\x89PNG")).await.unwrap();
        let result = service.result(&code).await.unwrap();
        assert_eq!(result.image_reference.as_deref(), Some(reference.as_str()));

        let (bytes, content_type) = service.image(&code).await.unwrap();
        assert_eq!(bytes, b"\x89PNG");
        assert_eq!(content_type, "image/png");

        let replacement = service.upload_image(&code, png(b"\x89PNG2")).await.unwrap();
        assert_ne!(replacement, reference);
        assert!(!dir.path().join("uploads").join(&reference).exists());
    }

    #[tokio::test]
    async fn sqlite_backend_runs_the_same_flow() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect("sqlite::memory:", Arc::new(CodeGenerator::default()))
            .await
            .unwrap();
        let service = service_with(Arc::new(store), &dir);
        let code = service.start_game(1).await.unwrap().code().clone();

        let first = service.submit(&code, "x".into()).await.unwrap();
        assert_eq!((first.state.round(), first.state.current_player()), (2, 1));
        finish(&service, &code, 2).await;
        assert!(service.view(&code, false).await.unwrap().is_complete);

        let reference = service.upload_image(&code, png(b"GIF?")).await.unwrap();
        let result = service.result(&code).await.unwrap();
        assert_eq!(result.story, "x\nline 0\nline 1");
        assert_eq!(result.image_reference, Some(reference));
    }
}
