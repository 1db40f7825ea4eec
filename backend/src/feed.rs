use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use story_core::{GameCode, TurnView};
use tokio::sync::broadcast;

use crate::error::ErrorBody;

const FEED_CAPACITY: usize = 32;

/// Frames sent over `/ws/:code`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    State(TurnView),
    ImageAttached { reference: String },
    Error(ErrorBody),
}

/// Broadcast channel per game code. Senders are created on first subscribe.
#[derive(Clone, Default)]
pub struct LiveFeed {
    channels: Arc<Mutex<HashMap<GameCode, broadcast::Sender<ServerMessage>>>>,
}

impl LiveFeed {
    pub fn subscribe(&self, code: &GameCode) -> broadcast::Receiver<ServerMessage> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(code.clone())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, code: &GameCode, message: ServerMessage) {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = channels.get(code) {
            // no receivers is fine
            let _ = tx.send(message);
        }
    }

    pub fn len(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
