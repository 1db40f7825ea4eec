use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of full cycles through the players before a story is finished.
pub const TOTAL_ROUNDS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameCode(String);

impl GameCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GameCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for GameCode {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for GameCode {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GameError {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Turn and round counters for one story.
///
/// Fields are private so every instance satisfies
/// `1 <= current_player <= max_players`, `round >= 1` and
/// `is_complete == (round > TOTAL_ROUNDS)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StateParts")]
pub struct GameState {
    code: GameCode,
    current_player: u32,
    max_players: u32,
    round: u32,
    is_complete: bool,
    image_reference: Option<String>,
}

#[derive(Deserialize)]
struct StateParts {
    code: GameCode,
    current_player: u32,
    max_players: u32,
    round: u32,
    #[serde(default)]
    is_complete: Option<bool>,
    #[serde(default)]
    image_reference: Option<String>,
}

impl TryFrom<StateParts> for GameState {
    type Error = GameError;

    fn try_from(parts: StateParts) -> Result<Self, Self::Error> {
        let state = GameState::restore(
            parts.code,
            parts.max_players,
            parts.current_player,
            parts.round,
            parts.image_reference,
        )?;
        if parts.is_complete.is_some_and(|flag| flag != state.is_complete) {
            return Err(GameError::Validation(format!(
                "completion flag disagrees with round {}",
                state.round
            )));
        }
        Ok(state)
    }
}

impl GameState {
    /// Fresh game: player 1, round 1.
    pub fn new(code: GameCode, max_players: u32) -> Result<Self, GameError> {
        check_max_players(max_players)?;
        Ok(Self {
            code,
            current_player: 1,
            max_players,
            round: 1,
            is_complete: false,
            image_reference: None,
        })
    }

    /// Rebuilds a state read back from storage, rejecting records that break
    /// the counter invariants.
    pub fn restore(
        code: GameCode,
        max_players: u32,
        current_player: u32,
        round: u32,
        image_reference: Option<String>,
    ) -> Result<Self, GameError> {
        check_max_players(max_players)?;
        if current_player == 0 || current_player > max_players {
            return Err(GameError::Validation(format!(
                "current player {current_player} outside 1..={max_players}"
            )));
        }
        if round == 0 || round > TOTAL_ROUNDS + 1 {
            return Err(GameError::Validation(format!(
                "round {round} outside 1..={}",
                TOTAL_ROUNDS + 1
            )));
        }
        let is_complete = round > TOTAL_ROUNDS;
        if is_complete && current_player != 1 {
            return Err(GameError::Validation(
                "finished game must rest on player 1".into(),
            ));
        }
        if image_reference.is_some() && !is_complete {
            return Err(GameError::Validation(
                "image attached to an unfinished game".into(),
            ));
        }
        Ok(Self {
            code,
            current_player,
            max_players,
            round,
            is_complete,
            image_reference,
        })
    }

    pub fn code(&self) -> &GameCode {
        &self.code
    }

    pub fn current_player(&self) -> u32 {
        self.current_player
    }

    pub fn max_players(&self) -> u32 {
        self.max_players
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    pub fn image_reference(&self) -> Option<&str> {
        self.image_reference.as_deref()
    }

    /// Number of submissions needed to finish a game of this size.
    pub fn total_turns(&self) -> u32 {
        self.max_players.saturating_mul(TOTAL_ROUNDS)
    }

    pub fn attach_image(&self, reference: impl Into<String>) -> Result<Self, GameError> {
        if !self.is_complete {
            return Err(GameError::InvalidState(
                "illustrations can only be attached to a finished story",
            ));
        }
        Ok(Self {
            image_reference: Some(reference.into()),
            ..self.clone()
        })
    }

    /// What a player sees between turns: only the previous line.
    ///
    /// `show_input` follows the hand-the-device-around flow: the input is
    /// offered to player 1, or to anyone when `show_all` is set.
    pub fn view(&self, last_contribution: Option<&Contribution>, show_all: bool) -> TurnView {
        TurnView {
            code: self.code.clone(),
            last_contribution: last_contribution
                .map(|c| c.text.clone())
                .unwrap_or_default(),
            current_player: self.current_player,
            max_players: self.max_players,
            round: self.round,
            show_input: self.current_player == 1 || show_all,
            is_complete: self.is_complete,
        }
    }
}

fn check_max_players(max_players: u32) -> Result<(), GameError> {
    if max_players == 0 {
        return Err(GameError::Validation(
            "player count must be at least 1".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub code: GameCode,
    pub player_number: u32,
    pub round_number: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnView {
    pub code: GameCode,
    pub last_contribution: String,
    pub current_player: u32,
    pub max_players: u32,
    pub round: u32,
    pub show_input: bool,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryResult {
    pub code: GameCode,
    pub contributions: Vec<Contribution>,
    pub story: String,
    pub image_reference: Option<String>,
}

impl StoryResult {
    pub fn new(state: &GameState, mut contributions: Vec<Contribution>) -> Self {
        // Stable sort: equal (round, player) pairs keep creation order.
        contributions.sort_by_key(|c| (c.round_number, c.player_number));
        let story = contributions
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            code: state.code.clone(),
            contributions,
            story,
            image_reference: state.image_reference.clone(),
        }
    }
}

/// Applies one submission: records it against the current player and round,
/// then moves to the next player, wrapping into the next round after the
/// last one.
///
/// A single-player game wraps on every submission, so each line is its own
/// round.
pub fn advance(
    state: &GameState,
    text: impl Into<String>,
) -> Result<(GameState, Contribution), GameError> {
    if state.is_complete {
        return Err(GameError::InvalidState("story is already complete"));
    }

    let contribution = Contribution {
        code: state.code.clone(),
        player_number: state.current_player,
        round_number: state.round,
        text: text.into(),
    };

    let mut next = state.clone();
    if next.current_player < next.max_players {
        next.current_player += 1;
    } else {
        next.current_player = 1;
        next.round += 1;
    }
    next.is_complete = next.round > TOTAL_ROUNDS;

    Ok((next, contribution))
}

/// Player count as it arrives from a client: a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlayerCountInput {
    Integer(i64),
    Decimal(f64),
    Text(String),
}

impl PlayerCountInput {
    pub fn parse(&self) -> Result<u32, GameError> {
        match self {
            Self::Integer(n) => check_player_count(*n),
            Self::Decimal(n) => Err(GameError::Validation(format!(
                "player count must be a whole number, got {n}"
            ))),
            Self::Text(raw) => parse_player_count(raw),
        }
    }
}

pub fn parse_player_count(raw: &str) -> Result<u32, GameError> {
    let n = raw.trim().parse::<i64>().map_err(|_| {
        GameError::Validation(format!("player count must be a whole number, got {raw:?}"))
    })?;
    check_player_count(n)
}

fn check_player_count(n: i64) -> Result<u32, GameError> {
    if n < 1 {
        return Err(GameError::Validation(format!(
            "player count must be at least 1, got {n}"
        )));
    }
    u32::try_from(n)
        .map_err(|_| GameError::Validation(format!("player count {n} is too large")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(max_players: u32) -> GameState {
        GameState::new(GameCode::from("abcd1234"), max_players).unwrap()
    }

    fn submit_all(mut state: GameState, lines: &[&str]) -> (GameState, Vec<Contribution>) {
        let mut log = Vec::new();
        for line in lines {
            let (next, contribution) = advance(&state, *line).unwrap();
            log.push(contribution);
            state = next;
        }
        (state, log)
    }

    #[test]
    fn new_game_starts_at_player_one_round_one() {
        let state = fresh(4);
        assert_eq!(state.current_player(), 1);
        assert_eq!(state.round(), 1);
        assert_eq!(state.max_players(), 4);
        assert!(!state.is_complete());
        assert_eq!(state.image_reference(), None);
        assert_eq!(state.total_turns(), 12);
    }

    #[test]
    fn zero_players_rejected() {
        let err = GameState::new(GameCode::from("x"), 0).unwrap_err();
        assert!(matches!(err, GameError::Validation(_)));
    }

    #[test]
    fn full_round_wraps_to_player_one() {
        let (state, log) = submit_all(fresh(3), &["a", "b", "c"]);
        assert_eq!(state.round(), 2);
        assert_eq!(state.current_player(), 1);
        assert!(!state.is_complete());
        assert_eq!(
            log.iter()
                .map(|c| (c.player_number, c.round_number))
                .collect::<Vec<_>>(),
            vec![(1, 1), (2, 1), (3, 1)]
        );
    }

    #[test]
    fn nine_lines_finish_a_three_player_game() {
        let lines = ["a", "b", "c", "d", "e", "f", "g", "h", "i"];
        let (state, log) = submit_all(fresh(3), &lines[..8]);
        assert!(!state.is_complete());
        assert_eq!((state.current_player(), state.round()), (3, 3));

        let (state, last) = advance(&state, lines[8]).unwrap();
        assert_eq!(state.round(), 4);
        assert_eq!(state.current_player(), 1);
        assert!(state.is_complete());
        assert_eq!((last.player_number, last.round_number), (3, 3));
        assert_eq!(log.len() + 1, 9);
    }

    #[test]
    fn single_player_advances_round_every_turn() {
        let (state, _) = submit_all(fresh(1), &["x"]);
        assert_eq!((state.current_player(), state.round()), (1, 2));
        assert!(!state.is_complete());

        let (state, log) = submit_all(state, &["y", "z"]);
        assert!(state.is_complete());
        assert_eq!(log[0].round_number, 2);
        assert_eq!(log[1].round_number, 3);
    }

    #[test]
    fn advancing_finished_game_is_rejected() {
        let (done, _) = submit_all(fresh(1), &["x", "y", "z"]);
        let err = advance(&done, "too late").unwrap_err();
        assert_eq!(err, GameError::InvalidState("story is already complete"));
    }

    #[test]
    fn advance_leaves_input_untouched() {
        let state = fresh(2);
        let before = state.clone();
        let (next, _) = advance(&state, "").unwrap();
        assert_eq!(state, before);
        assert_eq!(next.current_player(), 2);
    }

    #[test]
    fn image_only_attaches_to_finished_game() {
        let state = fresh(1);
        assert!(matches!(
            state.attach_image("pic.png"),
            Err(GameError::InvalidState(_))
        ));

        let (done, _) = submit_all(state, &["x", "y", "z"]);
        let with_image = done.attach_image("pic.png").unwrap();
        assert_eq!(with_image.image_reference(), Some("pic.png"));
        assert!(with_image.is_complete());
    }

    #[test]
    fn view_shows_only_previous_line() {
        let (state, log) = submit_all(fresh(3), &["first", "second"]);
        let view = state.view(log.last(), false);
        assert_eq!(view.last_contribution, "second");
        assert_eq!(view.current_player, 3);
        assert!(!view.show_input);
        assert!(state.view(log.last(), true).show_input);

        let empty = fresh(3).view(None, false);
        assert_eq!(empty.last_contribution, "");
        assert!(empty.show_input);
    }

    #[test]
    fn result_orders_by_round_then_player() {
        let (state, log) = submit_all(fresh(2), &["a", "b", "c", "d", "e", "f"]);
        let mut shuffled = log.clone();
        shuffled.reverse();
        let result = StoryResult::new(&state, shuffled);
        assert_eq!(result.contributions, log);
        assert_eq!(result.story, "a\nb\nc\nd\ne\nf");
        assert_eq!(result.image_reference, None);
    }

    #[test]
    fn restore_rejects_broken_records() {
        let code = GameCode::from("c0ffee00");
        assert!(GameState::restore(code.clone(), 3, 4, 1, None).is_err());
        assert!(GameState::restore(code.clone(), 3, 0, 1, None).is_err());
        assert!(GameState::restore(code.clone(), 3, 1, 0, None).is_err());
        assert!(GameState::restore(code.clone(), 3, 2, 4, None).is_err());
        assert!(GameState::restore(code.clone(), 3, 1, 2, Some("a.png".into())).is_err());

        let done = GameState::restore(code, 3, 1, 4, Some("a.png".into())).unwrap();
        assert!(done.is_complete());
    }

    #[test]
    fn deserialize_checks_invariants() {
        let state = fresh(2);
        let json = serde_json::to_string(&state).unwrap();
        let back: GameState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);

        let broken = r#"{"code":"abcd1234","current_player":5,"max_players":2,"round":1,"is_complete":false,"image_reference":null}"#;
        assert!(serde_json::from_str::<GameState>(broken).is_err());

        let lying = r#"{"code":"abcd1234","current_player":1,"max_players":2,"round":4,"is_complete":false,"image_reference":null}"#;
        assert!(serde_json::from_str::<GameState>(lying).is_err());
    }

    #[test]
    fn player_count_coercion() {
        assert_eq!(parse_player_count("3"), Ok(3));
        assert_eq!(parse_player_count(" 12 "), Ok(12));
        assert!(parse_player_count("0").is_err());
        assert!(parse_player_count("-2").is_err());
        assert!(parse_player_count("three").is_err());
        assert!(parse_player_count("2.5").is_err());
        assert!(parse_player_count("99999999999").is_err());

        let number: PlayerCountInput = serde_json::from_str("4").unwrap();
        assert_eq!(number.parse(), Ok(4));
        let text: PlayerCountInput = serde_json::from_str("\"5\"").unwrap();
        assert_eq!(text.parse(), Ok(5));
        let fraction: PlayerCountInput = serde_json::from_str("1.5").unwrap();
        assert!(fraction.parse().is_err());
    }
}
