//! In-memory games lobby.
//!
//! A connection has exactly one outbound queue, owned by its
//! [`SessionContext`], and everything the lobby says to a player goes through
//! it. While a player of a started game is away, notices addressed to them
//! pile up in a per-player backlog. A [`LobbyRequest::Reconnect`] replays that
//! backlog on the new connection, in order, before anything else is sent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use codex_net::{Lobby, LobbyError, Ping, Schema, Session, SessionContext};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Game ids are drawn from `0..GAME_ID_SPACE`.
const GAME_ID_SPACE: u32 = 2049;
const MIN_PLAYERS: usize = 2;
const MAX_PLAYERS: usize = 4;
/// Notices kept for an absent player; the oldest go first.
const BACKLOG_LIMIT: usize = 512;

/// Lobby-phase requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LobbyRequest {
    /// Create a game for `players` players and join it.
    NewGame { nickname: String, players: usize },
    /// Join a game that is still gathering players.
    AccessGame { game_id: u32, nickname: String },
    /// Take back a seat after a lost connection.
    Reconnect { game_id: u32, nickname: String },
}

/// In-game messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GameMessage {
    /// Say something to everyone at the table.
    Chat { text: String },
    /// Ask for a [`Notice::GameStatus`].
    RequestStatus,
}

/// Server notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Notice {
    NewGameCreated { game_id: u32 },
    PlayerJoined { nickname: String, players: Vec<String> },
    GameStarted { game_id: u32, players: Vec<String> },
    PlayerReconnected { nickname: String },
    PlayerDisconnected { nickname: String },
    ChatMessage { from: String, text: String },
    GameStatus { game_id: u32, players: Vec<(String, bool)> },
}

/// Message schema of the game server.
pub struct CodexSchema;

impl Schema for CodexSchema {
    type Lobby = LobbyRequest;
    type Game = GameMessage;
    type Notice = Notice;
}

type Context = SessionContext<CodexSchema>;

struct Player {
    nickname: String,
    ctx: Context,
    connected: bool,
    backlog: VecDeque<Notice>,
}

impl Player {
    fn new(nickname: String, ctx: &Context) -> Self {
        Self {
            nickname,
            ctx: ctx.clone(),
            connected: true,
            backlog: VecDeque::new(),
        }
    }

    fn notify(&mut self, notice: &Notice) {
        if self.connected {
            self.ctx.reply(notice.clone());
            return;
        }
        if self.backlog.len() == BACKLOG_LIMIT {
            self.backlog.pop_front();
        }
        self.backlog.push_back(notice.clone());
    }

    /// Whether the connection holding the seat is still up.
    fn holds_seat(&self) -> bool {
        self.connected && !self.ctx.link().is_closed()
    }
}

struct Game {
    size: usize,
    started: bool,
    players: Vec<Player>,
}

impl Game {
    fn nicknames(&self) -> Vec<String> {
        self.players.iter().map(|p| p.nickname.clone()).collect()
    }

    fn player_mut(&mut self, nickname: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.nickname == nickname)
    }

    fn broadcast(&mut self, notice: &Notice) {
        for player in &mut self.players {
            player.notify(notice);
        }
    }

    fn broadcast_except(&mut self, nickname: &str, notice: &Notice) {
        for player in self.players.iter_mut().filter(|p| p.nickname != nickname) {
            player.notify(notice);
        }
    }

    fn status(&self, game_id: u32) -> Notice {
        Notice::GameStatus {
            game_id,
            players: self
                .players
                .iter()
                .map(|p| (p.nickname.clone(), p.connected))
                .collect(),
        }
    }
}

type Games = HashMap<u32, Game>;

/// Registry of every game hosted by this server.
#[derive(Clone, Default)]
pub struct GamesManager {
    games: Arc<Mutex<Games>>,
}

fn lock(games: &Mutex<Games>) -> MutexGuard<'_, Games> {
    games.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rejected(reason: impl Into<String>) -> LobbyError {
    LobbyError::Rejected(reason.into())
}

impl GamesManager {
    /// Number of games currently hosted.
    pub fn game_count(&self) -> usize {
        lock(&self.games).len()
    }

    fn seat(&self, game_id: u32, nickname: &str, ctx: &Context) -> GameSession {
        ctx.set_nickname(nickname);
        GameSession {
            games: Arc::clone(&self.games),
            game_id,
            nickname: nickname.to_string(),
            ctx: ctx.clone(),
        }
    }

    fn new_game(
        &self,
        nickname: String,
        size: usize,
        ctx: &Context,
    ) -> Result<GameSession, LobbyError> {
        if nickname.trim().is_empty() {
            return Err(rejected("nickname cannot be empty"));
        }
        if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&size) {
            return Err(rejected("invalid number of players"));
        }

        let mut games = lock(&self.games);
        if games.len() >= GAME_ID_SPACE as usize {
            return Err(rejected("no free game slots"));
        }
        let mut rng = rand::rng();
        let game_id = loop {
            let candidate = rng.random_range(0..GAME_ID_SPACE);
            if !games.contains_key(&candidate) {
                break candidate;
            }
        };

        ctx.reply(Notice::NewGameCreated { game_id });
        let session = self.seat(game_id, &nickname, ctx);
        tracing::info!("{nickname} created game {game_id} for {size} players");

        games.insert(
            game_id,
            Game {
                size,
                started: false,
                players: vec![Player::new(nickname, ctx)],
            },
        );
        Ok(session)
    }

    fn access_game(
        &self,
        game_id: u32,
        nickname: String,
        ctx: &Context,
    ) -> Result<GameSession, LobbyError> {
        if nickname.trim().is_empty() {
            return Err(rejected("nickname cannot be empty"));
        }

        let mut games = lock(&self.games);
        let game = games
            .get_mut(&game_id)
            .ok_or_else(|| rejected(format!("game {game_id} not found")))?;
        if game.started {
            // With a seat left open the peer may still want to Reconnect.
            if game.players.iter().all(Player::holds_seat) {
                return Err(LobbyError::Refused("lobby is full".into()));
            }
            return Err(rejected("game has already started"));
        }
        if game.players.iter().any(|p| p.nickname == nickname) {
            return Err(rejected(format!("nickname {nickname} is already taken")));
        }

        let session = self.seat(game_id, &nickname, ctx);
        game.players.push(Player::new(nickname, ctx));

        let players = game.nicknames();
        tracing::info!("{} joined game {game_id} ({players:?})", session.nickname);
        game.broadcast(&Notice::PlayerJoined {
            nickname: session.nickname.clone(),
            players: players.clone(),
        });

        if game.players.len() == game.size {
            game.started = true;
            tracing::info!("Game {game_id} started");
            game.broadcast(&Notice::GameStarted { game_id, players });
        }
        Ok(session)
    }

    fn reconnect(
        &self,
        game_id: u32,
        nickname: String,
        ctx: &Context,
    ) -> Result<GameSession, LobbyError> {
        let mut games = lock(&self.games);
        let game = games
            .get_mut(&game_id)
            .ok_or_else(|| rejected(format!("game {game_id} not found")))?;
        if !game.started {
            return Err(rejected("game has not started yet"));
        }
        let player = game
            .player_mut(&nickname)
            .ok_or_else(|| rejected(format!("no player named {nickname} in game {game_id}")))?;
        if player.holds_seat() {
            return Err(rejected(format!("{nickname} is still connected")));
        }

        // The old connection may be torn down without having reported it yet;
        // its late disconnect no longer matches the seat.
        player.connected = true;
        player.ctx = ctx.clone();
        let missed = player.backlog.len();
        for notice in player.backlog.drain(..) {
            ctx.reply(notice);
        }
        let session = self.seat(game_id, &nickname, ctx);

        tracing::info!("{nickname} reconnected to game {game_id}, {missed} notices replayed");
        game.broadcast(&Notice::PlayerReconnected { nickname });
        Ok(session)
    }
}

impl Lobby<CodexSchema> for GamesManager {
    type Session = GameSession;

    fn join(&self, request: LobbyRequest, ctx: &Context) -> Result<GameSession, LobbyError> {
        match request {
            LobbyRequest::NewGame { nickname, players } => self.new_game(nickname, players, ctx),
            LobbyRequest::AccessGame { game_id, nickname } => {
                self.access_game(game_id, nickname, ctx)
            }
            LobbyRequest::Reconnect { game_id, nickname } => {
                self.reconnect(game_id, nickname, ctx)
            }
        }
    }
}

/// A player seated at a game.
pub struct GameSession {
    games: Arc<Mutex<Games>>,
    game_id: u32,
    nickname: String,
    ctx: Context,
}

impl Session<CodexSchema> for GameSession {
    fn on_message(&mut self, message: GameMessage) {
        let mut games = lock(&self.games);
        let Some(game) = games.get_mut(&self.game_id) else {
            return;
        };
        match message {
            GameMessage::Chat { text } => game.broadcast(&Notice::ChatMessage {
                from: self.nickname.clone(),
                text,
            }),
            GameMessage::RequestStatus => self.ctx.reply(game.status(self.game_id)),
        }
    }

    fn on_heartbeat(&mut self, _ping: Ping) {
        self.ctx.pong();
    }

    fn on_disconnect(&mut self) {
        let connection = self.ctx.connection_id();
        let mut games = lock(&self.games);
        let Some(game) = games.get_mut(&self.game_id) else {
            return;
        };

        if !game.started {
            // Lobby seats are freed; nobody can reconnect to them.
            let Some(index) = game
                .players
                .iter()
                .position(|p| p.nickname == self.nickname && p.ctx.connection_id() == connection)
            else {
                return;
            };
            game.players.remove(index);
        } else {
            let Some(player) = game.player_mut(&self.nickname) else {
                return;
            };
            // A newer connection already took the seat.
            if player.ctx.connection_id() != connection {
                return;
            }
            player.connected = false;
        }

        tracing::info!("{} left game {}", self.nickname, self.game_id);
        let notice = Notice::PlayerDisconnected {
            nickname: self.nickname.clone(),
        };
        game.broadcast_except(&self.nickname, &notice);

        if !game.players.iter().any(|p| p.connected) {
            games.remove(&self.game_id);
            tracing::info!("Game {} removed, nobody is left at the table", self.game_id);
        }
    }
}
