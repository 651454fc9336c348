use crate::session::{ConnId, SessionRegistry};
use log::{debug, error, info, warn};
use shared::{GameSnapshot, Message, Side};
use std::collections::HashMap;

/// Identifier assigned to a game when the challenge is issued.
pub type GameId = u64;

/// A match between two players, from proposition to completion.
///
/// The requester always sits on the Bottom side, so the player array is
/// indexed by `Side`. Observers ride along and receive every broadcast the
/// players do.
struct Game {
    players: [ConnId; 2],
    snapshot: GameSnapshot,
    observers: Vec<ConnId>,
}

impl Game {
    fn side_of(&self, conn: ConnId) -> Option<Side> {
        if self.players[Side::Bottom as usize] == conn {
            Some(Side::Bottom)
        } else if self.players[Side::Top as usize] == conn {
            Some(Side::Top)
        } else {
            None
        }
    }
}

/// All matchmaking and in-game state, driven entirely by the event loop.
///
/// Every handler takes the session registry alongside the message because a
/// message's effects almost always span both: a move mutates a game but the
/// resulting update is delivered through user outboxes. Nothing here is
/// shared across tasks, so there are no locks to take.
pub struct Lobby {
    games: HashMap<GameId, Game>,
    next_game_id: GameId,
    max_observers: usize,
}

impl Lobby {
    /// Creates an empty lobby allowing `max_observers` watchers per game.
    pub fn new(max_observers: usize) -> Self {
        Self {
            games: HashMap::new(),
            next_game_id: 0,
            max_observers,
        }
    }

    /// Handles a challenge from `conn` towards the user called `target_id`.
    ///
    /// A challenge that cannot proceed (unknown target, either party already
    /// tied up, or a self-challenge) is answered with a declined
    /// `MatchResponse` so the requester is never left waiting.
    pub fn handle_match_request(
        &mut self,
        registry: &mut SessionRegistry,
        conn: ConnId,
        target_id: u32,
    ) {
        let Some(requester) = registry.get(conn) else {
            warn!("Match request from unregistered connection {}", conn);
            return;
        };

        if requester.is_busy() {
            warn!(
                "User {} requested a match while already tied up",
                requester.user_id
            );
            send_to(registry, conn, Message::MatchResponse { accept: false });
            return;
        }
        let requester_id = requester.user_id;
        let requester_name = requester.username.clone();

        let target_conn = match registry.by_user_id(target_id) {
            Some(target) if target.conn == conn => {
                warn!("User {} tried to challenge themselves", requester_id);
                None
            }
            Some(target) if target.is_busy() => {
                debug!("Match request denied: user {} is tied up", target_id);
                None
            }
            Some(target) => Some(target.conn),
            None => {
                warn!("Match request for unknown user {}", target_id);
                None
            }
        };
        let Some(target_conn) = target_conn else {
            send_to(registry, conn, Message::MatchResponse { accept: false });
            return;
        };

        let game_id = self.next_game_id;
        self.next_game_id += 1;
        self.games.insert(
            game_id,
            Game {
                players: [conn, target_conn],
                snapshot: GameSnapshot::new(),
                observers: Vec::new(),
            },
        );
        if let Some(user) = registry.get_mut(conn) {
            user.pending_game = Some(game_id);
        }
        if let Some(user) = registry.get_mut(target_conn) {
            user.pending_game = Some(game_id);
        }

        info!(
            "User {} challenged user {} (game {})",
            requester_id, target_id, game_id
        );
        send_to(
            registry,
            target_conn,
            Message::MatchProposition {
                requester_id,
                requester_name,
            },
        );
    }

    /// Handles the challenged player's answer to a pending proposition.
    ///
    /// Acceptance starts the game on a fresh board with the requester to
    /// move; a decline is forwarded to the requester and the proposition is
    /// discarded. Answers from users with nothing pending (for instance
    /// after the requester already cancelled) are dropped.
    pub fn handle_match_response(
        &mut self,
        registry: &mut SessionRegistry,
        conn: ConnId,
        accept: bool,
    ) {
        let Some(responder) = registry.get(conn) else {
            warn!("Match response from unregistered connection {}", conn);
            return;
        };
        let responder_id = responder.user_id;
        let Some(game_id) = responder.pending_game else {
            warn!(
                "Match response from user {} with no pending match",
                responder_id
            );
            return;
        };
        let Some(game) = self.games.get_mut(&game_id) else {
            warn!("Pending game {} has no record", game_id);
            return;
        };
        if game.players[Side::Top as usize] != conn {
            warn!(
                "User {} answered a proposition they made themselves",
                responder_id
            );
            return;
        }
        let requester_conn = game.players[Side::Bottom as usize];

        if !accept {
            self.games.remove(&game_id);
            for player in [requester_conn, conn] {
                if let Some(user) = registry.get_mut(player) {
                    user.pending_game = None;
                }
            }
            info!("User {} declined game {}", responder_id, game_id);
            send_to(
                registry,
                requester_conn,
                Message::MatchResponse { accept: false },
            );
            return;
        }

        let snapshot = GameSnapshot::new();
        game.snapshot = snapshot;
        for player in [requester_conn, conn] {
            if let Some(user) = registry.get_mut(player) {
                user.pending_game = None;
                user.active_game = Some(game_id);
            }
        }

        let (_, requester_name) = user_label(registry, requester_conn);
        let (_, responder_name) = user_label(registry, conn);
        info!(
            "Game {} started: {} (bottom) vs {} (top)",
            game_id, requester_name, responder_name
        );
        send_to(
            registry,
            requester_conn,
            Message::GameStart {
                opponent_name: responder_name,
                side: Side::Bottom,
                snapshot,
            },
        );
        send_to(
            registry,
            conn,
            Message::GameStart {
                opponent_name: requester_name,
                side: Side::Top,
                snapshot,
            },
        );
    }

    /// Withdraws from whichever game `conn` is part of, pending or active.
    ///
    /// Everyone else attached to the game (counterpart and observers) is
    /// told through a `MatchCancellation`.
    pub fn handle_match_cancellation(&mut self, registry: &mut SessionRegistry, conn: ConnId) {
        let Some(user) = registry.get(conn) else {
            warn!("Cancellation from unregistered connection {}", conn);
            return;
        };
        if user.active_game.is_some() && user.pending_game.is_some() {
            // A user can never be playing and awaiting an answer at once;
            // this is server state corruption, not client misuse.
            error!(
                "User {} holds both an active and a pending game",
                user.user_id
            );
            return;
        }
        let Some(game_id) = user.active_game.or(user.pending_game) else {
            warn!(
                "Cancellation from user {} with nothing to cancel",
                user.user_id
            );
            return;
        };
        info!("User {} cancelled game {}", user.user_id, game_id);
        self.cancel_game(registry, game_id, Some(conn));
    }

    /// Applies a move from `conn` to their active game.
    ///
    /// The mover alone hears about a rejected move (`IllegalMove`); a legal
    /// one is applied and the new position fanned out to both players and
    /// every observer. A winning move ends the game instead with `GameEnd`.
    pub fn handle_game_move(&mut self, registry: &mut SessionRegistry, conn: ConnId, house: i32) {
        let Some(user) = registry.get(conn) else {
            warn!("Move from unregistered connection {}", conn);
            return;
        };
        let user_id = user.user_id;
        let Some(game_id) = user.active_game else {
            warn!("Move from user {} who is not in a game", user_id);
            return;
        };
        let Some(game) = self.games.get_mut(&game_id) else {
            warn!("Active game {} has no record", game_id);
            return;
        };
        let Some(side) = game.side_of(conn) else {
            warn!("User {} is not seated in game {}", user_id, game_id);
            return;
        };

        if game.snapshot.turn != side {
            debug!("User {} moved out of turn in game {}", user_id, game_id);
            send_to(registry, conn, Message::IllegalMove);
            return;
        }
        let Ok(house) = usize::try_from(house) else {
            debug!("User {} played nonexistent house {}", user_id, house);
            send_to(registry, conn, Message::IllegalMove);
            return;
        };

        match game.snapshot.apply_move(side, house) {
            Ok(outcome) => {
                game.snapshot = outcome.snapshot;
                debug!("User {} played house {} in game {}", user_id, house, game_id);
                match outcome.winner {
                    Some(winner) => self.finish_game(registry, game_id, winner),
                    None => {
                        if let Some(game) = self.games.get(&game_id) {
                            broadcast(
                                registry,
                                game,
                                &Message::GameUpdate {
                                    snapshot: outcome.snapshot,
                                },
                                None,
                            );
                        }
                    }
                }
            }
            Err(err) => {
                debug!("User {} attempted an illegal move: {}", user_id, err);
                send_to(registry, conn, Message::IllegalMove);
            }
        }
    }

    /// Relays a chat line into the game `conn` is playing in or watching.
    ///
    /// The server stamps the sender's registered name and id onto the
    /// message before fanning it out, so clients cannot impersonate each
    /// other. The sender does not get their own line echoed back.
    pub fn handle_chat(&mut self, registry: &mut SessionRegistry, conn: ConnId, text: String) {
        let Some(user) = registry.get(conn) else {
            warn!("Chat from unregistered connection {}", conn);
            return;
        };
        let Some(game_id) = user.active_game.or(user.observed_game) else {
            debug!("Chat from user {} outside any game", user.user_id);
            return;
        };
        let message = Message::Chat {
            text,
            sender_name: user.username.clone(),
            sender_id: user.user_id,
        };
        if let Some(game) = self.games.get(&game_id) {
            broadcast(registry, game, &message, Some(conn));
        }
    }

    /// Attaches `conn` as an observer of the game `target_id` is playing.
    ///
    /// The newcomer receives an `ObservationStart` with both players and the
    /// current position; everyone already in the game sees a watching
    /// notice. Requests that cannot be honored (watcher tied up, target not
    /// playing, observer seats full) are dropped.
    pub fn handle_observe_request(
        &mut self,
        registry: &mut SessionRegistry,
        conn: ConnId,
        target_id: u32,
    ) {
        let Some(watcher) = registry.get(conn) else {
            warn!("Observation request from unregistered connection {}", conn);
            return;
        };
        if watcher.is_busy() {
            warn!("User {} asked to observe while already tied up", watcher.user_id);
            return;
        }
        let watcher_id = watcher.user_id;
        let watcher_name = watcher.username.clone();

        let Some(target) = registry.by_user_id(target_id) else {
            warn!("Observation request for unknown user {}", target_id);
            return;
        };
        let Some(game_id) = target.active_game else {
            debug!("User {} is not playing; nothing to observe", target_id);
            return;
        };
        let Some(game) = self.games.get_mut(&game_id) else {
            warn!("Active game {} has no record", game_id);
            return;
        };
        if game.observers.len() >= self.max_observers {
            warn!(
                "Game {} already has {} observers; turning user {} away",
                game_id,
                game.observers.len(),
                watcher_id
            );
            return;
        }
        game.observers.push(conn);
        let bottom_conn = game.players[Side::Bottom as usize];
        let top_conn = game.players[Side::Top as usize];
        let snapshot = game.snapshot;

        if let Some(user) = registry.get_mut(conn) {
            user.observed_game = Some(game_id);
        }
        info!("User {} is watching game {}", watcher_id, game_id);

        let notice = Message::Chat {
            text: format!("* {} is now watching", watcher_name),
            sender_name: watcher_name,
            sender_id: watcher_id,
        };
        if let Some(game) = self.games.get(&game_id) {
            broadcast(registry, game, &notice, Some(conn));
        }

        let (bottom_id, bottom_name) = user_label(registry, bottom_conn);
        let (top_id, top_name) = user_label(registry, top_conn);
        send_to(
            registry,
            conn,
            Message::ObservationStart {
                bottom_name,
                top_name,
                bottom_id,
                top_id,
                snapshot,
            },
        );
    }

    /// Detaches `conn` from the game they are watching.
    pub fn handle_stop_observing(&mut self, registry: &mut SessionRegistry, conn: ConnId) {
        let Some(user) = registry.get(conn) else {
            warn!("Stop-observing from unregistered connection {}", conn);
            return;
        };
        let Some(game_id) = user.observed_game else {
            warn!("Stop-observing from user {} who is not watching", user.user_id);
            return;
        };
        self.detach_observer(registry, conn, game_id);
    }

    /// Unwinds everything tied to a closed connection.
    ///
    /// An active or pending game is cancelled for everyone else in it, an
    /// observed game merely loses a watcher, and finally the user record
    /// itself is dropped. Safe to call for connections that never
    /// registered.
    pub fn teardown(&mut self, registry: &mut SessionRegistry, conn: ConnId) {
        let Some(user) = registry.get(conn) else {
            return;
        };
        let user_id = user.user_id;
        let game = user.active_game.or(user.pending_game);
        let observed = user.observed_game;

        if let Some(game_id) = game {
            self.cancel_game(registry, game_id, Some(conn));
        }
        if let Some(game_id) = observed {
            self.detach_observer(registry, conn, game_id);
        }
        registry.remove(conn);
        info!("User {} removed after disconnect", user_id);
    }

    /// Number of games currently tracked, pending propositions included.
    pub fn game_count(&self) -> usize {
        self.games.len()
    }

    fn cancel_game(&mut self, registry: &mut SessionRegistry, game_id: GameId, skip: Option<ConnId>) {
        let Some(game) = self.games.remove(&game_id) else {
            return;
        };
        for &player in &game.players {
            if let Some(user) = registry.get_mut(player) {
                user.active_game = None;
                user.pending_game = None;
            }
        }
        for &observer in &game.observers {
            if let Some(user) = registry.get_mut(observer) {
                user.observed_game = None;
            }
        }
        broadcast(registry, &game, &Message::MatchCancellation, skip);
    }

    fn finish_game(&mut self, registry: &mut SessionRegistry, game_id: GameId, winner: Side) {
        let Some(game) = self.games.remove(&game_id) else {
            return;
        };
        for &player in &game.players {
            if let Some(user) = registry.get_mut(player) {
                user.active_game = None;
            }
        }
        for &observer in &game.observers {
            if let Some(user) = registry.get_mut(observer) {
                user.observed_game = None;
            }
        }
        info!("Game {} won by the {:?} side", game_id, winner);
        broadcast(
            registry,
            &game,
            &Message::GameEnd {
                winner,
                snapshot: game.snapshot,
            },
            None,
        );
    }

    fn detach_observer(&mut self, registry: &mut SessionRegistry, conn: ConnId, game_id: GameId) {
        if let Some(user) = registry.get_mut(conn) {
            user.observed_game = None;
        }
        let Some(game) = self.games.get_mut(&game_id) else {
            return;
        };
        game.observers.retain(|&observer| observer != conn);

        let (watcher_id, watcher_name) = user_label(registry, conn);
        info!("User {} stopped watching game {}", watcher_id, game_id);
        let notice = Message::Chat {
            text: format!("* {} stopped watching", watcher_name),
            sender_name: watcher_name,
            sender_id: watcher_id,
        };
        if let Some(game) = self.games.get(&game_id) {
            broadcast(registry, game, &notice, Some(conn));
        }
    }
}

/// Queues a message for one connection, ignoring ones that vanished.
fn send_to(registry: &SessionRegistry, conn: ConnId, message: Message) {
    if let Some(user) = registry.get(conn) {
        user.send(message);
    }
}

/// Delivers a message to both players and every observer of a game.
fn broadcast(registry: &SessionRegistry, game: &Game, message: &Message, skip: Option<ConnId>) {
    for &conn in game.players.iter().chain(game.observers.iter()) {
        if Some(conn) == skip {
            continue;
        }
        if let Some(user) = registry.get(conn) {
            user.send(message.clone());
        }
    }
}

fn user_label(registry: &SessionRegistry, conn: ConnId) -> (u32, String) {
    registry
        .get(conn)
        .map(|user| (user.user_id, user.username.clone()))
        .unwrap_or((0, String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Board;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct TestPeer {
        conn: ConnId,
        user_id: u32,
        rx: UnboundedReceiver<Message>,
    }

    impl TestPeer {
        fn drain(&mut self) -> Vec<Message> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                out.push(message);
            }
            out
        }
    }

    fn add_user(registry: &mut SessionRegistry, conn: ConnId, name: &str) -> TestPeer {
        let (tx, rx) = mpsc::unbounded_channel();
        let user_id = registry.register(conn, name.to_string(), tx).unwrap();
        TestPeer { conn, user_id, rx }
    }

    /// Challenges b from a and accepts, discarding the setup traffic.
    fn start_game(
        lobby: &mut Lobby,
        registry: &mut SessionRegistry,
        a: &mut TestPeer,
        b: &mut TestPeer,
    ) {
        lobby.handle_match_request(registry, a.conn, b.user_id);
        lobby.handle_match_response(registry, b.conn, true);
        a.drain();
        b.drain();
    }

    fn active_game_of(registry: &SessionRegistry, conn: ConnId) -> GameId {
        registry.get(conn).unwrap().active_game.unwrap()
    }

    #[test]
    fn test_match_request_reaches_target() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");

        lobby.handle_match_request(&mut registry, a.conn, b.user_id);

        assert_eq!(
            b.drain(),
            vec![Message::MatchProposition {
                requester_id: a.user_id,
                requester_name: "awa".to_string(),
            }]
        );
        assert!(a.drain().is_empty());
        assert!(registry.get(a.conn).unwrap().pending_game.is_some());
        assert!(registry.get(b.conn).unwrap().pending_game.is_some());
    }

    #[test]
    fn test_self_challenge_is_denied() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");

        lobby.handle_match_request(&mut registry, a.conn, a.user_id);

        assert_eq!(a.drain(), vec![Message::MatchResponse { accept: false }]);
        assert_eq!(lobby.game_count(), 0);
        assert!(!registry.get(a.conn).unwrap().is_busy());
    }

    #[test]
    fn test_request_to_unknown_user_is_denied() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");

        lobby.handle_match_request(&mut registry, a.conn, 999);

        assert_eq!(a.drain(), vec![Message::MatchResponse { accept: false }]);
        assert_eq!(lobby.game_count(), 0);
    }

    #[test]
    fn test_request_to_busy_user_is_denied() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        let mut c = add_user(&mut registry, 3, "chike");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);

        lobby.handle_match_request(&mut registry, c.conn, a.user_id);

        assert_eq!(c.drain(), vec![Message::MatchResponse { accept: false }]);
        assert!(a.drain().is_empty());
        assert_eq!(lobby.game_count(), 1);
    }

    #[test]
    fn test_accept_starts_game_on_fresh_board() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");

        lobby.handle_match_request(&mut registry, a.conn, b.user_id);
        b.drain();
        lobby.handle_match_response(&mut registry, b.conn, true);

        assert_eq!(
            a.drain(),
            vec![Message::GameStart {
                opponent_name: "badu".to_string(),
                side: Side::Bottom,
                snapshot: GameSnapshot::new(),
            }]
        );
        assert_eq!(
            b.drain(),
            vec![Message::GameStart {
                opponent_name: "awa".to_string(),
                side: Side::Top,
                snapshot: GameSnapshot::new(),
            }]
        );
        assert!(registry.get(a.conn).unwrap().active_game.is_some());
        assert!(registry.get(a.conn).unwrap().pending_game.is_none());
        assert_eq!(
            registry.get(a.conn).unwrap().active_game,
            registry.get(b.conn).unwrap().active_game
        );
    }

    #[test]
    fn test_decline_is_forwarded_and_frees_both() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");

        lobby.handle_match_request(&mut registry, a.conn, b.user_id);
        b.drain();
        lobby.handle_match_response(&mut registry, b.conn, false);

        assert_eq!(a.drain(), vec![Message::MatchResponse { accept: false }]);
        assert!(b.drain().is_empty());
        assert_eq!(lobby.game_count(), 0);
        assert!(!registry.get(a.conn).unwrap().is_busy());
        assert!(!registry.get(b.conn).unwrap().is_busy());

        // Both are free again, so the same challenge can be reissued.
        lobby.handle_match_request(&mut registry, a.conn, b.user_id);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn test_requester_cannot_answer_own_proposition() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");

        lobby.handle_match_request(&mut registry, a.conn, b.user_id);
        b.drain();
        lobby.handle_match_response(&mut registry, a.conn, true);

        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
        assert!(registry.get(a.conn).unwrap().active_game.is_none());
    }

    #[test]
    fn test_move_fans_out_to_both_players() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);

        lobby.handle_game_move(&mut registry, a.conn, 2);

        let expected = GameSnapshot {
            board: Board {
                houses: [4, 4, 0, 5, 5, 5, 5, 4, 4, 4, 4, 4],
            },
            turn: Side::Top,
            points: [0, 0],
        };
        assert_eq!(a.drain(), vec![Message::GameUpdate { snapshot: expected }]);
        assert_eq!(b.drain(), vec![Message::GameUpdate { snapshot: expected }]);
    }

    #[test]
    fn test_move_out_of_turn_is_rejected() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);

        lobby.handle_game_move(&mut registry, b.conn, 8);

        assert_eq!(b.drain(), vec![Message::IllegalMove]);
        assert!(a.drain().is_empty());
    }

    #[test]
    fn test_illegal_house_is_rejected_without_state_change() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);

        lobby.handle_game_move(&mut registry, a.conn, 99);
        assert_eq!(a.drain(), vec![Message::IllegalMove]);
        lobby.handle_game_move(&mut registry, a.conn, -1);
        assert_eq!(a.drain(), vec![Message::IllegalMove]);
        lobby.handle_game_move(&mut registry, a.conn, 8);
        assert_eq!(a.drain(), vec![Message::IllegalMove]);
        assert!(b.drain().is_empty());

        // Still the requester's turn; a legal move goes through.
        lobby.handle_game_move(&mut registry, a.conn, 0);
        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn test_winning_move_ends_game_for_everyone() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        let mut c = add_user(&mut registry, 3, "chike");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);
        let game_id = active_game_of(&registry, a.conn);
        lobby.handle_observe_request(&mut registry, c.conn, a.user_id);
        a.drain();
        b.drain();
        c.drain();

        // Put the requester one capture away from the winning threshold.
        let staged = GameSnapshot {
            board: Board {
                houses: [0, 0, 1, 1, 0, 0, 4, 4, 4, 4, 4, 3],
            },
            turn: Side::Bottom,
            points: [23, 0],
        };
        lobby.games.get_mut(&game_id).unwrap().snapshot = staged;

        lobby.handle_game_move(&mut registry, a.conn, 2);

        let final_snapshot = GameSnapshot {
            board: Board {
                houses: [0, 0, 0, 0, 0, 0, 4, 4, 4, 4, 4, 3],
            },
            turn: Side::Top,
            points: [25, 0],
        };
        let expected = Message::GameEnd {
            winner: Side::Bottom,
            snapshot: final_snapshot,
        };
        assert_eq!(a.drain(), vec![expected.clone()]);
        assert_eq!(b.drain(), vec![expected.clone()]);
        assert_eq!(c.drain(), vec![expected]);
        assert_eq!(lobby.game_count(), 0);
        assert!(!registry.get(a.conn).unwrap().is_busy());
        assert!(!registry.get(b.conn).unwrap().is_busy());
        assert!(!registry.get(c.conn).unwrap().is_busy());
    }

    #[test]
    fn test_cancel_pending_notifies_target() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");

        lobby.handle_match_request(&mut registry, a.conn, b.user_id);
        b.drain();
        lobby.handle_match_cancellation(&mut registry, a.conn);

        assert_eq!(b.drain(), vec![Message::MatchCancellation]);
        assert!(a.drain().is_empty());
        assert_eq!(lobby.game_count(), 0);
        assert!(!registry.get(b.conn).unwrap().is_busy());
    }

    #[test]
    fn test_cancel_active_notifies_opponent_and_observers() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        let mut c = add_user(&mut registry, 3, "chike");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);
        lobby.handle_observe_request(&mut registry, c.conn, a.user_id);
        a.drain();
        b.drain();
        c.drain();

        lobby.handle_match_cancellation(&mut registry, b.conn);

        assert_eq!(a.drain(), vec![Message::MatchCancellation]);
        assert_eq!(c.drain(), vec![Message::MatchCancellation]);
        assert!(b.drain().is_empty());
        assert_eq!(lobby.game_count(), 0);
        assert!(!registry.get(c.conn).unwrap().is_busy());
    }

    #[test]
    fn test_stale_accept_after_cancel_is_dropped() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");

        lobby.handle_match_request(&mut registry, a.conn, b.user_id);
        lobby.handle_match_cancellation(&mut registry, a.conn);
        b.drain();

        lobby.handle_match_response(&mut registry, b.conn, true);

        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
        assert_eq!(lobby.game_count(), 0);

        // A fresh challenge still works in either direction.
        lobby.handle_match_request(&mut registry, b.conn, a.user_id);
        assert_eq!(a.drain().len(), 1);
    }

    #[test]
    fn test_observer_gets_position_and_players_get_notice() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        let mut c = add_user(&mut registry, 3, "chike");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);
        lobby.handle_game_move(&mut registry, a.conn, 2);
        a.drain();
        b.drain();

        lobby.handle_observe_request(&mut registry, c.conn, b.user_id);

        assert_eq!(
            c.drain(),
            vec![Message::ObservationStart {
                bottom_name: "awa".to_string(),
                top_name: "badu".to_string(),
                bottom_id: a.user_id,
                top_id: b.user_id,
                snapshot: GameSnapshot {
                    board: Board {
                        houses: [4, 4, 0, 5, 5, 5, 5, 4, 4, 4, 4, 4],
                    },
                    turn: Side::Top,
                    points: [0, 0],
                },
            }]
        );
        let notice = Message::Chat {
            text: "* chike is now watching".to_string(),
            sender_name: "chike".to_string(),
            sender_id: c.user_id,
        };
        assert_eq!(a.drain(), vec![notice.clone()]);
        assert_eq!(b.drain(), vec![notice]);
        assert_eq!(
            registry.get(c.conn).unwrap().observed_game,
            registry.get(a.conn).unwrap().active_game
        );
    }

    #[test]
    fn test_observer_capacity_is_enforced() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(1);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        let mut c = add_user(&mut registry, 3, "chike");
        let mut d = add_user(&mut registry, 4, "didi");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);
        lobby.handle_observe_request(&mut registry, c.conn, a.user_id);
        a.drain();
        b.drain();
        c.drain();

        lobby.handle_observe_request(&mut registry, d.conn, a.user_id);

        assert!(d.drain().is_empty());
        assert!(a.drain().is_empty());
        assert!(registry.get(d.conn).unwrap().observed_game.is_none());
    }

    #[test]
    fn test_observer_receives_updates_and_chat() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        let mut c = add_user(&mut registry, 3, "chike");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);
        lobby.handle_observe_request(&mut registry, c.conn, a.user_id);
        a.drain();
        b.drain();
        c.drain();

        lobby.handle_game_move(&mut registry, a.conn, 0);
        lobby.handle_chat(&mut registry, b.conn, "nice one".to_string());

        let received = c.drain();
        assert_eq!(received.len(), 2);
        assert!(matches!(received[0], Message::GameUpdate { .. }));
        assert_eq!(
            received[1],
            Message::Chat {
                text: "nice one".to_string(),
                sender_name: "badu".to_string(),
                sender_id: b.user_id,
            }
        );
    }

    #[test]
    fn test_chat_from_observer_reaches_players_but_not_sender() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        let mut c = add_user(&mut registry, 3, "chike");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);
        lobby.handle_observe_request(&mut registry, c.conn, a.user_id);
        a.drain();
        b.drain();
        c.drain();

        lobby.handle_chat(&mut registry, c.conn, "good luck both".to_string());

        let expected = Message::Chat {
            text: "good luck both".to_string(),
            sender_name: "chike".to_string(),
            sender_id: c.user_id,
        };
        assert_eq!(a.drain(), vec![expected.clone()]);
        assert_eq!(b.drain(), vec![expected]);
        assert!(c.drain().is_empty());
    }

    #[test]
    fn test_chat_outside_any_game_is_dropped() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");

        lobby.handle_chat(&mut registry, a.conn, "anyone there".to_string());

        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
    }

    #[test]
    fn test_stop_observing_detaches_and_notifies() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        let mut c = add_user(&mut registry, 3, "chike");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);
        lobby.handle_observe_request(&mut registry, c.conn, a.user_id);
        a.drain();
        b.drain();
        c.drain();

        lobby.handle_stop_observing(&mut registry, c.conn);

        let notice = Message::Chat {
            text: "* chike stopped watching".to_string(),
            sender_name: "chike".to_string(),
            sender_id: c.user_id,
        };
        assert_eq!(a.drain(), vec![notice.clone()]);
        assert_eq!(b.drain(), vec![notice]);
        assert!(c.drain().is_empty());
        assert!(!registry.get(c.conn).unwrap().is_busy());

        // Detached observers no longer hear game traffic.
        lobby.handle_game_move(&mut registry, a.conn, 0);
        assert!(c.drain().is_empty());
    }

    #[test]
    fn test_observer_counts_as_busy_for_matchmaking() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        let mut c = add_user(&mut registry, 3, "chike");
        let mut d = add_user(&mut registry, 4, "didi");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);
        lobby.handle_observe_request(&mut registry, c.conn, a.user_id);
        a.drain();
        b.drain();
        c.drain();

        // Challenging an observer is refused, as is an observer challenging.
        lobby.handle_match_request(&mut registry, d.conn, c.user_id);
        assert_eq!(d.drain(), vec![Message::MatchResponse { accept: false }]);
        assert!(c.drain().is_empty());

        lobby.handle_match_request(&mut registry, c.conn, d.user_id);
        assert_eq!(c.drain(), vec![Message::MatchResponse { accept: false }]);
        assert!(d.drain().is_empty());
    }

    #[test]
    fn test_disconnect_tears_down_active_game() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        let mut c = add_user(&mut registry, 3, "chike");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);
        lobby.handle_observe_request(&mut registry, c.conn, a.user_id);
        a.drain();
        b.drain();
        c.drain();

        lobby.teardown(&mut registry, a.conn);

        assert_eq!(b.drain(), vec![Message::MatchCancellation]);
        assert_eq!(c.drain(), vec![Message::MatchCancellation]);
        assert!(registry.get(a.conn).is_none());
        assert_eq!(lobby.game_count(), 0);
        assert!(!registry.get(b.conn).unwrap().is_busy());
        assert!(!registry.get(c.conn).unwrap().is_busy());

        // The survivor can be challenged again right away.
        lobby.handle_match_request(&mut registry, c.conn, b.user_id);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn test_disconnect_with_pending_proposition_notifies_target() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");

        lobby.handle_match_request(&mut registry, a.conn, b.user_id);
        b.drain();
        lobby.teardown(&mut registry, a.conn);

        assert_eq!(b.drain(), vec![Message::MatchCancellation]);
        assert!(!registry.get(b.conn).unwrap().is_busy());
        assert_eq!(lobby.game_count(), 0);
    }

    #[test]
    fn test_observer_disconnect_leaves_game_running() {
        let mut registry = SessionRegistry::new();
        let mut lobby = Lobby::new(4);
        let mut a = add_user(&mut registry, 1, "awa");
        let mut b = add_user(&mut registry, 2, "badu");
        let mut c = add_user(&mut registry, 3, "chike");
        start_game(&mut lobby, &mut registry, &mut a, &mut b);
        lobby.handle_observe_request(&mut registry, c.conn, a.user_id);
        a.drain();
        b.drain();
        c.drain();

        lobby.teardown(&mut registry, c.conn);

        let notice = Message::Chat {
            text: "* chike stopped watching".to_string(),
            sender_name: "chike".to_string(),
            sender_id: c.user_id,
        };
        assert_eq!(a.drain(), vec![notice.clone()]);
        assert_eq!(b.drain(), vec![notice]);
        assert_eq!(lobby.game_count(), 1);
        assert!(registry.get(a.conn).unwrap().active_game.is_some());

        // Play continues for the two players.
        lobby.handle_game_move(&mut registry, a.conn, 0);
        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
    }
}
