use crate::lobby::GameId;
use shared::Message;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Identifier assigned to a TCP connection when it is accepted.
pub type ConnId = u64;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    #[error("connection already registered as user {0}")]
    AlreadyRegistered(u32),
}

/// A registered user and everything the server tracks about them.
///
/// The outbox feeds the connection's writer task; dropping a message into it
/// is the only way any part of the server talks to a client.
#[derive(Debug)]
pub struct User {
    pub user_id: u32,
    pub username: String,
    pub conn: ConnId,
    outbox: UnboundedSender<Message>,
    /// Game this user is playing in, if any.
    pub active_game: Option<GameId>,
    /// Game this user has requested but the target has not answered yet.
    pub pending_game: Option<GameId>,
    /// Game this user is watching, if any.
    pub observed_game: Option<GameId>,
}

impl User {
    /// Queues a message for delivery to this user's connection.
    ///
    /// A closed outbox means the writer task is gone and a disconnect event
    /// is already on its way, so the failure is deliberately swallowed.
    pub fn send(&self, message: Message) {
        let _ = self.outbox.send(message);
    }

    /// Whether the user is tied up in a game in any role.
    pub fn is_busy(&self) -> bool {
        self.active_game.is_some() || self.pending_game.is_some() || self.observed_game.is_some()
    }
}

/// Registry of all users currently known to the server.
///
/// Connections only become users once they send a registration message;
/// user ids are handed out sequentially and never reused while the server
/// runs, so a stale id can never address the wrong user.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    users: HashMap<ConnId, User>,
    next_user_id: u32,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
            next_user_id: 0,
        }
    }

    /// Registers the connection under the given name and returns its new id.
    ///
    /// Registration is permanent for the life of the connection; a second
    /// attempt is refused and reports the id already held.
    pub fn register(
        &mut self,
        conn: ConnId,
        username: String,
        outbox: UnboundedSender<Message>,
    ) -> Result<u32, RegisterError> {
        if let Some(user) = self.users.get(&conn) {
            return Err(RegisterError::AlreadyRegistered(user.user_id));
        }

        let user_id = self.next_user_id;
        self.next_user_id += 1;
        self.users.insert(
            conn,
            User {
                user_id,
                username,
                conn,
                outbox,
                active_game: None,
                pending_game: None,
                observed_game: None,
            },
        );
        Ok(user_id)
    }

    /// Looks up the user behind a connection.
    pub fn get(&self, conn: ConnId) -> Option<&User> {
        self.users.get(&conn)
    }

    /// Looks up the user behind a connection for mutation.
    pub fn get_mut(&mut self, conn: ConnId) -> Option<&mut User> {
        self.users.get_mut(&conn)
    }

    /// Finds a user by the id clients address each other with.
    pub fn by_user_id(&self, user_id: u32) -> Option<&User> {
        self.users.values().find(|user| user.user_id == user_id)
    }

    /// Resolves a user id to the connection behind it.
    pub fn conn_of(&self, user_id: u32) -> Option<ConnId> {
        self.by_user_id(user_id).map(|user| user.conn)
    }

    /// Drops the user record for a closed connection, if one existed.
    pub fn remove(&mut self, conn: ConnId) -> Option<User> {
        self.users.remove(&conn)
    }

    /// Iterates over all registered users in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Number of registered users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn register(
        registry: &mut SessionRegistry,
        conn: ConnId,
        name: &str,
    ) -> (u32, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let user_id = registry
            .register(conn, name.to_string(), tx)
            .unwrap();
        (user_id, rx)
    }

    #[test]
    fn test_ids_are_sequential_from_zero() {
        let mut registry = SessionRegistry::new();

        let (first, _rx_a) = register(&mut registry, 10, "awa");
        let (second, _rx_b) = register(&mut registry, 11, "badu");

        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_second_registration_is_refused() {
        let mut registry = SessionRegistry::new();
        let (user_id, _rx) = register(&mut registry, 10, "awa");

        let (tx, _rx2) = mpsc::unbounded_channel();
        let result = registry.register(10, "impostor".to_string(), tx);

        assert_eq!(result, Err(RegisterError::AlreadyRegistered(user_id)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(10).unwrap().username, "awa");
    }

    #[test]
    fn test_lookup_by_user_id_and_conn() {
        let mut registry = SessionRegistry::new();
        let (user_id, _rx) = register(&mut registry, 42, "awa");

        assert_eq!(registry.by_user_id(user_id).unwrap().conn, 42);
        assert_eq!(registry.conn_of(user_id), Some(42));
        assert_eq!(registry.get(42).unwrap().user_id, user_id);
        assert!(registry.by_user_id(999).is_none());
        assert!(registry.get(999).is_none());
    }

    #[test]
    fn test_ids_are_not_reused_after_removal() {
        let mut registry = SessionRegistry::new();
        let (first, _rx_a) = register(&mut registry, 10, "awa");
        registry.remove(10);

        let (second, _rx_b) = register(&mut registry, 20, "badu");

        assert_eq!(first, 0);
        assert_eq!(second, 1);
        assert!(registry.get(10).is_none());
    }

    #[test]
    fn test_send_queues_on_outbox() {
        let mut registry = SessionRegistry::new();
        let (_user_id, mut rx) = register(&mut registry, 10, "awa");

        registry.get(10).unwrap().send(Message::IllegalMove);

        assert_eq!(rx.try_recv(), Ok(Message::IllegalMove));
    }

    #[test]
    fn test_send_tolerates_closed_outbox() {
        let mut registry = SessionRegistry::new();
        let (_user_id, rx) = register(&mut registry, 10, "awa");
        drop(rx);

        // Must not panic; the disconnect event will clean the user up.
        registry.get(10).unwrap().send(Message::IllegalMove);
    }

    #[test]
    fn test_busy_covers_every_role() {
        let mut registry = SessionRegistry::new();
        let (_user_id, _rx) = register(&mut registry, 10, "awa");

        assert!(!registry.get(10).unwrap().is_busy());

        registry.get_mut(10).unwrap().pending_game = Some(0);
        assert!(registry.get(10).unwrap().is_busy());

        let user = registry.get_mut(10).unwrap();
        user.pending_game = None;
        user.active_game = Some(0);
        assert!(registry.get(10).unwrap().is_busy());

        let user = registry.get_mut(10).unwrap();
        user.active_game = None;
        user.observed_game = Some(0);
        assert!(registry.get(10).unwrap().is_busy());
    }
}
