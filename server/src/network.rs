//! Server network layer accepting TCP connections and running the event loop

use crate::lobby::Lobby;
use crate::session::{ConnId, RegisterError, SessionRegistry};
use log::{debug, info, warn};
use shared::{FrameBuffer, Message, UserEntry, READ_BUFFER_SIZE};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Event funneled from a per-connection reader task into the main loop.
#[derive(Debug)]
enum ServerEvent {
    MessageReceived { conn: ConnId, message: Message },
    Disconnected { conn: ConnId },
}

/// The TCP front of the game server.
///
/// Each accepted connection gets a reader task (raw bytes in, decoded
/// messages out) and a writer task (queued messages in, raw bytes out),
/// while every piece of session and game state lives in the single task
/// running `run`. The readers funnel everything through one event channel,
/// so handlers mutate state without locking and effects are applied in
/// arrival order.
pub struct Server {
    listener: TcpListener,
    registry: SessionRegistry,
    lobby: Lobby,
    max_clients: usize,
    connections: HashMap<ConnId, UnboundedSender<Message>>,
    next_conn_id: ConnId,
    event_tx: UnboundedSender<ServerEvent>,
    event_rx: UnboundedReceiver<ServerEvent>,
}

impl Server {
    pub async fn new(
        addr: &str,
        max_clients: usize,
        max_observers: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener,
            registry: SessionRegistry::new(),
            lobby: Lobby::new(max_observers),
            max_clients,
            connections: HashMap::new(),
            next_conn_id: 0,
            event_tx,
            event_rx,
        })
    }

    /// Address the listener actually bound to, useful with port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Main server loop, serving until the surrounding task is cancelled.
    ///
    /// Alternates between accepting new connections and draining the event
    /// channel fed by the connection readers.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept_connection(stream, addr),
                        Err(e) => warn!("Failed to accept a connection: {}", e),
                    }
                },

                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event);
                },
            }
        }
    }

    /// Admits a freshly accepted connection or turns it away when full.
    ///
    /// Turning away means dropping the stream; the peer sees the socket
    /// close before any message arrives.
    fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.connections.len() >= self.max_clients {
            warn!(
                "Turning away {}: server is full with {} connections",
                addr,
                self.connections.len()
            );
            return;
        }

        let conn = self.next_conn_id;
        self.next_conn_id += 1;

        let (read_half, write_half) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        self.connections.insert(conn, outbox_tx);

        info!("Client connected from {} as connection {}", addr, conn);
        spawn_connection_reader(conn, read_half, self.event_tx.clone());
        spawn_connection_writer(conn, write_half, outbox_rx);
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived { conn, message } => self.dispatch(conn, message),
            ServerEvent::Disconnected { conn } => {
                info!("Connection {} closed", conn);
                self.lobby.teardown(&mut self.registry, conn);
                self.connections.remove(&conn);
            }
        }
    }

    /// Routes one decoded message to the matching handler.
    ///
    /// Messages only the server may send (user lists, game updates and the
    /// like) are meaningless coming from a client and are dropped.
    fn dispatch(&mut self, conn: ConnId, message: Message) {
        match message {
            Message::UserCreation { username } => self.handle_user_creation(conn, username),
            Message::GetUserList => self.handle_user_list(conn),
            Message::MatchRequest { target_id } => {
                self.lobby
                    .handle_match_request(&mut self.registry, conn, target_id)
            }
            Message::MatchResponse { accept } => {
                self.lobby
                    .handle_match_response(&mut self.registry, conn, accept)
            }
            Message::MatchCancellation => {
                self.lobby.handle_match_cancellation(&mut self.registry, conn)
            }
            Message::GameMove { house } => {
                self.lobby.handle_game_move(&mut self.registry, conn, house)
            }
            Message::Chat { text, .. } => self.lobby.handle_chat(&mut self.registry, conn, text),
            Message::ObserveRequest { target_id } => {
                self.lobby
                    .handle_observe_request(&mut self.registry, conn, target_id)
            }
            Message::StopObserving => self.lobby.handle_stop_observing(&mut self.registry, conn),
            other => {
                warn!(
                    "Connection {} sent a message only the server may send: {:?}",
                    conn, other
                );
            }
        }
    }

    fn handle_user_creation(&mut self, conn: ConnId, username: String) {
        let Some(outbox) = self.connections.get(&conn) else {
            warn!("Registration from unknown connection {}", conn);
            return;
        };

        match self.registry.register(conn, username, outbox.clone()) {
            Ok(user_id) => {
                info!("Connection {} registered as user {}", conn, user_id);
                if let Some(user) = self.registry.get(conn) {
                    user.send(Message::UserRegistration { user_id });
                }
            }
            Err(RegisterError::AlreadyRegistered(user_id)) => {
                warn!(
                    "Connection {} tried to register again (already user {})",
                    conn, user_id
                );
            }
        }
    }

    /// Answers a user list request with everyone except the requester.
    fn handle_user_list(&self, conn: ConnId) {
        let Some(requester) = self.registry.get(conn) else {
            warn!("User list request from unregistered connection {}", conn);
            return;
        };

        let mut users: Vec<UserEntry> = self
            .registry
            .iter()
            .filter(|user| user.conn != conn)
            .map(|user| UserEntry {
                username: user.username.clone(),
                user_id: user.user_id,
                in_game: user.active_game.is_some(),
            })
            .collect();
        users.sort_by_key(|user| user.user_id);

        debug!("Sending {} users to user {}", users.len(), requester.user_id);
        requester.send(Message::SendUserList { users });
    }
}

/// Pumps bytes off the socket, cuts them into frames and forwards every
/// decoded message to the event loop. Reports the disconnect when the peer
/// goes away or the main loop does.
fn spawn_connection_reader(
    conn: ConnId,
    mut read_half: OwnedReadHalf,
    events: UnboundedSender<ServerEvent>,
) {
    tokio::spawn(async move {
        let mut chunk = [0u8; READ_BUFFER_SIZE];
        let mut frames = FrameBuffer::new();

        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    frames.extend(&chunk[..n]);
                    loop {
                        match frames.next_frame() {
                            Ok(Some(frame)) => match Message::decode(&frame) {
                                Ok(message) => {
                                    let event = ServerEvent::MessageReceived { conn, message };
                                    if events.send(event).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(
                                        "Connection {} sent an undecodable message: {}",
                                        conn, e
                                    );
                                }
                            },
                            Ok(None) => break,
                            Err(e) => {
                                // Nothing says where the next message would
                                // start, so everything buffered goes.
                                warn!(
                                    "Connection {} broke the stream ({}); discarding {} buffered bytes",
                                    conn,
                                    e,
                                    frames.len()
                                );
                                frames.clear();
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!("Read error on connection {}: {}", conn, e);
                    break;
                }
            }
        }

        let _ = events.send(ServerEvent::Disconnected { conn });
    });
}

/// Drains the connection's outbox onto the socket until the outbox closes
/// or the peer stops accepting bytes.
fn spawn_connection_writer(
    conn: ConnId,
    mut write_half: OwnedWriteHalf,
    mut outbox: UnboundedReceiver<Message>,
) {
    tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            if let Err(e) = write_half.write_all(&message.encode()).await {
                debug!("Write error on connection {}: {}", conn, e);
                break;
            }
        }
    });
}
