//! # Awalé Game Server Library
//!
//! This library provides the server side of a multiplayer Awalé service. It
//! keeps the authoritative state of every registered user and every running
//! game, arbitrates the moves players submit, and fans the resulting
//! positions out to opponents and observers.
//!
//! ## Core Responsibilities
//!
//! ### Session Registry
//! Every TCP connection may register exactly once under a chosen name and is
//! then addressable by a server-assigned user id. The registry tracks what
//! each user is doing (playing, waiting on a challenge, or watching) so the
//! matchmaking rules can be enforced.
//!
//! ### Matchmaking
//! Users challenge each other by id. The server relays the proposition,
//! forwards the answer, and starts the game on a fresh board when the
//! challenged player accepts. Either party can cancel, and challenges
//! involving users who are already tied up are refused immediately.
//!
//! ### Game Arbitration
//! The server is the only party that applies moves. Each move is checked
//! against the rules (right row, right turn, non-empty house), applied with
//! sowing and capture resolution, and the canonical position is broadcast.
//! Clients never exchange game state with each other.
//!
//! ### Spectating
//! Free users can attach to a running game as observers. They receive the
//! current position on arrival and then every update and chat line the
//! players see, up to a per-game observer limit.
//!
//! ## Architecture Design
//!
//! ### Single-Task State
//! All registry and lobby state belongs to the one task running the accept
//! and event loop. Per-connection reader tasks parse bytes into messages and
//! funnel them through a channel into that loop, so handlers run
//! sequentially and in arrival order with no locks anywhere.
//!
//! ### TCP with Fixed-Layout Messages
//! Communication uses plain TCP. Every message is a little-endian tag
//! followed by a payload whose size the tag determines, so the reader can
//! reassemble messages from partial and coalesced reads without a length
//! prefix.
//!
//! ### Outbox per Connection
//! Every connection owns a writer task draining an unbounded outbox channel.
//! Handlers queue messages and move on; a slow or dead peer never stalls the
//! event loop.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! Tracks registered users and their current engagement:
//! - Connection to user mapping and id assignment
//! - Outbox handles for message delivery
//! - Playing, pending and observing back-references
//!
//! ### Lobby Module (`lobby`)
//! Owns matchmaking and every running game:
//! - Challenge, answer and cancellation handling
//! - Move validation and rule arbitration
//! - Chat relay and observer management
//! - Cleanup when a connection disappears
//!
//! ### Network Module (`network`)
//! Handles all socket work and message routing:
//! - Listener setup and connection admission
//! - Per-connection reader and writer tasks
//! - Frame reassembly and decoding
//! - Dispatch of decoded messages to handlers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Bind the listener, allowing 64 clients and 8 observers per game
//!     let mut server = Server::new("127.0.0.1:8080", 64, 8).await?;
//!
//!     // Serve until the process is stopped - the loop:
//!     // - Accepts connections and spawns their reader/writer tasks
//!     // - Registers users and answers user list requests
//!     // - Relays challenges, moves, chat and observation traffic
//!     // - Tears down games whose players disconnect
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod lobby;
pub mod network;
pub mod session;
