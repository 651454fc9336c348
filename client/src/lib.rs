//! # Awalé Client Library
//!
//! This library provides the client side of the multiplayer Awalé service:
//! a connection type that speaks the server's wire protocol and a small
//! move picker used by the bundled bot binary. Everything a client can do
//! (register, browse users, challenge, play, chat, observe) goes through
//! these pieces.
//!
//! ## Architecture Overview
//!
//! ### Whole Messages over TCP
//! The protocol has no length prefix; each message's size follows from its
//! leading tag. `Connection` buffers raw reads and hands back complete,
//! decoded messages, so callers never see a partial frame even when the
//! network splits or coalesces writes.
//!
//! ### Server Authority
//! The client never applies game rules itself. It sends the house it wants
//! to play and waits for the server's verdict: an updated position, a
//! rejection, or the end of the game. The board a client displays is always
//! one the server produced.
//!
//! ### Automated Play
//! The bot module picks uniformly among the mover's non-empty houses. That
//! is enough to exercise every part of the service end to end, from
//! matchmaking through captures to game end, without any human at the
//! keyboard.
//!
//! ## Module Organization
//!
//! ### Connection Module (`connection`)
//! Manages the link to the server:
//! - Connecting and registering a username
//! - Typed senders for every client-to-server message
//! - Frame reassembly and decoding of server traffic
//!
//! ### Bot Module (`bot`)
//! Decision making for unattended play:
//! - Random choice among legal-looking houses
//! - Declining to move when no house is playable
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::connection::Connection;
//! use shared::Message;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut connection = Connection::connect("127.0.0.1:8080").await?;
//!     connection.register("ayo").await?;
//!
//!     while let Some(message) = connection.next_message().await? {
//!         match message {
//!             Message::UserRegistration { user_id } => {
//!                 println!("Registered as user {}", user_id);
//!                 connection.request_user_list().await?;
//!             }
//!             Message::SendUserList { users } => {
//!                 for user in &users {
//!                     println!("{} is user {}", user.username, user.user_id);
//!                 }
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod bot;
pub mod connection;
