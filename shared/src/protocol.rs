//! Binary wire protocol spoken between server and clients
//!
//! Every message is a little-endian `i32` tag followed by a payload whose
//! layout is fixed by the tag. Text travels in fixed-capacity NUL-padded
//! buffers and the user list is the only message whose size depends on a
//! count field, so a reader can always tell from the buffered bytes whether
//! a full message has arrived. `FrameBuffer` does exactly that splitting on
//! top of raw TCP reads.

use crate::game::{Board, GameSnapshot, Side};
use crate::{CHAT_LENGTH, HOUSE_COUNT, USERNAME_LENGTH};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

/// Bytes taken by the leading message tag.
pub const HEADER_LEN: usize = 4;
/// Bytes taken by a serialized `GameSnapshot`: 12 houses, the turn, 2 scores.
pub const SNAPSHOT_WIRE_LEN: usize = HOUSE_COUNT * 4 + 4 + 2 * 4;

mod tag {
    pub const USER_CREATION: i32 = 0;
    pub const USER_REGISTRATION: i32 = 1;
    pub const GET_USER_LIST: i32 = 2;
    pub const SEND_USER_LIST: i32 = 3;
    pub const MATCH_REQUEST: i32 = 4;
    pub const MATCH_PROPOSITION: i32 = 5;
    pub const MATCH_RESPONSE: i32 = 6;
    pub const MATCH_CANCELLATION: i32 = 7;
    pub const GAME_START: i32 = 8;
    pub const GAME_UPDATE: i32 = 9;
    pub const GAME_END: i32 = 10;
    pub const GAME_MOVE: i32 = 11;
    pub const ILLEGAL_MOVE: i32 = 12;
    pub const CHAT: i32 = 13;
    pub const OBSERVE_REQUEST: i32 = 14;
    pub const OBSERVATION_START: i32 = 15;
    pub const STOP_OBSERVING: i32 = 16;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown message tag {0}")]
    UnknownTag(i32),
    #[error("message payload ended early")]
    Truncated,
    #[error("invalid side value {0}")]
    InvalidSide(i32),
    #[error("invalid user list count {0}")]
    InvalidCount(i32),
    #[error("{0} unread bytes after message payload")]
    TrailingBytes(usize),
}

/// One row of the user list: another registered user as seen by the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEntry {
    pub username: String,
    pub user_id: u32,
    pub in_game: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    UserCreation {
        username: String,
    },
    UserRegistration {
        user_id: u32,
    },
    GetUserList,
    SendUserList {
        users: Vec<UserEntry>,
    },
    MatchRequest {
        target_id: u32,
    },
    MatchProposition {
        requester_id: u32,
        requester_name: String,
    },
    MatchResponse {
        accept: bool,
    },
    MatchCancellation,
    GameStart {
        opponent_name: String,
        side: Side,
        snapshot: GameSnapshot,
    },
    GameUpdate {
        snapshot: GameSnapshot,
    },
    GameEnd {
        winner: Side,
        snapshot: GameSnapshot,
    },
    GameMove {
        house: i32,
    },
    IllegalMove,
    Chat {
        text: String,
        sender_name: String,
        sender_id: u32,
    },
    ObserveRequest {
        target_id: u32,
    },
    ObservationStart {
        bottom_name: String,
        top_name: String,
        bottom_id: u32,
        top_id: u32,
        snapshot: GameSnapshot,
    },
    StopObserving,
}

impl Message {
    fn tag(&self) -> i32 {
        match self {
            Message::UserCreation { .. } => tag::USER_CREATION,
            Message::UserRegistration { .. } => tag::USER_REGISTRATION,
            Message::GetUserList => tag::GET_USER_LIST,
            Message::SendUserList { .. } => tag::SEND_USER_LIST,
            Message::MatchRequest { .. } => tag::MATCH_REQUEST,
            Message::MatchProposition { .. } => tag::MATCH_PROPOSITION,
            Message::MatchResponse { .. } => tag::MATCH_RESPONSE,
            Message::MatchCancellation => tag::MATCH_CANCELLATION,
            Message::GameStart { .. } => tag::GAME_START,
            Message::GameUpdate { .. } => tag::GAME_UPDATE,
            Message::GameEnd { .. } => tag::GAME_END,
            Message::GameMove { .. } => tag::GAME_MOVE,
            Message::IllegalMove => tag::ILLEGAL_MOVE,
            Message::Chat { .. } => tag::CHAT,
            Message::ObserveRequest { .. } => tag::OBSERVE_REQUEST,
            Message::ObservationStart { .. } => tag::OBSERVATION_START,
            Message::StopObserving => tag::STOP_OBSERVING,
        }
    }

    /// Serializes the message as one self-contained frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 64);
        put_i32(&mut buf, self.tag());

        match self {
            Message::UserCreation { username } => put_name(&mut buf, username),
            Message::UserRegistration { user_id } => put_u32(&mut buf, *user_id),
            Message::GetUserList => {}
            Message::SendUserList { users } => {
                // Column-wise layout: all names, then all ids, then all flags.
                put_i32(&mut buf, users.len() as i32);
                for user in users {
                    put_name(&mut buf, &user.username);
                }
                for user in users {
                    put_u32(&mut buf, user.user_id);
                }
                for user in users {
                    buf.push(user.in_game as u8);
                }
            }
            Message::MatchRequest { target_id } => put_u32(&mut buf, *target_id),
            Message::MatchProposition {
                requester_id,
                requester_name,
            } => {
                put_u32(&mut buf, *requester_id);
                put_name(&mut buf, requester_name);
            }
            Message::MatchResponse { accept } => put_i32(&mut buf, *accept as i32),
            Message::MatchCancellation => {}
            Message::GameStart {
                opponent_name,
                side,
                snapshot,
            } => {
                put_name(&mut buf, opponent_name);
                put_i32(&mut buf, *side as i32);
                put_snapshot(&mut buf, snapshot);
            }
            Message::GameUpdate { snapshot } => put_snapshot(&mut buf, snapshot),
            Message::GameEnd { winner, snapshot } => {
                put_i32(&mut buf, *winner as i32);
                put_snapshot(&mut buf, snapshot);
            }
            Message::GameMove { house } => put_i32(&mut buf, *house),
            Message::IllegalMove => {}
            Message::Chat {
                text,
                sender_name,
                sender_id,
            } => {
                put_text(&mut buf, text);
                put_name(&mut buf, sender_name);
                put_u32(&mut buf, *sender_id);
            }
            Message::ObserveRequest { target_id } => put_u32(&mut buf, *target_id),
            Message::ObservationStart {
                bottom_name,
                top_name,
                bottom_id,
                top_id,
                snapshot,
            } => {
                put_name(&mut buf, bottom_name);
                put_name(&mut buf, top_name);
                put_u32(&mut buf, *bottom_id);
                put_u32(&mut buf, *top_id);
                put_snapshot(&mut buf, snapshot);
            }
            Message::StopObserving => {}
        }

        buf
    }

    /// Parses one complete frame as produced by `FrameBuffer::next_frame`.
    pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
        let mut reader = WireReader::new(frame);
        let tag = reader.i32()?;

        let message = match tag {
            tag::USER_CREATION => Message::UserCreation {
                username: reader.name()?,
            },
            tag::USER_REGISTRATION => Message::UserRegistration {
                user_id: reader.u32()?,
            },
            tag::GET_USER_LIST => Message::GetUserList,
            tag::SEND_USER_LIST => {
                let raw_count = reader.i32()?;
                let count =
                    usize::try_from(raw_count).map_err(|_| CodecError::InvalidCount(raw_count))?;

                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    names.push(reader.name()?);
                }
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(reader.u32()?);
                }
                let mut users = Vec::with_capacity(count);
                for (username, user_id) in names.into_iter().zip(ids) {
                    users.push(UserEntry {
                        username,
                        user_id,
                        in_game: reader.u8()? != 0,
                    });
                }
                Message::SendUserList { users }
            }
            tag::MATCH_REQUEST => Message::MatchRequest {
                target_id: reader.u32()?,
            },
            tag::MATCH_PROPOSITION => Message::MatchProposition {
                requester_id: reader.u32()?,
                requester_name: reader.name()?,
            },
            tag::MATCH_RESPONSE => Message::MatchResponse {
                accept: reader.i32()? != 0,
            },
            tag::MATCH_CANCELLATION => Message::MatchCancellation,
            tag::GAME_START => Message::GameStart {
                opponent_name: reader.name()?,
                side: reader.side()?,
                snapshot: reader.snapshot()?,
            },
            tag::GAME_UPDATE => Message::GameUpdate {
                snapshot: reader.snapshot()?,
            },
            tag::GAME_END => Message::GameEnd {
                winner: reader.side()?,
                snapshot: reader.snapshot()?,
            },
            tag::GAME_MOVE => Message::GameMove {
                house: reader.i32()?,
            },
            tag::ILLEGAL_MOVE => Message::IllegalMove,
            tag::CHAT => Message::Chat {
                text: reader.text()?,
                sender_name: reader.name()?,
                sender_id: reader.u32()?,
            },
            tag::OBSERVE_REQUEST => Message::ObserveRequest {
                target_id: reader.u32()?,
            },
            tag::OBSERVATION_START => Message::ObservationStart {
                bottom_name: reader.name()?,
                top_name: reader.name()?,
                bottom_id: reader.u32()?,
                top_id: reader.u32()?,
                snapshot: reader.snapshot()?,
            },
            tag::STOP_OBSERVING => Message::StopObserving,
            other => return Err(CodecError::UnknownTag(other)),
        };

        reader.finish()?;
        Ok(message)
    }
}

/// Payload size fixed by the tag, or `None` when it depends on a count field.
fn fixed_payload_len(tag: i32) -> Result<Option<usize>, CodecError> {
    let len = match tag {
        tag::USER_CREATION => USERNAME_LENGTH,
        tag::USER_REGISTRATION => 4,
        tag::GET_USER_LIST => 0,
        tag::SEND_USER_LIST => return Ok(None),
        tag::MATCH_REQUEST => 4,
        tag::MATCH_PROPOSITION => 4 + USERNAME_LENGTH,
        tag::MATCH_RESPONSE => 4,
        tag::MATCH_CANCELLATION => 0,
        tag::GAME_START => USERNAME_LENGTH + 4 + SNAPSHOT_WIRE_LEN,
        tag::GAME_UPDATE => SNAPSHOT_WIRE_LEN,
        tag::GAME_END => 4 + SNAPSHOT_WIRE_LEN,
        tag::GAME_MOVE => 4,
        tag::ILLEGAL_MOVE => 0,
        tag::CHAT => CHAT_LENGTH + USERNAME_LENGTH + 4,
        tag::OBSERVE_REQUEST => 4,
        tag::OBSERVATION_START => 2 * USERNAME_LENGTH + 2 * 4 + SNAPSHOT_WIRE_LEN,
        tag::STOP_OBSERVING => 0,
        other => return Err(CodecError::UnknownTag(other)),
    };
    Ok(Some(len))
}

/// Bytes one user list entry adds beyond the count field.
const USER_ENTRY_WIRE_LEN: usize = USERNAME_LENGTH + 4 + 1;

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_name(buf: &mut Vec<u8>, text: &str) {
    put_padded(buf, text, USERNAME_LENGTH);
}

fn put_text(buf: &mut Vec<u8>, text: &str) {
    put_padded(buf, text, CHAT_LENGTH);
}

/// Writes `text` into a fixed `capacity`-byte buffer, NUL-padded, keeping at
/// least one terminating NUL and never splitting a UTF-8 character.
fn put_padded(buf: &mut Vec<u8>, text: &str, capacity: usize) {
    let bytes = truncate_on_char_boundary(text, capacity - 1);
    buf.extend_from_slice(bytes);
    buf.resize(buf.len() + (capacity - bytes.len()), 0);
}

fn truncate_on_char_boundary(text: &str, max: usize) -> &[u8] {
    if text.len() <= max {
        return text.as_bytes();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text.as_bytes()[..end]
}

fn put_snapshot(buf: &mut Vec<u8>, snapshot: &GameSnapshot) {
    for seeds in &snapshot.board.houses {
        put_u32(buf, *seeds);
    }
    put_i32(buf, snapshot.turn as i32);
    put_u32(buf, snapshot.points[0]);
    put_u32(buf, snapshot.points[1]);
}

struct WireReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> WireReader<'a> {
    fn new(frame: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(frame),
        }
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        self.cursor
            .read_i32::<LittleEndian>()
            .map_err(|_| CodecError::Truncated)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| CodecError::Truncated)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        self.cursor.read_u8().map_err(|_| CodecError::Truncated)
    }

    fn name(&mut self) -> Result<String, CodecError> {
        self.padded(USERNAME_LENGTH)
    }

    fn text(&mut self) -> Result<String, CodecError> {
        self.padded(CHAT_LENGTH)
    }

    fn padded(&mut self, capacity: usize) -> Result<String, CodecError> {
        let mut raw = vec![0u8; capacity];
        self.cursor
            .read_exact(&mut raw)
            .map_err(|_| CodecError::Truncated)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(capacity);
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    fn side(&mut self) -> Result<Side, CodecError> {
        let value = self.i32()?;
        Side::from_i32(value).ok_or(CodecError::InvalidSide(value))
    }

    fn snapshot(&mut self) -> Result<GameSnapshot, CodecError> {
        let mut houses = [0u32; HOUSE_COUNT];
        for seeds in houses.iter_mut() {
            *seeds = self.u32()?;
        }
        let turn = self.side()?;
        let points = [self.u32()?, self.u32()?];
        Ok(GameSnapshot {
            board: Board { houses },
            turn,
            points,
        })
    }

    fn finish(self) -> Result<(), CodecError> {
        let remaining = self.cursor.get_ref().len() as u64 - self.cursor.position();
        if remaining > 0 {
            return Err(CodecError::TrailingBytes(remaining as usize));
        }
        Ok(())
    }
}

/// Accumulates raw TCP reads and splits them into complete message frames.
///
/// The transport has no length prefix, so partial reads and coalesced
/// messages are both routine. `extend` appends whatever the socket produced
/// and `next_frame` is polled until it reports `None` (a partial message is
/// pending). An unknown tag is unrecoverable because nothing says how many
/// bytes to skip; the caller is expected to log it and `clear` the buffer.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Cuts one complete frame off the front of the buffer, if present.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = i32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]);

        let payload_len = match fixed_payload_len(tag)? {
            Some(len) => len,
            None => {
                // User list: the size is only known once the count is in.
                if self.buffer.len() < HEADER_LEN + 4 {
                    return Ok(None);
                }
                let raw_count = i32::from_le_bytes([
                    self.buffer[4],
                    self.buffer[5],
                    self.buffer[6],
                    self.buffer[7],
                ]);
                let count =
                    usize::try_from(raw_count).map_err(|_| CodecError::InvalidCount(raw_count))?;
                4 + count * USER_ENTRY_WIRE_LEN
            }
        };

        let frame_len = HEADER_LEN + payload_len;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        Ok(Some(self.buffer.drain(..frame_len).collect()))
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
