pub mod game;
pub mod protocol;

pub use game::{Board, GameSnapshot, MoveError, MoveOutcome, Side};
pub use protocol::{CodecError, FrameBuffer, Message, UserEntry};

pub const HOUSE_COUNT: usize = 12;
pub const HOUSES_PER_SIDE: usize = 6;
pub const INITIAL_SEEDS: u32 = 4;
pub const TOTAL_SEEDS: u32 = 48;
pub const WIN_THRESHOLD: u32 = 25;
pub const USERNAME_LENGTH: usize = 100;
pub const CHAT_LENGTH: usize = 200;
pub const MAX_OBSERVERS: usize = 8;
pub const READ_BUFFER_SIZE: usize = 4096;
