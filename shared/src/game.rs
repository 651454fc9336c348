//! Awalé board state and move resolution shared by server and client

use crate::{HOUSES_PER_SIDE, HOUSE_COUNT, INITIAL_SEEDS, WIN_THRESHOLD};
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bottom = 0,
    Top = 1,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Bottom => Side::Top,
            Side::Top => Side::Bottom,
        }
    }

    /// Indices of the houses belonging to this side's row.
    pub fn house_range(&self) -> Range<usize> {
        match self {
            Side::Bottom => 0..HOUSES_PER_SIDE,
            Side::Top => HOUSES_PER_SIDE..HOUSE_COUNT,
        }
    }

    pub fn owns_house(&self, house: usize) -> bool {
        self.house_range().contains(&house)
    }

    pub fn from_i32(value: i32) -> Option<Side> {
        match value {
            0 => Some(Side::Bottom),
            1 => Some(Side::Top),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Board {
    pub houses: [u32; HOUSE_COUNT],
}

impl Board {
    pub fn new() -> Self {
        Self {
            houses: [INITIAL_SEEDS; HOUSE_COUNT],
        }
    }

    pub fn row_empty(&self, side: Side) -> bool {
        side.house_range().all(|house| self.houses[house] == 0)
    }

    pub fn seed_total(&self) -> u32 {
        self.houses.iter().sum()
    }
}

impl Default for Board {
    fn default() -> Self {
        Board::new()
    }
}

/// Complete state of one game, always transmitted as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameSnapshot {
    pub board: Board,
    pub turn: Side,
    /// Captured seeds per side, indexed by `Side as usize`.
    pub points: [u32; 2],
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MoveError {
    #[error("house {0} does not exist")]
    OutOfRange(usize),
    #[error("house {0} is not on the mover's row")]
    WrongRow(usize),
    #[error("house {0} is empty")]
    EmptyHouse(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome {
    pub snapshot: GameSnapshot,
    pub winner: Option<Side>,
}

impl GameSnapshot {
    pub fn new() -> Self {
        Self {
            board: Board::new(),
            turn: Side::Bottom,
            points: [0, 0],
        }
    }

    /// Resolves one move without touching the current snapshot.
    ///
    /// Checks that the house exists, lies on the mover's row and holds at
    /// least one seed, then sows the seeds counter-clockwise (the emptied
    /// house is skipped on every lap), harvests captures and flips the turn.
    /// Whose turn it actually is must be checked by the caller; the engine
    /// only validates the move itself.
    pub fn apply_move(&self, side: Side, house: usize) -> Result<MoveOutcome, MoveError> {
        if house >= HOUSE_COUNT {
            return Err(MoveError::OutOfRange(house));
        }
        if !side.owns_house(house) {
            return Err(MoveError::WrongRow(house));
        }

        let mut next = *self;
        let seeds = next.board.houses[house];
        if seeds == 0 {
            return Err(MoveError::EmptyHouse(house));
        }

        next.board.houses[house] = 0;
        let mut idx = house;
        let mut remaining = seeds;
        while remaining > 0 {
            idx = (idx + 1) % HOUSE_COUNT;
            if idx == house {
                // The origin stays empty even when sowing wraps all the way around.
                continue;
            }
            next.board.houses[idx] += 1;
            remaining -= 1;
        }

        // Walk backward from the last sown house, harvesting every house
        // that now holds exactly two or three seeds. The walk stops at the
        // first house outside that range; the emptied origin bounds it.
        let mut capture = idx;
        while next.board.houses[capture] == 2 || next.board.houses[capture] == 3 {
            next.points[side as usize] += next.board.houses[capture];
            next.board.houses[capture] = 0;
            capture = (capture + HOUSE_COUNT - 1) % HOUSE_COUNT;
        }

        next.turn = side.opposite();

        let winner = next.resolve_end(side);
        Ok(MoveOutcome {
            snapshot: next,
            winner,
        })
    }

    /// Applies the termination rules after a completed move.
    ///
    /// The game ends when the mover has banked a strict majority of the
    /// seeds, or when the opponent is left without a legal reply. In the
    /// starvation case the mover collects every seed still on the board and
    /// the higher total wins, the mover taking a 24-24 split.
    fn resolve_end(&mut self, mover: Side) -> Option<Side> {
        if self.points[mover as usize] >= WIN_THRESHOLD {
            return Some(mover);
        }

        if self.board.row_empty(mover.opposite()) {
            for house in 0..HOUSE_COUNT {
                self.points[mover as usize] += self.board.houses[house];
                self.board.houses[house] = 0;
            }
            let winner = if self.points[mover.opposite() as usize] > self.points[mover as usize] {
                mover.opposite()
            } else {
                mover
            };
            return Some(winner);
        }

        None
    }
}

impl Default for GameSnapshot {
    fn default() -> Self {
        GameSnapshot::new()
    }
}
