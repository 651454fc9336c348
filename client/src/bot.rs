use rand::Rng;
use shared::{GameSnapshot, Side};

/// Picks a random house for `side` that holds at least one seed.
///
/// Returns `None` when the whole row is empty, which in a live game only
/// happens while waiting for the server to settle the position.
pub fn choose_house<R: Rng>(snapshot: &GameSnapshot, side: Side, rng: &mut R) -> Option<usize> {
    let candidates: Vec<usize> = side
        .house_range()
        .filter(|&house| snapshot.board.houses[house] > 0)
        .collect();

    if candidates.is_empty() {
        return None;
    }
    Some(candidates[rng.gen_range(0..candidates.len())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use shared::Board;

    #[test]
    fn test_choices_stay_on_own_nonempty_houses() {
        let snapshot = GameSnapshot {
            board: Board {
                houses: [3, 0, 1, 0, 2, 0, 4, 4, 4, 4, 4, 4],
            },
            turn: Side::Bottom,
            points: [0, 0],
        };
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..100 {
            let house = choose_house(&snapshot, Side::Bottom, &mut rng).unwrap();
            assert!(house < 6, "picked house {} outside the bottom row", house);
            assert!(snapshot.board.houses[house] > 0, "picked empty house {}", house);
        }
    }

    #[test]
    fn test_single_open_house_is_always_picked() {
        let snapshot = GameSnapshot {
            board: Board {
                houses: [0, 0, 0, 0, 0, 0, 0, 0, 0, 5, 0, 0],
            },
            turn: Side::Top,
            points: [0, 0],
        };
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..10 {
            assert_eq!(choose_house(&snapshot, Side::Top, &mut rng), Some(9));
        }
    }

    #[test]
    fn test_empty_row_yields_no_move() {
        let snapshot = GameSnapshot {
            board: Board {
                houses: [0, 0, 0, 0, 0, 0, 4, 4, 4, 4, 4, 4],
            },
            turn: Side::Bottom,
            points: [0, 0],
        };
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(choose_house(&snapshot, Side::Bottom, &mut rng), None);
    }
}
