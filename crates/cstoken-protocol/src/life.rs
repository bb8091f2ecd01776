//! Conway's Game of Life over board chunks.
//!
//! A chunk carries the board rows it covers plus the row just above and just below it,
//! so a worker can compute the next generation of the chunk without the whole board.
//! Cells are `0` (dead) or non-zero (alive); anything past the board edge is dead.

/// A slice of a board ready to become a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub row: usize,
    pub rows: Vec<Vec<u8>>,
    pub above: Option<Vec<u8>>,
    pub below: Option<Vec<u8>>,
}

/// Cut a board into chunks of at most `chunk_rows` rows, each with its halo rows.
pub fn split_board(board: &[Vec<u8>], chunk_rows: usize) -> Vec<Chunk> {
    let chunk_rows = chunk_rows.max(1);
    (0..board.len())
        .step_by(chunk_rows)
        .map(|start| {
            let end = (start + chunk_rows).min(board.len());
            Chunk {
                row: start,
                rows: board[start..end].to_vec(),
                above: start.checked_sub(1).map(|i| board[i].clone()),
                below: board.get(end).cloned(),
            }
        })
        .collect()
}

/// Next generation of the chunk rows.
pub fn step_chunk(rows: &[Vec<u8>], above: Option<&[u8]>, below: Option<&[u8]>) -> Vec<Vec<u8>> {
    rows.iter()
        .enumerate()
        .map(|(r, row)| {
            let r = r as isize;
            (0..row.len() as isize)
                .map(|c| {
                    let mut neighbours = 0u8;
                    for dr in -1..=1 {
                        for dc in -1..=1 {
                            if dr != 0 || dc != 0 {
                                neighbours += cell(rows, above, below, r + dr, c + dc);
                            }
                        }
                    }
                    match (cell(rows, above, below, r, c), neighbours) {
                        (1, 2) | (_, 3) => 1,
                        _ => 0,
                    }
                })
                .collect()
        })
        .collect()
}

/// 1 if the cell at chunk coordinates `(r, c)` is alive. Row -1 is the upper halo,
/// row `rows.len()` the lower one.
fn cell(rows: &[Vec<u8>], above: Option<&[u8]>, below: Option<&[u8]>, r: isize, c: isize) -> u8 {
    if c < 0 {
        return 0;
    }
    let row = if r < 0 {
        above
    } else if r as usize >= rows.len() {
        below
    } else {
        Some(rows[r as usize].as_slice())
    };
    match row.and_then(|row| row.get(c as usize)) {
        Some(&v) if v != 0 => 1,
        _ => 0,
    }
}

/// Next generation of a whole board.
pub fn step_board(board: &[Vec<u8>]) -> Vec<Vec<u8>> {
    step_chunk(board, None, None)
}
