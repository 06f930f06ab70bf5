//! Node interconnect matrix decoding

use xpulet_core::{SchedError, SchedResult};

/// Smallest accepted matrix side.
pub const TOPOLOGY_MIN_SIDE: usize = 1;
/// Largest accepted matrix side; no node carries more cards than this.
pub const TOPOLOGY_MAX_SIDE: usize = 32;

/// Decode a node topology annotation into the card-to-card bandwidth
/// matrix.
///
/// Rows are `;`-separated, cells `,`-separated decimal integers. The
/// matrix must be square with side in
/// [[`TOPOLOGY_MIN_SIDE`], [`TOPOLOGY_MAX_SIDE`]].
pub fn decode_topology(s: &str) -> SchedResult<Vec<Vec<i64>>> {
    let rows: Vec<&str> = s.split(';').collect();
    let side = rows.len();
    if !(TOPOLOGY_MIN_SIDE..=TOPOLOGY_MAX_SIDE).contains(&side) {
        return Err(SchedError::BadTopology(format!(
            "side {side} out of range [{TOPOLOGY_MIN_SIDE}, {TOPOLOGY_MAX_SIDE}]"
        )));
    }
    let mut matrix = Vec::with_capacity(side);
    for (i, row) in rows.iter().enumerate() {
        let cells: Vec<&str> = row.split(',').collect();
        if cells.len() != side {
            return Err(SchedError::BadTopology(format!(
                "row {i} has {} cells, want {side}",
                cells.len()
            )));
        }
        let mut bandwidths = Vec::with_capacity(side);
        for cell in cells {
            let bandwidth: i64 = cell.trim().parse().map_err(|_| {
                SchedError::BadTopology(format!("cell is not an integer: {cell}"))
            })?;
            bandwidths.push(bandwidth);
        }
        matrix.push(bandwidths);
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_square_matrix() {
        let matrix = decode_topology("0,50;50,0").unwrap();
        assert_eq!(matrix, vec![vec![0, 50], vec![50, 0]]);
    }

    #[test]
    fn test_decode_single_card() {
        let matrix = decode_topology("0").unwrap();
        assert_eq!(matrix, vec![vec![0]]);
    }

    #[test]
    fn test_reject_non_square() {
        assert!(matches!(
            decode_topology("0,50;50,0;10,10"),
            Err(SchedError::BadTopology(_))
        ));
        assert!(matches!(
            decode_topology("0,50,10;50,0"),
            Err(SchedError::BadTopology(_))
        ));
    }

    #[test]
    fn test_reject_oversize() {
        let row = vec!["0"; 33].join(",");
        let matrix = vec![row; 33].join(";");
        assert!(matches!(
            decode_topology(&matrix),
            Err(SchedError::BadTopology(_))
        ));
    }

    #[test]
    fn test_reject_non_integer() {
        assert!(matches!(
            decode_topology("0,x;x,0"),
            Err(SchedError::BadTopology(_))
        ));
    }
}
