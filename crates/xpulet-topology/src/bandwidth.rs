//! Name-keyed bandwidth tables
//!
//! Inter-node and inter-task bandwidth both arrive as a comma-separated
//! name list plus a `;`-rows `,`-cells integer matrix. The name list is
//! authoritative for matrix ordering. Tables are sparse maps; a missing
//! pair reads as bandwidth 0, which conservatively fails any positive
//! requirement.

use std::collections::HashMap;

use xpulet_core::{SchedError, SchedResult};

/// `name -> name -> bandwidth`. Used for both node pairs and task pairs.
pub type BandwidthTable = HashMap<String, HashMap<String, i64>>;

/// Bandwidth between `a` and `b`, 0 when unknown.
pub fn bandwidth_between(table: &BandwidthTable, a: &str, b: &str) -> i64 {
    table
        .get(a)
        .and_then(|row| row.get(b))
        .copied()
        .unwrap_or(0)
}

/// Convert matrix rows plus the authoritative name list into a table.
///
/// Every row must have exactly one cell per name; the row count must equal
/// the name count.
pub fn matrix_to_table(rows: &[&str], names: &[&str]) -> SchedResult<BandwidthTable> {
    if rows.len() != names.len() {
        return Err(SchedError::BadBandwidthMatrix(format!(
            "matrix has {} rows for {} names",
            rows.len(),
            names.len()
        )));
    }
    let mut table = BandwidthTable::new();
    for (i, row) in rows.iter().enumerate() {
        let cells: Vec<&str> = row.split(',').collect();
        if cells.len() != names.len() {
            return Err(SchedError::BadBandwidthMatrix(format!(
                "matrix row {} has {} cells for {} names",
                i,
                cells.len(),
                names.len()
            )));
        }
        let entry = table.entry(names[i].to_string()).or_default();
        for (j, cell) in cells.iter().enumerate() {
            let bandwidth: i64 = cell.trim().parse().map_err(|_| {
                SchedError::BadBandwidthMatrix(format!(
                    "matrix cell ({i},{j}) is not an integer: {cell}"
                ))
            })?;
            entry.insert(names[j].to_string(), bandwidth);
        }
    }
    Ok(table)
}

/// Decode the wire form: `list` comma-separated, `matrix` `;`-rows.
pub fn decode_bandwidth_table(list: &str, matrix: &str) -> SchedResult<BandwidthTable> {
    let names: Vec<&str> = list.split(',').collect();
    let rows: Vec<&str> = matrix.split(';').collect();
    matrix_to_table(&rows, &names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_table_keys_by_name_list() {
        let table = decode_bandwidth_table("node-a,node-b", "0,30;30,0").unwrap();
        assert_eq!(bandwidth_between(&table, "node-a", "node-b"), 30);
        assert_eq!(bandwidth_between(&table, "node-b", "node-a"), 30);
        assert_eq!(bandwidth_between(&table, "node-a", "node-a"), 0);
    }

    #[test]
    fn test_missing_pair_reads_zero() {
        let table = decode_bandwidth_table("node-a", "0").unwrap();
        assert_eq!(bandwidth_between(&table, "node-a", "node-z"), 0);
        assert_eq!(bandwidth_between(&table, "node-z", "node-a"), 0);
    }

    #[test]
    fn test_row_count_mismatch_rejected() {
        let err = decode_bandwidth_table("node-a,node-b", "0,30");
        assert!(matches!(err, Err(SchedError::BadBandwidthMatrix(_))));
    }

    #[test]
    fn test_cell_count_mismatch_rejected() {
        let err = decode_bandwidth_table("node-a,node-b", "0,30,40;30,0");
        assert!(matches!(err, Err(SchedError::BadBandwidthMatrix(_))));
    }

    #[test]
    fn test_non_integer_cell_rejected() {
        let err = decode_bandwidth_table("node-a,node-b", "0,fast;fast,0");
        assert!(matches!(err, Err(SchedError::BadBandwidthMatrix(_))));
    }
}
