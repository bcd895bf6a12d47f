//! Order-preserving fixed-size partition of a record set.

use linetag_shared::{Chunk, LinetagError, Record, Result};

/// Split `records` into consecutive chunks of at most `chunk_size`.
///
/// Produces `ceil(N / chunk_size)` chunks with 0-based indexes; only the
/// last chunk may be short. No records yields no chunks.
pub fn split(records: Vec<Record>, chunk_size: usize) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(LinetagError::validation("chunk_size must be at least 1"));
    }

    let mut chunks = Vec::with_capacity(records.len().div_ceil(chunk_size));
    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        let records: Vec<Record> = iter.by_ref().take(chunk_size).collect();
        chunks.push(Chunk {
            index: chunks.len(),
            records,
        });
    }
    Ok(chunks)
}

/// Concatenate chunks back into one record list, in the order given.
pub fn concat(chunks: Vec<Chunk>) -> Vec<Record> {
    chunks.into_iter().flat_map(|c| c.records).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use linetag_shared::RecordId;

    fn records(n: usize) -> Vec<Record> {
        (1..=n)
            .map(|i| Record::new(RecordId::from_row(i), format!("keyword {i}")))
            .collect()
    }

    #[test]
    fn chunk_counts_and_sizes() {
        for (n, k, expected) in [
            (12, 5, vec![5, 5, 2]),
            (10, 5, vec![5, 5]),
            (1, 5, vec![1]),
            (3, 1, vec![1, 1, 1]),
            (4, 100, vec![4]),
        ] {
            let chunks = split(records(n), k).unwrap();
            let sizes: Vec<usize> = chunks.iter().map(Chunk::len).collect();
            assert_eq!(sizes, expected, "n={n} k={k}");
            let indexes: Vec<usize> = chunks.iter().map(|c| c.index).collect();
            assert_eq!(indexes, (0..expected.len()).collect::<Vec<_>>());
        }
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(split(Vec::new(), 5).unwrap().is_empty());
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let err = split(records(3), 0).unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn lossless_and_order_preserving() {
        for n in [0, 1, 7, 23] {
            for k in [1, 2, 5, 23, 40] {
                let input = records(n);
                let output = concat(split(input.clone(), k).unwrap());
                assert_eq!(output, input, "n={n} k={k}");
            }
        }
    }

    #[test]
    fn rechunking_is_idempotent() {
        let first = split(records(17), 4).unwrap();
        let again = split(concat(first.clone()), 4).unwrap();
        assert_eq!(again, first);
    }
}
