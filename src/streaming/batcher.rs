//! Order-preserving batching of operations.
//!
//! Batches cover indices `[i * size, min((i + 1) * size, n))` of their group,
//! so there are `ceil(n / size)` of them and only the last may be short.

use std::ops::Range;

use crate::error::ImportError;
use crate::records::{Operation, OperationGroup};

/// One `records/modify` request worth of operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Submission index across the whole call.
    pub index: usize,
    pub record_type: String,
    /// Position of these operations inside their record-type group.
    pub range: Range<usize>,
    /// Size of the record-type group, for progress messages.
    pub group_len: usize,
    pub operations: Vec<Operation>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Splits operations into chunks of at most `size`, preserving order.
///
/// # Errors
///
/// Returns `ImportError::Config` if `size` is 0.
pub fn chunk(operations: Vec<Operation>, size: usize) -> Result<Vec<Vec<Operation>>, ImportError> {
    if size == 0 {
        return Err(ImportError::Config(
            "chunk size must be greater than 0".into(),
        ));
    }

    let mut chunks = Vec::with_capacity(operations.len().div_ceil(size));
    let mut iter = operations.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(size).collect());
    }
    Ok(chunks)
}

/// Batches every group separately so that no batch mixes record types.
/// Indices run across groups in group order.
pub fn chunk_groups(groups: Vec<OperationGroup>, size: usize) -> Result<Vec<Batch>, ImportError> {
    let mut batches = Vec::new();

    for group in groups {
        let group_len = group.operations.len();
        let mut start = 0;

        for operations in chunk(group.operations, size)? {
            let end = start + operations.len();
            batches.push(Batch {
                index: batches.len(),
                record_type: group.record_type.clone(),
                range: start..end,
                group_len,
                operations,
            });
            start = end;
        }
    }

    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{OperationType, Record};

    fn ops(record_type: &str, n: usize) -> Vec<Operation> {
        (0..n)
            .map(|i| Operation {
                operation_type: OperationType::ForceDelete,
                record: Record {
                    record_name: Some(format!("{}-{}", record_type, i)),
                    record_type: record_type.to_string(),
                    fields: None,
                },
            })
            .collect()
    }

    #[test]
    fn test_zero_size_is_config_error() {
        assert!(matches!(chunk(ops("A", 3), 0), Err(ImportError::Config(_))));
    }

    #[test]
    fn test_concatenation_equals_input() {
        for n in [0usize, 1, 5, 199, 200, 201, 450] {
            for size in [1usize, 3, 200, 1000] {
                let input = ops("A", n);
                let chunks = chunk(input.clone(), size).unwrap();

                assert_eq!(chunks.len(), n.div_ceil(size), "n={} size={}", n, size);
                assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= size));
                assert_eq!(chunks.concat(), input, "n={} size={}", n, size);
            }
        }
    }

    #[test]
    fn test_last_chunk_holds_the_remainder() {
        let sizes: Vec<usize> = chunk(ops("A", 450), 200)
            .unwrap()
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![200, 200, 50]);
    }

    #[test]
    fn test_groups_never_share_a_batch() {
        let groups = vec![
            OperationGroup {
                record_type: "A".into(),
                operations: ops("A", 3),
            },
            OperationGroup {
                record_type: "B".into(),
                operations: ops("B", 4),
            },
        ];

        let batches = chunk_groups(groups, 2).unwrap();

        let shape: Vec<(usize, &str, Range<usize>)> = batches
            .iter()
            .map(|b| (b.index, b.record_type.as_str(), b.range.clone()))
            .collect();
        assert_eq!(
            shape,
            vec![
                (0, "A", 0..2),
                (1, "A", 2..3),
                (2, "B", 0..2),
                (3, "B", 2..4),
            ]
        );
        for batch in &batches {
            assert!(batch
                .operations
                .iter()
                .all(|op| op.record.record_type == batch.record_type));
        }
    }

    #[test]
    fn test_empty_group_yields_no_batches() {
        let groups = vec![OperationGroup {
            record_type: "A".into(),
            operations: Vec::new(),
        }];
        assert!(chunk_groups(groups, 10).unwrap().is_empty());
    }
}
