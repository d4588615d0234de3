// ========================================================================================
//                       Output ranges and input-row assignment
// ========================================================================================

use super::PoolError;
use crate::types::{BlockDescriptor, GenomicRegion};
use ahash::AHashMap;
use itertools::Itertools;
use ndarray::Array1;
use rayon::prelude::*;
use std::ops::Range;

/// Pairwise-disjoint output ranges, one per block, covering `0..total_len` exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPartition {
    ranges: Vec<Range<usize>>,
    total_len: usize,
}

impl BlockPartition {
    /// Contiguous ranges in block order: block `b` starts where block `b - 1` ends.
    pub fn from_sizes(sizes: &[usize]) -> Self {
        let mut offset = 0;
        let ranges = sizes
            .iter()
            .map(|&size| {
                let range = offset..offset + size;
                offset += size;
                range
            })
            .collect();
        Self {
            ranges,
            total_len: offset,
        }
    }

    /// Validates explicit ranges against the buffer length.
    pub fn from_ranges(ranges: Vec<Range<usize>>, total_len: usize) -> Result<Self, PoolError> {
        for range in &ranges {
            if range.start > range.end || range.end > total_len {
                return Err(PoolError::RangeOutOfBounds {
                    range: range.clone(),
                    total_len,
                });
            }
        }

        let mut order: Vec<usize> = (0..ranges.len())
            .filter(|&block| !ranges[block].is_empty())
            .collect();
        order.sort_by_key(|&block| ranges[block].start);
        if let Some((first, second)) = order
            .iter()
            .tuple_windows()
            .find(|&(&a, &b)| ranges[a].end > ranges[b].start)
        {
            return Err(PoolError::OverlappingRanges {
                first: *first,
                second: *second,
            });
        }

        let covered: usize = ranges.iter().map(|range| range.len()).sum();
        if covered != total_len {
            return Err(PoolError::PartitionMismatch {
                expected: total_len,
                found: covered,
            });
        }
        Ok(Self { ranges, total_len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn range(&self, block: usize) -> Option<Range<usize>> {
        self.ranges.get(block).cloned()
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }
}

/// Assigns each `(chromosome, position)` row to the first region containing it.
///
/// Returns, per region, the input rows it received in input order. Rows outside every
/// region are not assigned to any block.
pub fn partition_rows_by_region(regions: &[GenomicRegion], rows: &[(u8, u64)]) -> Vec<Vec<usize>> {
    let mut by_chromosome: AHashMap<u8, Vec<usize>> = AHashMap::new();
    for (block, region) in regions.iter().enumerate() {
        by_chromosome.entry(region.chromosome).or_default().push(block);
    }
    for blocks in by_chromosome.values_mut() {
        blocks.sort_by_key(|&block| (regions[block].start, block));
    }

    let owners: Vec<Option<usize>> = rows
        .par_iter()
        .map(|&(chromosome, position)| {
            let blocks = by_chromosome.get(&chromosome)?;
            // Regions starting after `position` cannot contain it.
            let candidates = blocks.partition_point(|&block| regions[block].start <= position);
            blocks[..candidates]
                .iter()
                .filter(|&&block| regions[block].contains(chromosome, position))
                .min()
                .copied()
        })
        .collect();

    let mut assigned = vec![Vec::new(); regions.len()];
    for (row, owner) in owners.into_iter().enumerate() {
        if let Some(block) = owner {
            assigned[block].push(row);
        }
    }
    assigned
}

/// [`partition_rows_by_region`] over the regions of `descriptors`, every one of which
/// must carry a region.
pub fn partition_rows_by_descriptor(
    descriptors: &[BlockDescriptor],
    rows: &[(u8, u64)],
) -> Result<Vec<Vec<usize>>, PoolError> {
    let regions = descriptors
        .iter()
        .enumerate()
        .map(|(block, descriptor)| {
            descriptor.region.ok_or_else(|| PoolError::MissingRegion {
                block,
                block_id: descriptor.id.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(partition_rows_by_region(&regions, rows))
}

/// Maps buffer positions back to input rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputAlignment {
    input_rows: Vec<usize>,
    input_len: usize,
}

impl InputAlignment {
    /// `block_rows[b]` lists the input rows of block `b` in buffer order. Every row must
    /// be below `input_len` and no row may appear twice.
    pub fn new(block_rows: &[Vec<usize>], input_len: usize) -> Result<Self, PoolError> {
        let mut seen = vec![false; input_len];
        let mut input_rows = Vec::with_capacity(block_rows.iter().map(Vec::len).sum());
        for &row in block_rows.iter().flatten() {
            if row >= input_len || seen[row] {
                return Err(PoolError::InvalidInputRow { row, input_len });
            }
            seen[row] = true;
            input_rows.push(row);
        }
        Ok(Self {
            input_rows,
            input_len,
        })
    }

    /// Length of the output buffer this alignment reads from.
    #[inline]
    pub fn buffer_len(&self) -> usize {
        self.input_rows.len()
    }

    /// Scatters a buffer-ordered array into input order, zero-filling unassigned rows.
    pub fn align(&self, values: &Array1<f64>) -> Result<Array1<f64>, PoolError> {
        if values.len() != self.input_rows.len() {
            return Err(PoolError::PartitionMismatch {
                expected: self.input_rows.len(),
                found: values.len(),
            });
        }
        let mut aligned = Array1::zeros(self.input_len);
        for (&row, &value) in self.input_rows.iter().zip(values.iter()) {
            aligned[row] = value;
        }
        Ok(aligned)
    }
}
