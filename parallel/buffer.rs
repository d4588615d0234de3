// ========================================================================================
//
//                   Shared output buffer for block-parallel writes
//
// ========================================================================================
//
// Every named field is one anonymous shared memory map holding `total_len` f64 values,
// zero-initialized by the kernel. Workers never lock it: each block's range is fixed by
// the `BlockPartition` before the run starts, and `claim_block` hands that range out at
// most once, so no two writers ever alias the same element.

use super::PoolError;
use super::partition::BlockPartition;
use ahash::AHashMap;
use memmap2::MmapMut;
use ndarray::{Array1, ArrayView1};
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

struct OutputField {
    name: String,
    base: NonNull<f64>,
    // Owns the pages `base` points into.
    map: MmapMut,
}

impl OutputField {
    fn allocate(name: String, total_len: usize) -> Result<Self, PoolError> {
        // A zero-length map is rejected by the OS; keep one slot so `base` is valid.
        let bytes = total_len.max(1) * size_of::<f64>();
        let mut map = MmapMut::map_anon(bytes).map_err(PoolError::Allocation)?;
        let raw = map.as_mut_ptr().cast::<f64>();
        let base = NonNull::new(raw).ok_or_else(|| {
            PoolError::Allocation(std::io::Error::other("anonymous map returned null"))
        })?;
        Ok(Self { name, base, map })
    }

    fn mapped_len(&self) -> usize {
        self.map.len() / size_of::<f64>()
    }
}

/// A fixed set of named f64 arrays that blocks write into by disjoint range.
pub struct SharedOutputBuffer {
    fields: Vec<OutputField>,
    partition: BlockPartition,
    claimed: Vec<AtomicBool>,
}

// SAFETY: the raw pointers in `fields` address memory owned by the maps stored next to
// them, which live as long as the buffer. Mutable access is only created by
// `claim_block`, which hands each block's range out at most once (atomic swap on
// `claimed`), and ranges are pairwise disjoint by construction of `BlockPartition`.
// Whole-field reads require `&mut self` or ownership, so they cannot overlap a live
// `BlockOutput`.
unsafe impl Send for SharedOutputBuffer {}
unsafe impl Sync for SharedOutputBuffer {}

impl std::fmt::Debug for SharedOutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedOutputBuffer")
            .field("fields", &self.field_names().collect::<Vec<_>>())
            .field("partition", &self.partition)
            .finish()
    }
}

impl SharedOutputBuffer {
    pub fn allocate(names: &[String], partition: BlockPartition) -> Result<Self, PoolError> {
        let mut fields: Vec<OutputField> = Vec::with_capacity(names.len());
        for name in names {
            if name.is_empty() {
                return Err(PoolError::Config(
                    "output field names must be non-empty".to_string(),
                ));
            }
            if fields.iter().any(|field| &field.name == name) {
                return Err(PoolError::DuplicateField(name.clone()));
            }
            fields.push(OutputField::allocate(name.clone(), partition.total_len())?);
        }
        log::debug!(
            "Allocated {} output field(s) of {} values for {} block(s).",
            fields.len(),
            partition.total_len(),
            partition.len()
        );
        let claimed = (0..partition.len()).map(|_| AtomicBool::new(false)).collect();
        Ok(Self {
            fields,
            partition,
            claimed,
        })
    }

    pub fn partition(&self) -> &BlockPartition {
        &self.partition
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.partition.total_len()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    /// Exclusive write access to block `index`'s range of every field.
    pub fn claim_block(&self, index: usize) -> Result<BlockOutput<'_>, PoolError> {
        let range = self
            .partition
            .range(index)
            .ok_or(PoolError::UnknownBlock(index))?;
        if self.claimed[index].swap(true, Ordering::AcqRel) {
            return Err(PoolError::BlockAlreadyClaimed(index));
        }
        let fields = self
            .fields
            .iter()
            .map(|field| {
                debug_assert!(range.end <= field.mapped_len());
                // SAFETY: `range` lies inside the map (`BlockPartition` bounds every
                // range by `total_len`) and no other claim to it can exist.
                let slice = unsafe {
                    std::slice::from_raw_parts_mut(field.base.as_ptr().add(range.start), range.len())
                };
                (field.name.as_str(), slice)
            })
            .collect();
        Ok(BlockOutput {
            index,
            range,
            fields,
        })
    }

    /// Whole-field read once no block output is alive.
    pub fn field(&mut self, name: &str) -> Result<ArrayView1<'_, f64>, PoolError> {
        let total_len = self.total_len();
        let field = self
            .fields
            .iter()
            .find(|field| field.name == name)
            .ok_or_else(|| PoolError::UnknownField(name.to_string()))?;
        // SAFETY: `&mut self` rules out a live `BlockOutput`, and the map holds at least
        // `total_len` values.
        let values = unsafe { std::slice::from_raw_parts(field.base.as_ptr(), total_len) };
        Ok(ArrayView1::from(values))
    }

    /// Copies every field out of shared memory and unmaps it.
    pub fn into_arrays(mut self) -> AHashMap<String, Array1<f64>> {
        let names: Vec<String> = self.field_names().map(str::to_string).collect();
        let mut arrays = AHashMap::with_capacity(names.len());
        for name in names {
            if let Ok(view) = self.field(&name) {
                let owned = view.to_owned();
                arrays.insert(name, owned);
            }
        }
        arrays
    }
}

/// Write access to one block's range of every output field.
#[derive(Debug)]
pub struct BlockOutput<'a> {
    index: usize,
    range: Range<usize>,
    fields: Vec<(&'a str, &'a mut [f64])>,
}

impl BlockOutput<'_> {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// This block's range in the full buffer.
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// The block's slice of field `name`, indexed from zero.
    pub fn field_mut(&mut self, name: &str) -> Result<&mut [f64], PoolError> {
        self.fields
            .iter_mut()
            .find(|(field, _)| *field == name)
            .map(|(_, values)| &mut **values)
            .ok_or_else(|| PoolError::UnknownField(name.to_string()))
    }

    /// Copies `values` into the block's slice of field `name`.
    pub fn write(&mut self, name: &str, values: &[f64]) -> Result<(), PoolError> {
        let block = self.index;
        let slot = self.field_mut(name)?;
        if slot.len() != values.len() {
            return Err(PoolError::FieldLength {
                field: name.to_string(),
                block,
                expected: slot.len(),
                found: values.len(),
            });
        }
        slot.copy_from_slice(values);
        Ok(())
    }
}
