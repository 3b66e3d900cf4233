//! Fixed scratch-buffer arena for transfer sessions
//!
//! A scratch region is partitioned once into N equally sized slots. Slots are
//! move-only values: whoever holds a `BufferSlot` owns it, so a slot can sit
//! in exactly one queue, worker, or handler at a time. The pool only tracks
//! which slot indices are checked out so a session can prove every slot came
//! back before it ends.

use crate::error::{SetupError, SlotError};

/// Reference scratch size (8 KiB)
pub const DEFAULT_SLOT_SIZE: usize = 8 * 1024;
/// Reference slot count for the asynchronous pipeline
pub const DEFAULT_SLOT_COUNT: usize = 3;

/// One fixed-capacity region of the scratch arena plus its fill level.
#[derive(Debug)]
pub struct BufferSlot {
    index: usize,
    data: Box<[u8]>,
    len: usize,
}

impl BufferSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes staged in the slot
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole region, for reading into. Call `set_len` afterwards.
    pub fn space_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record how many bytes are staged; clamped to capacity.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.len = len.min(self.data.len());
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Slot-indexed arena. Never grows after construction.
#[derive(Debug)]
pub struct BufferPool {
    slot_size: usize,
    slots: Vec<Option<BufferSlot>>,
}

impl BufferPool {
    /// Partition `region` into `count` non-overlapping slots of equal size.
    /// Trailing bytes that don't fill a whole slot are discarded.
    ///
    /// Each slot owns a copy of its part of `region`; the caller's buffer is
    /// released once the slots are built.
    pub fn partition(region: Vec<u8>, count: usize) -> Result<Self, SetupError> {
        let region_len = region.len();
        if count == 0 || region_len < count {
            return Err(SetupError::InvalidGeometry {
                count,
                region: region_len,
            });
        }
        let slot_size = region_len / count;
        let slots = region
            .chunks_exact(slot_size)
            .take(count)
            .map(Box::<[u8]>::from)
            .collect();
        Ok(Self::from_regions(slot_size, slots))
    }

    /// Allocate `count` zeroed slots of `slot_size` bytes each.
    pub fn with_geometry(count: usize, slot_size: usize) -> Result<Self, SetupError> {
        let region_len = count.checked_mul(slot_size).ok_or_else(|| {
            SetupError::ResourceExhausted(format!("{count} x {slot_size} byte slots"))
        })?;
        if count == 0 || slot_size == 0 {
            return Err(SetupError::InvalidGeometry {
                count,
                region: region_len,
            });
        }
        let slots = (0..count)
            .map(|_| vec![0u8; slot_size].into_boxed_slice())
            .collect();
        Ok(Self::from_regions(slot_size, slots))
    }

    fn from_regions(slot_size: usize, regions: Vec<Box<[u8]>>) -> Self {
        let slots = regions
            .into_iter()
            .enumerate()
            .map(|(index, data)| Some(BufferSlot { index, data, len: 0 }))
            .collect();
        BufferPool { slot_size, slots }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently held by the pool
    pub fn available(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Slots currently checked out (in a queue, a worker, or a handler)
    pub fn outstanding(&self) -> usize {
        self.slot_count() - self.available()
    }

    pub fn is_complete(&self) -> bool {
        self.outstanding() == 0
    }

    /// Check out any free slot.
    pub fn take(&mut self) -> Option<BufferSlot> {
        self.slots.iter_mut().find_map(Option::take)
    }

    /// Check out every free slot, lowest index first.
    pub fn take_all(&mut self) -> Vec<BufferSlot> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    /// Return a slot to the pool. A slot index that is already present means
    /// two holders existed, which is reported instead of silently merged.
    pub fn reclaim(&mut self, mut slot: BufferSlot) -> Result<(), SlotError> {
        let index = slot.index;
        let entry = self
            .slots
            .get_mut(index)
            .ok_or(SlotError::OutOfRange(index))?;
        if entry.is_some() {
            return Err(SlotError::AlreadyHeld(index));
        }
        slot.clear();
        *entry = Some(slot);
        Ok(())
    }
}
