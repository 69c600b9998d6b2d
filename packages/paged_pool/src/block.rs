use std::collections::BTreeMap;
use std::ptr::NonNull;

use crate::{BackingBlock, BlockGeometry};

/// Byte pattern written over objects on the free list when poisoning is enabled.
pub(crate) const POISON_BYTE: u8 = 0xA5;

/// Generation of slots that have been carved but never handed out. Real checkouts are
/// numbered from 1, so no handle can ever match it.
pub(crate) const UNLINKED_GENERATION: u64 = 0;

/// Coordinates of an object slot within a pool.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct SlotId {
    /// Index of the block in the pool's block table.
    block_index: usize,

    /// Index of the slot within its block.
    slot_index: usize,
}

impl SlotId {
    #[must_use]
    pub(crate) fn new(block_index: usize, slot_index: usize) -> Self {
        Self {
            block_index,
            slot_index,
        }
    }

    #[must_use]
    pub(crate) fn block_index(&self) -> usize {
        self.block_index
    }

    #[must_use]
    pub(crate) fn slot_index(&self) -> usize {
        self.slot_index
    }
}

/// Side-table metadata for one carved slot. The free list is threaded through these entries
/// instead of through the objects themselves, so a corrupted object cannot corrupt the list.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SlotMeta {
    /// The slot is on the free list.
    Vacant {
        /// The next slot on the free list, if any.
        next_free: Option<SlotId>,
    },

    /// The slot has been handed out and not yet returned.
    Occupied {
        /// Pool-unique number of the checkout, used to reject stale handles.
        generation: u64,
    },
}

/// A backing block subdivided into object slots.
///
/// Slots are carved lazily from the start of the block: only the first `slots.len()` slots
/// are pool objects, the rest of the block is untouched backing memory.
#[derive(Debug)]
pub(crate) struct PoolBlock {
    backing: BackingBlock,
    slots: Vec<SlotMeta>,

    /// Number of carved slots that are currently [`SlotMeta::Occupied`].
    occupied: usize,
}

impl PoolBlock {
    pub(crate) fn new(backing: BackingBlock, geometry: &BlockGeometry) -> Self {
        debug_assert_eq!(backing.size(), geometry.block_size().get());
        debug_assert_eq!(
            backing.ptr().addr().get() % geometry.object_layout().align(),
            0
        );

        Self {
            backing,
            slots: Vec::with_capacity(geometry.slots_per_block().get()),
            occupied: 0,
        }
    }

    /// Number of slots carved into pool objects so far.
    pub(crate) fn carved(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots that can still be carved from the block.
    pub(crate) fn uncarved(&self, geometry: &BlockGeometry) -> usize {
        geometry.slots_per_block().get().wrapping_sub(self.slots.len())
    }

    /// Whether none of the carved slots are checked out.
    pub(crate) fn is_idle(&self) -> bool {
        self.occupied == 0
    }

    pub(crate) fn occupied(&self) -> usize {
        self.occupied
    }

    /// Carves the next slot and returns its index.
    ///
    /// A new slot starts out checked out to the pool itself, with generation
    /// [`UNLINKED_GENERATION`], ready to be pushed onto the free list like any returned object.
    ///
    /// # Panics
    ///
    /// Panics if the block is fully carved.
    pub(crate) fn carve(&mut self, geometry: &BlockGeometry, poison: bool) -> usize {
        assert!(
            self.uncarved(geometry) > 0,
            "cannot carve a slot from a fully carved block"
        );

        let slot_index = self.slots.len();
        self.slots.push(SlotMeta::Occupied {
            generation: UNLINKED_GENERATION,
        });

        // Cannot overflow, bounded by the number of slots in the block.
        self.occupied = self.occupied.wrapping_add(1);

        if poison {
            self.fill(geometry, slot_index, POISON_BYTE);
        }

        slot_index
    }

    pub(crate) fn meta(&self, slot_index: usize) -> Option<&SlotMeta> {
        self.slots.get(slot_index)
    }

    /// Replaces the metadata of a carved slot, keeping the occupancy count in step.
    pub(crate) fn set_meta(&mut self, slot_index: usize, meta: SlotMeta) -> SlotMeta {
        let entry = self
            .slots
            .get_mut(slot_index)
            .expect("slot index refers to a carved slot");

        let previous = std::mem::replace(entry, meta);

        // Neither can wrap: occupied only moves between 0 and the number of carved slots.
        match (previous, meta) {
            (SlotMeta::Vacant { .. }, SlotMeta::Occupied { .. }) => {
                self.occupied = self.occupied.wrapping_add(1);
            }
            (SlotMeta::Occupied { .. }, SlotMeta::Vacant { .. }) => {
                self.occupied = self.occupied.wrapping_sub(1);
            }
            _ => {}
        }

        previous
    }

    /// Pointer to the first byte of a slot.
    pub(crate) fn slot_ptr(&self, geometry: &BlockGeometry, slot_index: usize) -> NonNull<u8> {
        assert!(
            slot_index < geometry.slots_per_block().get(),
            "slot {slot_index} out of bounds in block of {} slots",
            geometry.slots_per_block()
        );

        // SAFETY: The slot lies within the block, as asserted above.
        unsafe { self.backing.ptr().add(geometry.slot_offset(slot_index)) }
    }

    /// The carved slot starting exactly at `addr`, if any.
    pub(crate) fn slot_at(&self, geometry: &BlockGeometry, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.backing.ptr().addr().get())?;

        geometry
            .slot_at_offset(offset)
            .filter(|slot_index| *slot_index < self.slots.len())
    }

    /// Overwrites the object bytes of a slot.
    pub(crate) fn fill(&mut self, geometry: &BlockGeometry, slot_index: usize, byte: u8) {
        let ptr = self.slot_ptr(geometry, slot_index);

        // SAFETY: The slot lies within our backing block, which we own. Callers only fill
        // slots that are vacant or that they are about to hand out, so nobody else is
        // entitled to access the memory right now.
        unsafe {
            ptr.write_bytes(byte, geometry.object_layout().size());
        }
    }

    /// Whether every object byte of a slot still holds the poison pattern.
    pub(crate) fn is_poison_intact(&self, geometry: &BlockGeometry, slot_index: usize) -> bool {
        let ptr = self.slot_ptr(geometry, slot_index);

        // SAFETY: The slot lies within our backing block and was filled with the poison
        // pattern when it became vacant, so all bytes are initialized.
        let bytes =
            unsafe { std::slice::from_raw_parts(ptr.as_ptr(), geometry.object_layout().size()) };

        bytes.iter().all(|byte| *byte == POISON_BYTE)
    }

    pub(crate) fn backing(&self) -> &BackingBlock {
        &self.backing
    }

    pub(crate) fn into_backing(self) -> BackingBlock {
        self.backing
    }
}

/// The backing blocks owned by a pool, addressable by index and by memory address.
///
/// Indexes of released blocks are reused for later blocks.
#[derive(Debug, Default)]
pub(crate) struct BlockTable {
    blocks: Vec<Option<PoolBlock>>,

    /// Start address of each live block, mapped to its index.
    by_address: BTreeMap<usize, usize>,

    /// Indexes in `blocks` that hold `None`.
    vacant_indexes: Vec<usize>,
}

impl BlockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of live blocks.
    pub(crate) fn len(&self) -> usize {
        self.by_address.len()
    }

    pub(crate) fn insert(&mut self, block: PoolBlock) -> usize {
        let addr = block.backing().ptr().addr().get();

        let index = if let Some(index) = self.vacant_indexes.pop() {
            let entry = self
                .blocks
                .get_mut(index)
                .expect("vacant block indexes are always in bounds");
            debug_assert!(entry.is_none());
            *entry = Some(block);
            index
        } else {
            self.blocks.push(Some(block));
            self.blocks.len().wrapping_sub(1)
        };

        let previous = self.by_address.insert(addr, index);
        assert!(
            previous.is_none(),
            "page store handed out a block at {addr:#x} that the pool already owns"
        );

        index
    }

    pub(crate) fn remove(&mut self, index: usize) -> PoolBlock {
        let block = self
            .blocks
            .get_mut(index)
            .and_then(Option::take)
            .expect("removed block index refers to a live block");

        self.by_address.remove(&block.backing().ptr().addr().get());
        self.vacant_indexes.push(index);

        block
    }

    pub(crate) fn get(&self, index: usize) -> Option<&PoolBlock> {
        self.blocks.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut PoolBlock> {
        self.blocks.get_mut(index).and_then(Option::as_mut)
    }

    /// The index of the live block containing `addr`, if any.
    pub(crate) fn locate(&self, addr: usize) -> Option<usize> {
        let (_, index) = self.by_address.range(..=addr).next_back()?;

        self.get(*index)
            .filter(|block| block.backing().contains(addr))
            .map(|_| *index)
    }

    /// Iterates over the live blocks and their indexes.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &PoolBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(index, block)| block.as_ref().map(|block| (index, block)))
    }

    /// Removes every block from the table.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = PoolBlock> {
        self.by_address.clear();
        self.vacant_indexes.clear();
        self.blocks.drain(..).flatten()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::indexing_slicing,
    reason = "test code doesn't need the same rigor as production code"
)]
mod tests {
    use std::alloc::Layout;

    use new_zealand::nz;

    use super::*;
    use crate::{AllocTag, HeapPages, PageStore};

    fn geometry() -> BlockGeometry {
        BlockGeometry::calculate(Layout::from_size_align(64, 8).unwrap(), nz!(4096)).unwrap()
    }

    fn block(pages: &HeapPages) -> PoolBlock {
        let backing = pages.acquire_pages(4096, AllocTag::GENERIC).unwrap();
        PoolBlock::new(backing, &geometry())
    }

    fn release(pages: &HeapPages, block: PoolBlock) {
        pages.release_pages(block.into_backing(), AllocTag::GENERIC);
    }

    #[test]
    fn carving_is_lazy_and_bounded() {
        let pages = HeapPages::new();
        let geometry = geometry();
        let mut block = block(&pages);

        assert_eq!(block.carved(), 0);
        assert_eq!(block.uncarved(&geometry), 64);

        assert_eq!(block.carve(&geometry, false), 0);
        assert_eq!(block.carve(&geometry, false), 1);
        assert_eq!(block.carved(), 2);
        assert_eq!(block.uncarved(&geometry), 62);

        // Fresh slots belong to the pool until they are linked into its free list.
        assert_eq!(block.occupied(), 2);
        assert_eq!(
            block.meta(0),
            Some(&SlotMeta::Occupied {
                generation: UNLINKED_GENERATION
            })
        );

        release(&pages, block);
    }

    #[test]
    fn occupancy_follows_metadata() {
        let pages = HeapPages::new();
        let geometry = geometry();
        let mut block = block(&pages);
        block.carve(&geometry, false);

        block.set_meta(0, SlotMeta::Vacant { next_free: None });
        assert!(block.is_idle());

        block.set_meta(0, SlotMeta::Occupied { generation: 7 });
        assert_eq!(block.occupied(), 1);
        assert!(!block.is_idle());

        let previous = block.set_meta(0, SlotMeta::Vacant { next_free: None });
        assert_eq!(previous, SlotMeta::Occupied { generation: 7 });
        assert!(block.is_idle());

        release(&pages, block);
    }

    #[test]
    fn slot_lookup_by_address() {
        let pages = HeapPages::new();
        let geometry = geometry();
        let mut block = block(&pages);
        block.carve(&geometry, false);
        block.carve(&geometry, false);

        let second = block.slot_ptr(&geometry, 1).addr().get();
        assert_eq!(block.slot_at(&geometry, second), Some(1));
        assert_eq!(block.slot_at(&geometry, second + 1), None);

        // Carved slots only.
        let third = block.slot_ptr(&geometry, 2).addr().get();
        assert_eq!(block.slot_at(&geometry, third), None);

        release(&pages, block);
    }

    #[test]
    fn poison_detects_modification() {
        let pages = HeapPages::new();
        let geometry = geometry();
        let mut block = block(&pages);
        block.carve(&geometry, true);

        assert!(block.is_poison_intact(&geometry, 0));

        // SAFETY: The slot is within the block and we are the only user.
        unsafe {
            block.slot_ptr(&geometry, 0).add(10).write(0);
        }

        assert!(!block.is_poison_intact(&geometry, 0));

        release(&pages, block);
    }

    #[test]
    fn table_reuses_indexes_and_locates_by_address() {
        let pages = HeapPages::new();
        let geometry = geometry();
        let mut table = BlockTable::new();

        let a = table.insert(block(&pages));
        let b = table.insert(block(&pages));
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.len(), 2);

        let inside_b = table.get(b).unwrap().slot_ptr(&geometry, 5).addr().get();
        assert_eq!(table.locate(inside_b), Some(b));

        release(&pages, table.remove(a));
        assert!(table.get(a).is_none());

        let c = table.insert(block(&pages));
        assert_eq!(c, a);
        assert_eq!(table.iter().count(), 2);

        for block in table.drain().collect::<Vec<_>>() {
            release(&pages, block);
        }
        assert_eq!(table.len(), 0);
        assert_eq!(pages.stats().bytes_in_use, 0);
    }

    #[test]
    fn foreign_addresses_are_not_located() {
        let pages = HeapPages::new();
        let mut table = BlockTable::new();
        let index = table.insert(block(&pages));

        let foreign = [0_u8; 16];
        assert_eq!(table.locate(foreign.as_ptr().addr()), None);

        release(&pages, table.remove(index));
    }
}
