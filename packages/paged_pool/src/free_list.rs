use crate::{BlockTable, SlotId, SlotMeta};

/// LIFO stack of vacant slots, linked through the slot metadata in the block table.
///
/// The list itself only knows its head and length. Every operation takes the block table
/// that holds the links, which the owning pool guards with the same lock.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<SlotId>,
    len: usize,
}

impl FreeList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Pushes a slot that is currently checked out, marking it vacant.
    ///
    /// # Panics
    ///
    /// Panics if the slot does not exist or is already on the list.
    pub(crate) fn push(&mut self, blocks: &mut BlockTable, slot: SlotId) {
        let block = blocks
            .get_mut(slot.block_index())
            .expect("pushed slot belongs to a live block");

        let meta = block
            .meta(slot.slot_index())
            .expect("pushed slot is a carved slot");

        assert!(
            matches!(meta, SlotMeta::Occupied { .. }),
            "slot {slot:?} pushed onto the free list while already on it"
        );

        block.set_meta(
            slot.slot_index(),
            SlotMeta::Vacant {
                next_free: self.head,
            },
        );

        self.head = Some(slot);

        // Cannot overflow, there cannot be more slots than bytes in the address space.
        self.len = self.len.wrapping_add(1);
    }

    /// Pops the most recently pushed slot and marks it occupied with `generation`.
    pub(crate) fn pop(&mut self, blocks: &mut BlockTable, generation: u64) -> Option<SlotId> {
        let slot = self.head?;

        let block = blocks
            .get_mut(slot.block_index())
            .expect("free list head belongs to a live block");

        let previous = block.set_meta(slot.slot_index(), SlotMeta::Occupied { generation });

        let SlotMeta::Vacant { next_free } = previous else {
            panic!("free list head {slot:?} was not vacant - the free list is corrupted");
        };

        self.head = next_free;

        // Cannot wrap, the list was non-empty.
        self.len = self.len.wrapping_sub(1);

        Some(slot)
    }

    /// Removes every slot for which `keep` returns false, preserving the order of the rest.
    ///
    /// Removed slots are left with dangling links and must be discarded with their blocks.
    pub(crate) fn retain(&mut self, blocks: &mut BlockTable, mut keep: impl FnMut(SlotId) -> bool) {
        let mut kept = Vec::with_capacity(self.len);
        let mut cursor = self.head;

        while let Some(slot) = cursor {
            let meta = blocks
                .get(slot.block_index())
                .and_then(|block| block.meta(slot.slot_index()))
                .copied()
                .expect("free list entries refer to carved slots of live blocks");

            let SlotMeta::Vacant { next_free } = meta else {
                panic!("free list entry {slot:?} was not vacant - the free list is corrupted");
            };

            if keep(slot) {
                kept.push(slot);
            }

            cursor = next_free;
        }

        // Relink the kept slots in their original order, back to front.
        let mut next_free = None;

        for slot in kept.iter().rev() {
            blocks
                .get_mut(slot.block_index())
                .expect("kept slots belong to live blocks")
                .set_meta(slot.slot_index(), SlotMeta::Vacant { next_free });

            next_free = Some(*slot);
        }

        self.head = next_free;
        self.len = kept.len();
    }

    /// Walks the whole list and verifies it against the block table.
    #[cfg(debug_assertions)]
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    pub(crate) fn integrity_check(&self, blocks: &BlockTable) {
        let mut observed_len: usize = 0;
        let mut cursor = self.head;

        while let Some(slot) = cursor {
            observed_len = observed_len.wrapping_add(1);

            assert!(
                observed_len <= self.len,
                "free list is longer than its recorded length {} - it may be cyclic",
                self.len
            );

            let meta = blocks
                .get(slot.block_index())
                .and_then(|block| block.meta(slot.slot_index()))
                .expect("free list entries refer to carved slots of live blocks");

            let SlotMeta::Vacant { next_free } = *meta else {
                panic!("free list entry {slot:?} is marked occupied");
            };

            cursor = next_free;
        }

        assert_eq!(
            observed_len, self.len,
            "free list length does not match its recorded length"
        );

        let vacant_in_blocks = blocks
            .iter()
            .map(|(_, block)| block.carved().wrapping_sub(block.occupied()))
            .sum::<usize>();

        assert_eq!(
            vacant_in_blocks, self.len,
            "number of vacant slots does not match the free list length"
        );
    }
}
