use std::alloc::Layout;
use std::num::NonZero;

use crate::{Error, Result};

/// Layout calculations that subdivide backing blocks into object slots.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct BlockGeometry {
    /// The object layout the pool was configured with.
    object_layout: Layout,

    /// Distance between the starts of consecutive slots. A multiple of the object alignment.
    stride: NonZero<usize>,

    /// Size of each backing block, a whole number of pages.
    block_size: NonZero<usize>,

    /// Number of slots each backing block is subdivided into.
    slots_per_block: NonZero<usize>,
}

impl BlockGeometry {
    /// Calculates the geometry for objects of `object_layout` backed by pages of `page_size`.
    ///
    /// Objects that fit in a page share a single-page block. Larger objects each get a block
    /// of their size rounded up to whole pages.
    pub(crate) fn calculate(object_layout: Layout, page_size: NonZero<usize>) -> Result<Self> {
        let stride =
            NonZero::new(object_layout.pad_to_align().size()).ok_or(Error::ZeroSizedObject)?;

        if object_layout.align() > page_size.get() {
            return Err(Error::InvalidLayout {
                size: object_layout.size(),
                align: object_layout.align(),
                problem: format!("alignment exceeds the page size of {page_size} bytes"),
            });
        }

        let block_size = if stride <= page_size {
            page_size
        } else {
            stride
                .get()
                .checked_next_multiple_of(page_size.get())
                .and_then(NonZero::new)
                .ok_or(Error::ObjectTooLarge {
                    size: object_layout.size(),
                    page_size: page_size.get(),
                })?
        };

        // Page stores must be able to describe the block as a layout.
        if Layout::from_size_align(block_size.get(), page_size.get()).is_err() {
            return Err(Error::ObjectTooLarge {
                size: object_layout.size(),
                page_size: page_size.get(),
            });
        }

        let slots_per_block = block_size
            .get()
            .checked_div(stride.get())
            .and_then(NonZero::new)
            .expect("block size is at least the stride, so at least one slot fits");

        Ok(Self {
            object_layout,
            stride,
            block_size,
            slots_per_block,
        })
    }

    pub(crate) fn object_layout(&self) -> Layout {
        self.object_layout
    }

    pub(crate) fn stride(&self) -> NonZero<usize> {
        self.stride
    }

    pub(crate) fn block_size(&self) -> NonZero<usize> {
        self.block_size
    }

    pub(crate) fn slots_per_block(&self) -> NonZero<usize> {
        self.slots_per_block
    }

    /// Byte offset of a slot from the start of its block.
    pub(crate) fn slot_offset(&self, slot_index: usize) -> usize {
        debug_assert!(slot_index < self.slots_per_block.get());

        // Cannot overflow, the slot lies within a block that exists in memory.
        slot_index.wrapping_mul(self.stride.get())
    }

    /// The slot starting at byte `offset` from the start of a block, if `offset` is exactly
    /// on a slot boundary within the block.
    pub(crate) fn slot_at_offset(&self, offset: usize) -> Option<usize> {
        if offset % self.stride.get() != 0 {
            return None;
        }

        let index = offset.checked_div(self.stride.get())?;
        (index < self.slots_per_block.get()).then_some(index)
    }
}
