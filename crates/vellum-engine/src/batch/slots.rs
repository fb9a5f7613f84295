use smallvec::SmallVec;

use crate::gpu::ResourceHandle;

/// Result of a slot lookup.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlotLookup {
    /// Texture already had this slot in the current epoch.
    Hit(u32),
    /// Texture was given this free slot.
    Assigned(u32),
    /// Every slot is taken; flush and reset the epoch first.
    Exhausted,
}

impl SlotLookup {
    #[inline]
    pub fn slot(self) -> Option<u32> {
        match self {
            SlotLookup::Hit(s) | SlotLookup::Assigned(s) => Some(s),
            SlotLookup::Exhausted => None,
        }
    }
}

/// Maps logical textures onto the backend's physical texture units for one
/// batch epoch.
///
/// Slots are handed out in order, so the slot index is also the index into
/// [`bound`](Self::bound).
#[derive(Debug, Clone)]
pub struct TextureSlotAllocator {
    slots: SmallVec<[ResourceHandle; 16]>,
    max_units: usize,
}

impl TextureSlotAllocator {
    pub fn new(max_units: u32) -> Self {
        Self {
            slots: SmallVec::new(),
            max_units: max_units.max(1) as usize,
        }
    }

    pub fn get_or_assign(&mut self, handle: ResourceHandle) -> SlotLookup {
        if let Some(i) = self.slots.iter().position(|h| *h == handle) {
            return SlotLookup::Hit(i as u32);
        }
        if self.slots.len() >= self.max_units {
            return SlotLookup::Exhausted;
        }
        self.slots.push(handle);
        SlotLookup::Assigned((self.slots.len() - 1) as u32)
    }

    /// Undoes the most recent assignment if it handed out `slot`.
    pub fn revoke(&mut self, slot: u32) {
        if self.slots.len() == slot as usize + 1 {
            self.slots.pop();
        }
    }

    /// Clears every assignment.
    #[inline]
    pub fn reset_epoch(&mut self) {
        self.slots.clear();
    }

    /// Textures of the current epoch, in slot order.
    #[inline]
    pub fn bound(&self) -> &[ResourceHandle] {
        &self.slots
    }

    #[inline]
    pub fn max_units(&self) -> u32 {
        self.max_units as u32
    }

    /// Adopts a new unit budget. Only valid between epochs.
    pub fn set_max_units(&mut self, max_units: u32) {
        debug_assert!(self.slots.is_empty());
        self.max_units = max_units.max(1) as usize;
    }
}
