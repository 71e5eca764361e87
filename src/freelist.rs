//! Free-list stacks.
//!
//! A list owns no storage of its own: each link lives in the freed frame's
//! metadata record, so frame contents stay junk-filled while free.

use crate::{frame::Frame, frame_info::InfoTable};

/// A LIFO stack of free frames. The most recently pushed frame is handed
/// out first.
#[derive(Debug)]
pub(crate) struct FreeList {
    head: Option<Frame>,
    len: usize,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub(crate) fn push(&mut self, table: &InfoTable, frame: Frame) {
        let info = table
            .get(frame)
            .unwrap_or_else(|| panic!("no metadata record for freed frame {frame:?}"));
        info.set_next_free(self.head);
        self.head = Some(frame);
        self.len += 1;
    }

    pub(crate) fn pop(&mut self, table: &InfoTable) -> Option<Frame> {
        let frame = self.head?;
        let info = table
            .get(frame)
            .unwrap_or_else(|| panic!("no metadata record for free frame {frame:?}"));
        self.head = info.next_free();
        info.set_next_free(None);
        self.len -= 1;
        Some(frame)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}
