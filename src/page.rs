//! Physical frames.

use crate::addr::{Length, PhysAddress, PhysExtent};

use static_assertions::const_assert;

pub const PAGE_SIZE: Length = Length::from_raw(4096);

/// `PAGE_SIZE` as a plain byte count, for buffer types.
pub const PAGE_BYTES: usize = PAGE_SIZE.as_raw() as usize;

const_assert!(PAGE_BYTES.is_power_of_two());

/// A 4 KiB physical memory frame
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Frame {
    start: PhysAddress,
}

impl Frame {
    /// Creates a `Frame` representing the frame beginning at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not aligned to `PAGE_SIZE`.
    pub fn new(start: PhysAddress) -> Frame {
        assert!(start.is_aligned_to(PAGE_SIZE.as_raw()));
        Frame { start }
    }

    /// Gets the `Frame` that contains `addr`.
    pub fn containing(addr: PhysAddress) -> Frame {
        Self::new(addr.align_down(PAGE_SIZE.as_raw()))
    }

    /// The frame with the given frame number.
    pub fn with_index(index: u64) -> Frame {
        Frame {
            start: PhysAddress::from_raw(index.checked_mul(PAGE_SIZE.as_raw()).unwrap()),
        }
    }

    /// Start address of the frame
    pub fn start(self) -> PhysAddress {
        self.start
    }

    /// Frame number: the start address divided by the page size.
    pub fn index(self) -> u64 {
        self.start.as_raw() / PAGE_SIZE.as_raw()
    }

    /// Extent of memory contained in the frame
    pub fn extent(self) -> PhysExtent {
        PhysExtent::new(self.start, PAGE_SIZE)
    }

    /// The nth frame after `self`, or `None` if it's not addressable
    pub fn next(self, n: u64) -> Option<Frame> {
        let next_start = self
            .start
            .offset_by_checked(Length::from_raw(PAGE_SIZE.as_raw().checked_mul(n)?))?;
        Some(Self::new(next_start))
    }
}

/// A contiguous range of physical memory frames. Always non-empty.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameRange {
    first: Frame,
    count: u64,
}

impl FrameRange {
    pub fn new(first: Frame, count: u64) -> Option<FrameRange> {
        if count == 0 {
            return None;
        }

        // The range must not run off the end of the address space.
        if first.next(count - 1).is_none() {
            return None;
        }

        Some(FrameRange { first, count })
    }

    /// All whole frames covered by `extent`, which must be page aligned.
    pub fn covering(extent: PhysExtent) -> FrameRange {
        assert!(extent.is_aligned_to(PAGE_SIZE.as_raw()));
        FrameRange {
            first: Frame::new(extent.address()),
            count: extent.length().as_raw() / PAGE_SIZE.as_raw(),
        }
    }

    pub fn first(&self) -> Frame {
        self.first
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    // The last `Frame` within the range
    pub fn last(&self) -> Frame {
        self.first.next(self.count - 1).unwrap()
    }

    pub fn iter(&self) -> impl Iterator<Item = Frame> {
        let first = self.first;
        (0..self.count).map(move |n| first.next(n).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_construction() {
        let f = Frame::new(PhysAddress::from_raw(8192));
        assert_eq!(f.index(), 2);
        assert_eq!(f, Frame::with_index(2));
        assert_eq!(Frame::containing(PhysAddress::from_raw(8195)), f);
        assert_eq!(f.next(3).unwrap(), Frame::with_index(5));
    }

    #[test]
    #[should_panic]
    fn frame_must_be_aligned() {
        Frame::new(PhysAddress::from_raw(123));
    }

    #[test]
    fn range_covering() {
        let range = FrameRange::covering(PhysExtent::from_raw(4096, 3 * 4096));
        assert_eq!(range.count(), 3);
        assert_eq!(range.first(), Frame::with_index(1));
        assert_eq!(range.last(), Frame::with_index(3));

        let indexes: Vec<u64> = range.iter().map(Frame::index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
    }

    #[test]
    fn range_must_not_be_empty() {
        assert_eq!(FrameRange::new(Frame::with_index(0), 0), None);
    }
}
