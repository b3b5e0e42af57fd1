use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::slice::{from_raw_parts, from_raw_parts_mut};
use nix::sys::mman;
use thiserror::Error;

/* from linux kernel headers.
#define HUGETLB_FLAG_ENCODE_SHIFT       26
#define HUGETLB_FLAG_ENCODE_MASK        0x3f

#define HUGETLB_FLAG_ENCODE_2MB         (21 << HUGETLB_FLAG_ENCODE_SHIFT)
#define HUGETLB_FLAG_ENCODE_1GB         (30 << HUGETLB_FLAG_ENCODE_SHIFT)
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Base,
    Huge2M,
    Huge1G,
}

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("cannot map an empty region")]
    Empty,
    #[error("mmap of {size} bytes ({pages:?} pages) failed: {source}")]
    Map {
        size: usize,
        pages: PageSize,
        source: nix::Error,
    },
}

/// Anonymous private mapping, pre-faulted and zero initialised, unmapped on drop.
pub struct MMappedMemory {
    pointer: NonNull<u8>,
    size: usize,
}

unsafe impl Send for MMappedMemory {}
unsafe impl Sync for MMappedMemory {}

impl MMappedMemory {
    pub fn new(size: usize, pages: PageSize) -> Result<MMappedMemory, MmapError> {
        let length = NonZeroUsize::new(size).ok_or(MmapError::Empty)?;
        let mut flags = mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_POPULATE;
        match pages {
            PageSize::Base => {}
            PageSize::Huge2M => {
                flags |= mman::MapFlags::MAP_HUGETLB | mman::MapFlags::MAP_HUGE_2MB;
            }
            PageSize::Huge1G => {
                flags |= mman::MapFlags::MAP_HUGETLB | mman::MapFlags::MAP_HUGE_1GB;
            }
        }
        let p = unsafe {
            mman::mmap_anonymous(
                None,
                length,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                flags,
            )
        }
        .map_err(|source| MmapError::Map {
            size,
            pages,
            source,
        })?;
        // Anonymous mappings come zeroed from the kernel.
        Ok(MMappedMemory {
            pointer: p.cast(),
            size,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.pointer.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }
}

impl Drop for MMappedMemory {
    fn drop(&mut self) {
        if let Err(e) = unsafe { mman::munmap(self.pointer.cast(), self.size) } {
            log::warn!("munmap of {} bytes failed: {}", self.size, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MMappedMemory, MmapError, PageSize};

    #[test]
    fn base_pages_are_zeroed() {
        let mut m = MMappedMemory::new(1 << 20, PageSize::Base).unwrap();
        assert_eq!(m.len(), 1 << 20);
        assert!(m.slice().iter().all(|b| *b == 0));
        m.slice_mut()[4096] = 7;
        assert_eq!(m.slice()[4096], 7);
        assert_eq!(unsafe { *m.as_ptr().add(4096) }, 7);
    }

    #[test]
    fn empty_mapping_is_rejected() {
        assert!(matches!(
            MMappedMemory::new(0, PageSize::Base),
            Err(MmapError::Empty)
        ));
    }
}
