use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Heap buffer that never moves, suitable for registration with the transport.
pub struct PinnedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for PinnedBuffer {}
unsafe impl Sync for PinnedBuffer {}

impl PinnedBuffer {
    pub const ALIGN: usize = 64;

    /// Zeroed buffer of `len` bytes (at least one), aligned on a cache line.
    pub fn new(len: usize) -> PinnedBuffer {
        let layout = Layout::from_size_align(len.max(1), Self::ALIGN)
            .unwrap_or_else(|_| panic!("invalid buffer size {}", len));
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        PinnedBuffer { ptr, layout }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::PinnedBuffer;

    #[test]
    fn zeroed_and_aligned() {
        let mut b = PinnedBuffer::new(100);
        assert_eq!(b.len(), 100);
        assert_eq!(b.as_ptr() as usize % PinnedBuffer::ALIGN, 0);
        assert!(b.as_slice().iter().all(|x| *x == 0));
        b.as_mut_slice()[99] = 1;
        assert_eq!(b.as_slice()[99], 1);
    }
}
