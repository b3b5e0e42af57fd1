#![deny(unsafe_op_in_unsafe_fn)]

pub mod affinity;
pub mod clock;
pub mod dram_addressing;
pub mod mmap;

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64 as arch_x86;
use core::ptr;

/// Bytes in a cache line, the stride used when touching memory.
pub const CACHE_LINE_SIZE: usize = 64;

// rdtsc (has mfence before and after)
#[cfg(target_arch = "x86_64")]
pub unsafe fn rdtsc_fence() -> u64 {
    unsafe {
        arch_x86::_mm_mfence();
        let tsc: u64 = arch_x86::_rdtsc();
        arch_x86::_mm_mfence();
        tsc
    }
}

// rdtscp, waits for all previous instructions to retire
#[cfg(target_arch = "x86_64")]
pub unsafe fn rdtscp() -> u64 {
    let mut aux = 0u32;
    unsafe { arch_x86::__rdtscp(&mut aux) }
}

/// Write a fresh buffer of `size` bytes, one store per line, so the last level cache is filled with
/// lines that nobody will read again.
pub fn thrash_cache(size: usize) {
    let mut thrash = vec![0u8; size];
    for line in thrash.chunks_mut(CACHE_LINE_SIZE) {
        unsafe { ptr::write_volatile(line.as_mut_ptr(), 1) };
    }
    thrash.fill(0);
    std::hint::black_box(&thrash);
}
