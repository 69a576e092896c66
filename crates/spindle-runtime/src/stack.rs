//! Fiber stack allocation using mmap
//!
//! Each fiber stack is a private anonymous mapping with a PROT_NONE guard
//! page at the low end, so overflow faults instead of corrupting the heap.

use spindle_core::constants::GUARD_PAGE_SIZE;
use spindle_core::{SchedError, SchedResult};

/// An owned, guard-paged fiber stack
///
/// The mapping covers `[base, base + total_len)`; the lowest
/// `GUARD_PAGE_SIZE` bytes stay PROT_NONE. The usable region grows down
/// from `top()`.
pub struct FiberStack {
    base: *mut u8,
    total_len: usize,
    usable_len: usize,
}

// The raw pointer is only touched through the owning fiber's context
// switches; the mapping itself is process-global memory.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Allocate a stack with at least `size` usable bytes
    ///
    /// `size` is rounded up to page granularity. Fails with
    /// `SchedError::StackAlloc` if the kernel refuses the mapping.
    pub fn alloc(size: usize) -> SchedResult<Self> {
        let page = page_size();
        let usable_len = (size.max(page) + page - 1) & !(page - 1);
        let total_len = usable_len + GUARD_PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SchedError::StackAlloc);
        }

        // Guard page at the low end; a stack overflow hits PROT_NONE
        let ret = unsafe { libc::mprotect(base, GUARD_PAGE_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe {
                libc::munmap(base, total_len);
            }
            return Err(SchedError::StackAlloc);
        }

        Ok(Self {
            base: base as *mut u8,
            total_len,
            usable_len,
        })
    }

    /// Highest address of the usable region; stacks grow down from here
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total_len) }
    }

    /// Usable stack size in bytes (excludes the guard page)
    #[inline]
    pub fn len(&self) -> usize {
        self.usable_len
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total_len);
        }
    }
}

#[inline]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
