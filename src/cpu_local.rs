//! The per-CPU freelist head slot, in two observably-equivalent flavors.
//!
//! Only the owning CPU pushes and pops through this slot on the fast path;
//! the retry loop (or critical section) exists so an interrupt handler
//! re-entering the allocator on the same CPU cannot tear an update. Other
//! CPUs only ever `take` the slot wholesale, during flush/deactivation,
//! which both backends implement as one atomic exchange.
//!
//! The default backend is a lock-free CAS loop. Architectures without a
//! usable CAS select the `critical_section` feature and get a spinlocked
//! cell with the same API instead.

#[cfg(not(feature = "critical_section"))]
pub(crate) use cas::CpuLocalSlot;

#[cfg(feature = "critical_section")]
pub(crate) use locked::CpuLocalSlot;

#[cfg(not(feature = "critical_section"))]
mod cas {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use crate::slab::{read_free_ptr, write_free_ptr};
    use crate::FREELIST_END;

    pub(crate) struct CpuLocalSlot {
        head: AtomicUsize,
    }

    impl CpuLocalSlot {
        pub fn new() -> Self {
            Self {
                head: AtomicUsize::new(FREELIST_END),
            }
        }

        /// Pop the head object, following its intrusive link.
        pub fn pop(&self, fp_offset: usize) -> Option<usize> {
            loop {
                let head = self.head.load(Ordering::Acquire);
                if head == FREELIST_END {
                    return None;
                }
                let next = unsafe { read_free_ptr(head, fp_offset) };
                if self
                    .head
                    .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(head);
                }
            }
        }

        /// Push one object, linking it to the current head.
        pub fn push(&self, obj: usize, fp_offset: usize) {
            loop {
                let head = self.head.load(Ordering::Acquire);
                unsafe { write_free_ptr(obj, fp_offset, head) };
                if self
                    .head
                    .compare_exchange_weak(head, obj, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            }
        }

        /// Detach the whole list, leaving the slot empty. Used by refill
        /// hand-off and by flush takeover from another CPU.
        pub fn take(&self) -> usize {
            self.head.swap(FREELIST_END, Ordering::AcqRel)
        }

        /// Install a whole list. Owner only, slot must be empty.
        pub fn set(&self, head: usize) {
            self.head.store(head, Ordering::Release);
        }
    }
}

#[cfg(feature = "critical_section")]
mod locked {
    use spin::Mutex;

    use crate::slab::{read_free_ptr, write_free_ptr};
    use crate::FREELIST_END;

    /// Critical-section backend: every operation runs under a short spin
    /// lock standing in for the interrupt-disabled window a kernel port
    /// would use.
    pub(crate) struct CpuLocalSlot {
        head: Mutex<usize>,
    }

    impl CpuLocalSlot {
        pub fn new() -> Self {
            Self {
                head: Mutex::new(FREELIST_END),
            }
        }

        pub fn pop(&self, fp_offset: usize) -> Option<usize> {
            let mut head = self.head.lock();
            if *head == FREELIST_END {
                return None;
            }
            let obj = *head;
            *head = unsafe { read_free_ptr(obj, fp_offset) };
            Some(obj)
        }

        pub fn push(&self, obj: usize, fp_offset: usize) {
            let mut head = self.head.lock();
            unsafe { write_free_ptr(obj, fp_offset, *head) };
            *head = obj;
        }

        pub fn take(&self) -> usize {
            let mut head = self.head.lock();
            core::mem::replace(&mut *head, FREELIST_END)
        }

        pub fn set(&self, new_head: usize) {
            *self.head.lock() = new_head;
        }
    }
}
