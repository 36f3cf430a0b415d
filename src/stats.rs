use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Live operation counters for one handle
        #[derive(Debug, Default)]
        pub(crate) struct Counters {
            $(pub(crate) $name: AtomicU64,)*
        }

        /// Point-in-time copy of a handle's counters
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct Stats {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl Counters {
            pub(crate) fn snapshot(&self) -> Stats {
                Stats {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Successful allocations
    allocs,
    /// Allocations that split off a leftover free record
    alloc_subtract,
    /// Allocations satisfied from the first bucket tried
    alloc_bucket_exact,
    /// Allocations satisfied from the catch-all bucket
    alloc_bucket_max,
    /// Records handed to coalescing
    alloc_coalesce_tried,
    /// Housekeeping passes over a bucket
    alloc_coalesce_iterate_clash,
    /// Merges abandoned because a bucket lock was busy
    alloc_coalesce_lockfail,
    /// Merges abandoned because the neighbour changed under us
    alloc_coalesce_race,
    /// Coalescing attempts that merged something
    alloc_coalesce_succeeded,
    /// Neighbouring records absorbed by merges
    alloc_coalesce_num_merged,
    /// File expansions
    expands,
    /// Records returned to a free list
    frees,
    /// Lock requests, including nested ones
    locks,
    /// Locks actually taken from the OS
    lock_lowlevel,
    /// Locks actually released to the OS
    unlock_lowlevel,
    /// Non-blocking OS lock requests
    lock_nonblock,
    /// Non-blocking OS lock requests that would have blocked
    lock_nonblock_fail,
}

impl Counters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
