//! Tagalloc is a dynamic memory allocator built on anonymous memory mappings
//! ([`mmap`](https://man7.org/linux/man-pages/man2/mmap.2.html) on Unix,
//! [`VirtualAlloc`](https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc)
//! on Windows).
//!
//! Small allocations are served from fixed size *regions*. Every region is
//! mapped at an address that is a multiple of its own size, so any block can
//! find its enclosing region by masking its address. Inside a region, memory
//! is partitioned into boundary-tagged blocks: a size-and-flags word at both
//! ends of every block. Free blocks are threaded into a per-region doubly
//! linked free list stored inside their own payloads.
//!
//! ```text
//!          +--------+----------+--------+--------+--------+--------+------+
//! root --> | Region | Sentinel |  Used  |  Free  |  Used  |  Free  | Term |
//!          +--------+----------+--------+---^----+--------+---^----+------+
//!          |            block_list ---------+                 |
//!          |                                +---- fl_next ----+
//!          +--> next region ...
//! ```
//!
//! Allocation walks the region list for the first free block that fits,
//! splitting it when the remainder is worth keeping. Release merges the freed
//! block with its free neighbors immediately and returns the whole region to
//! the operating system the moment its last used block goes away. Requests
//! above a configurable threshold bypass regions entirely and get their own
//! standalone mapping, see [`crate::large`].
//!
//! The entry point is [`TagAlloc`], which also implements
//! [`std::alloc::GlobalAlloc`] so it can serve as `#[global_allocator]`.

use std::ptr::NonNull;

mod allocator;
mod block;
mod config;
mod counters;
mod freelist;
mod large;
mod platform;
mod region;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case. A `None` here plays the role a null pointer plays in a C allocator.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use allocator::TagAlloc;
pub use config::Config;
pub use counters::Counters;
