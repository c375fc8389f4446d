use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific memory handling. The allocator only
/// needs to request chunks of memory and return them when they are no longer
/// in use, but it doesn't care about the APIs offered by the underlying
/// kernel or libraries.
trait PlatformSpecificMemory {
    /// Requests a memory chunk from the kernel where `length` bytes can be
    /// written safely. The result is page aligned, nothing more.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Requests a memory chunk of `length` bytes whose base address is a
    /// multiple of `length`. `length` must be a power of two multiple of the
    /// page size. Regions rely on this so that any address inside one can be
    /// masked down to the region base.
    unsafe fn request_aligned(length: usize) -> Pointer<u8>;

    /// Returns `length` bytes starting at `address` to the kernel. `address`
    /// must come from [`Self::request_memory`] or be a page aligned subrange
    /// of one such chunk.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);

    /// Returns a chunk previously obtained with [`Self::request_aligned`].
    unsafe fn return_aligned(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
pub(crate) struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time.
static mut PAGE_SIZE: usize = 0;

/// We only know the value of the page size at runtime by calling into the
/// OS, so we'll mutate a global variable and reuse it afterwards.
#[inline]
pub(crate) fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = Platform::page_size();
        }

        PAGE_SIZE
    }
}

/// Convenience wrapper for [`PlatformSpecificMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    Platform::request_memory(length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::request_aligned`].
#[inline]
pub(crate) unsafe fn request_aligned(length: usize) -> Pointer<u8> {
    debug_assert!(length.is_power_of_two());
    Platform::request_aligned(length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::return_aligned`].
#[inline]
pub(crate) unsafe fn return_aligned(address: NonNull<u8>, length: usize) {
    Platform::return_aligned(address, length)
}

/// Stores the platform's "out of memory" code where the C standard library
/// keeps errno. Only needed by `resize_array`, which reports multiplication
/// overflow the way `reallocarray` does.
#[cfg(all(target_os = "linux", not(miri)))]
pub(crate) fn set_oom_errno() {
    unsafe { *libc::__errno_location() = libc::ENOMEM }
}

#[cfg(all(unix, not(target_os = "linux"), not(miri)))]
pub(crate) fn set_oom_errno() {
    unsafe { *libc::__error() = libc::ENOMEM }
}

#[cfg(any(windows, miri))]
pub(crate) fn set_oom_errno() {}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Memory should be private to our process and not mapped to any
            // file. For all the options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);

            if address == libc::MAP_FAILED {
                None
            } else {
                Some(NonNull::new_unchecked(address).cast())
            }
        }

        unsafe fn request_aligned(length: usize) -> Pointer<u8> {
            let address = Self::request_memory(length)?;
            if address.as_ptr() as usize % length == 0 {
                return Some(address);
            }

            // The kernel gave us a misaligned mapping. Give it back and map
            // twice the length instead: that range must contain exactly one
            // aligned subrange of `length` bytes, which we keep, unmapping
            // the slices on both sides.
            Self::return_memory(address, length);

            let address = Self::request_memory(2 * length)?;
            let base = address.as_ptr() as usize;

            if base % length == 0 {
                // Already aligned, drop the second half.
                let upper = NonNull::new_unchecked((base + length) as *mut u8);
                Self::return_memory(upper, length);
                return Some(address);
            }

            let aligned = (base | (length - 1)) + 1;
            let leading = aligned - base;

            Self::return_memory(address, leading);

            // The trailing slice is never empty because `base` was not
            // aligned.
            let trailing = NonNull::new_unchecked((aligned + length) as *mut u8);
            Self::return_memory(trailing, length - leading);

            Some(NonNull::new_unchecked(aligned as *mut u8))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // TODO: What should we do here? Panic? Memory region is still
                // valid here, it wasn't unmapped.
            }
        }

        unsafe fn return_aligned(address: NonNull<u8>, length: usize) {
            Self::return_memory(address, length);
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{ffi::c_void, mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    /// `VirtualFree` cannot release part of an allocation, so alignment works
    /// by reserving a larger span to discover an aligned base and then
    /// mapping at that exact address. Another thread can steal the address in
    /// between, hence a bounded number of attempts.
    const ALIGN_ATTEMPTS: usize = 8;

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Similar to mmap on Linux, Read-Write only. Memory has to be
            // reserved first and then committed in order to become usable,
            // both can be done in a single call. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn request_aligned(length: usize) -> Pointer<u8> {
            for _ in 0..ALIGN_ATTEMPTS {
                let address = Self::request_memory(length)?;
                let base = address.as_ptr() as usize;
                if base % length == 0 {
                    return Some(address);
                }
                Self::return_memory(address, length);

                // Reserve double the length without committing, just to learn
                // an address where an aligned mapping fits, then release the
                // whole reservation and map again at the aligned base.
                let probe = Memory::VirtualAlloc(
                    None,
                    2 * length,
                    Memory::MEM_RESERVE,
                    Memory::PAGE_NOACCESS,
                );
                if probe.is_null() {
                    return None;
                }
                let aligned = ((probe as usize | (length - 1)) + 1) as *const c_void;
                Memory::VirtualFree(probe, 0, Memory::MEM_RELEASE);

                let address = Memory::VirtualAlloc(
                    Some(aligned),
                    length,
                    Memory::MEM_RESERVE | Memory::MEM_COMMIT,
                    Memory::PAGE_READWRITE,
                );
                if !address.is_null() {
                    return NonNull::new(address.cast());
                }
                // Lost the race for that address, try again.
            }

            None
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) {
            // Decommit and release in one go by specifying a length of 0 and
            // the MEM_RELEASE flag. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree
            let address = address.cast().as_ptr();
            let length = 0;
            let flags = Memory::MEM_RELEASE;

            if !Memory::VirtualFree(address, length, flags).as_bool() {
                // TODO: Release failed, don't know what to do here yet. Same
                // problem as munmap on Linux.
            }
        }

        unsafe fn return_aligned(address: NonNull<u8>, length: usize) {
            Self::return_memory(address, length);
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we'll use the global allocator to
    //! mock low level memory management. This is also useful for detecting
    //! memory leaks in our own allocator (regions that are not returned back
    //! to the kernel).

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(length: usize, align: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, align).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length, page_size())))
        }

        unsafe fn request_aligned(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length, length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length, page_size()));
        }

        unsafe fn return_aligned(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length, length));
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}
