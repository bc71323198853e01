use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction over the OS virtual memory primitives. The allocator only
/// ever maps anonymous read-write pages and unmaps them again; everything
/// else about the underlying kernel API is hidden behind this trait.
trait VirtualMemory {
    /// Maps `length` bytes of zero-filled, page aligned, private anonymous
    /// memory. Returns `None` on failure.
    unsafe fn map(length: usize) -> Pointer<u8>;

    /// Unmaps `length` bytes starting at `address`. Returns whether the
    /// kernel accepted the call; the mapping is still valid when it didn't.
    unsafe fn unmap(address: NonNull<u8>, length: usize) -> bool;

    /// Virtual memory page size in bytes.
    fn page_size() -> usize;
}

/// Zero sized type that implements [`VirtualMemory`] for each OS.
struct Platform;

/// Wrapper for [`VirtualMemory::map`] on the current platform.
#[inline]
pub(crate) unsafe fn map(length: usize) -> Pointer<u8> {
    Platform::map(length)
}

/// Wrapper for [`VirtualMemory::unmap`] on the current platform.
#[inline]
pub(crate) unsafe fn unmap(address: NonNull<u8>, length: usize) -> bool {
    Platform::unmap(address, length)
}

/// Wrapper for [`VirtualMemory::page_size`] on the current platform.
#[inline]
pub(crate) fn page_size() -> usize {
    Platform::page_size()
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Platform, VirtualMemory};
    use crate::Pointer;

    impl VirtualMemory for Platform {
        unsafe fn map(length: usize) -> Pointer<u8> {
            // Read-write pages, private to this process and not backed by
            // any file. The kernel hands them back zero-filled. See
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => Some(NonNull::new_unchecked(address).cast()),
            }
        }

        unsafe fn unmap(address: NonNull<u8>, length: usize) -> bool {
            libc::munmap(address.cast().as_ptr(), length) == 0
        }

        fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, VirtualMemory};
    use crate::Pointer;

    impl VirtualMemory for Platform {
        unsafe fn map(length: usize) -> Pointer<u8> {
            // Unlike mmap, memory has to be reserved and then committed to
            // become usable; both can happen in a single call. Committed
            // pages are zero-filled. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc
            let protection = Memory::PAGE_READWRITE;
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn unmap(address: NonNull<u8>, _length: usize) -> bool {
            // MEM_RELEASE requires a length of 0 and frees the entire
            // reservation made by VirtualAlloc.
            Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE).is_ok()
        }

        fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            unsafe {
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());
                system_info.assume_init().dwPageSize as usize
            }
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI support, so real system calls are off the table.
    //! The global allocator stands in for the kernel instead, which also
    //! lets Miri flag regions we forget to return.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, VirtualMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, Platform::page_size()).unwrap()
    }

    impl VirtualMemory for Platform {
        unsafe fn map(length: usize) -> Pointer<u8> {
            // Mapped pages are promised to be zero-filled.
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn unmap(address: NonNull<u8>, length: usize) -> bool {
            alloc::dealloc(address.as_ptr(), to_layout(length));
            true
        }

        fn page_size() -> usize {
            4096
        }
    }
}
