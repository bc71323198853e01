use std::{mem, ptr::NonNull};

/// Record placed immediately below every pointer returned to a caller.
///
/// ```text
/// span start -> +------------------+  <--+
///               |  absorbed bytes  |     | `prefix` bytes. Alignment padding
///               |       ...        |     | too small to carve off as its own
///               +------------------+  <--+ free span. Often 0.
///     header -> |       span       |
///               |    requested     |
///               |      prefix      |
///               +------------------+
///  user ptr ->  |     payload      |
///               |       ...        |
///               +------------------+  <- span start + span
/// ```
///
/// `span` is the total number of bytes this allocation took out of the free
/// span it was carved from: absorbed prefix, header, payload and any tail
/// too small to split off. Together with `prefix` it lets deallocation
/// rebuild the original span with plain pointer arithmetic, no side table
/// needed. `requested` is what the caller actually asked for and only feeds
/// the usage statistics.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct AllocHeader {
    /// Total bytes consumed from the originating free span.
    pub span: usize,
    /// Payload bytes the caller requested.
    pub requested: usize,
    /// Bytes between the span start and this header.
    pub prefix: usize,
}

/// Allocation header size in bytes.
pub(crate) const ALLOC_HEADER_SIZE: usize = mem::size_of::<AllocHeader>();

impl AllocHeader {
    /// Returns the header that precedes `address`.
    ///
    /// # Safety
    ///
    /// `address` must be a pointer previously returned by the allocator and
    /// not yet freed, so that a live header sits right below it.
    #[inline]
    pub unsafe fn from_user_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the user pointer that sits right above `header`.
    ///
    /// # Safety
    ///
    /// `header` must point to a valid allocation header.
    #[inline]
    pub unsafe fn user_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }

    /// Recovers the start of the span this allocation was carved from.
    ///
    /// # Safety
    ///
    /// `header` must point to a valid allocation header.
    #[inline]
    pub unsafe fn span_start_of(header: NonNull<Self>) -> NonNull<u8> {
        let prefix = header.as_ref().prefix;
        NonNull::new_unchecked(header.as_ptr().cast::<u8>().sub(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_address_round_trip() {
        #[repr(align(8))]
        struct Buffer([u8; 128]);

        let mut buffer = Buffer([0; 128]);

        unsafe {
            let header = NonNull::new(buffer.0.as_mut_ptr().add(16))
                .unwrap()
                .cast::<AllocHeader>();

            header.as_ptr().write(AllocHeader {
                span: 64,
                requested: 13,
                prefix: 16,
            });

            let user = AllocHeader::user_address_of(header);
            assert_eq!(
                user.as_ptr() as usize - header.as_ptr() as usize,
                ALLOC_HEADER_SIZE
            );

            let recovered = AllocHeader::from_user_address(user);
            assert_eq!(recovered, header);

            // The prefix pushes the span start back to the buffer base.
            let start = AllocHeader::span_start_of(header);
            assert_eq!(start.as_ptr(), buffer.0.as_mut_ptr());
        }
    }
}
