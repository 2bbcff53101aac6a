use std::{fmt, str};

use libc::{c_int, c_void};

/// Write all of `bytes` to a raw file descriptor. Doesn't use the allocator,
/// doesn't take the `std::io` locks, so this is what we use once the heap is
/// known to be broken.
pub fn putbytes(fd: c_int, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a valid slice for reads of `bytes.len()` bytes.
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const c_void, bytes.len()) };
        if n <= 0 {
            // Nothing sensible to do about a broken stderr.
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// `putbytes()` to stderr
pub fn putstr(s: &str) {
    putbytes(libc::STDERR_FILENO, s.as_bytes());
}

/// A fixed-capacity line buffer implementing [`fmt::Write`]. Anything past
/// the capacity is dropped (and the line marked with a trailing `...`), so
/// formatting into it never fails and never allocates.
pub struct LineBuf<const N: usize = 512> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> LineBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Only whole chars are ever copied in, see `write_str()`.
        str::from_utf8(self.as_bytes()).unwrap_or("<invalid utf-8>")
    }

    /// Terminate the line with `\n`, replacing the tail with `...\n` if we
    /// ran out of space.
    pub fn finish_line(&mut self) {
        if self.truncated || self.len == N {
            let tail = b"...\n";
            let start = N.saturating_sub(tail.len()).min(self.len);
            let start = floor_char_boundary(&self.buf[..self.len], start);
            self.len = start;
            for &b in tail.iter().take(N - start) {
                self.buf[self.len] = b;
                self.len += 1;
            }
        } else {
            self.buf[self.len] = b'\n';
            self.len += 1;
        }
    }
}

impl<const N: usize> Default for LineBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for LineBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.truncated {
            return Ok(());
        }
        let room = N - self.len;
        let take = if s.len() <= room {
            s.len()
        } else {
            self.truncated = true;
            floor_char_boundary(s.as_bytes(), room)
        };
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Largest `i <= at` such that `bytes[..i]` ends on a char boundary.
fn floor_char_boundary(bytes: &[u8], at: usize) -> usize {
    let mut i = at.min(bytes.len());
    // Continuation bytes look like 0b10xxxxxx
    while i > 0 && i < bytes.len() && (bytes[i] & 0xC0) == 0x80 {
        i -= 1;
    }
    i
}
