/*
 * Kernel Error Codes
 *
 * POSIX-shaped error values used by every fallible operation in the
 * runtime core. Values match the classic errno numbers so the libc
 * shim can hand them to userspace unchanged.
 */

use core::fmt;

/// POSIX errno values
///
/// Covers resource exhaustion, permission/mount state, naming, connection
/// state, I/O and interruption. Network input-path problems are generally
/// NOT reported through these (bad packets are dropped and counted in
/// per-protocol statistics); filesystem and socket-API problems always are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    EPERM = 1,            // Operation not permitted
    ENOENT = 2,           // No such file or directory
    EINTR = 4,            // Interrupted system call
    EIO = 5,              // I/O error
    EBADF = 9,            // Bad file descriptor
    EWOULDBLOCK = 11,     // Operation would block
    ENOMEM = 12,          // Out of memory
    EACCES = 13,          // Permission denied
    EFAULT = 14,          // Bad address
    EBUSY = 16,           // Device or resource busy
    EEXIST = 17,          // File exists
    EXDEV = 18,           // Cross-device link
    ENODEV = 19,          // No such device
    ENOTDIR = 20,         // Not a directory
    EISDIR = 21,          // Is a directory
    EINVAL = 22,          // Invalid argument
    EMFILE = 24,          // Too many open files
    EFBIG = 27,           // File too large
    ENOSPC = 28,          // No space left on device
    ESPIPE = 29,          // Illegal seek
    EROFS = 30,           // Read-only file system
    EPIPE = 32,           // Broken pipe
    ENAMETOOLONG = 36,    // File name too long
    ENOTEMPTY = 39,       // Directory not empty
    ELOOP = 40,           // Too many symbolic links
    EOVERFLOW = 75,       // Value too large for data type
    EMSGSIZE = 90,        // Message too long
    EPROTONOSUPPORT = 93, // Protocol not supported
    EOPNOTSUPP = 95,      // Operation not supported
    EAFNOSUPPORT = 97,    // Address family not supported
    EADDRINUSE = 98,      // Address already in use
    EADDRNOTAVAIL = 99,   // Address not available
    ENETDOWN = 100,       // Network is down
    ENETUNREACH = 101,    // Network unreachable
    ECONNRESET = 104,     // Connection reset by peer
    EISCONN = 106,        // Socket already connected
    ENOTCONN = 107,       // Socket not connected
    ETIMEDOUT = 110,      // Connection timed out
    ECONNREFUSED = 111,   // Connection refused
    EALREADY = 114,       // Operation already in progress
    EINPROGRESS = 115,    // Operation now in progress
}

impl Errno {
    /// The raw errno number handed to the libc shim.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_posix() {
        assert_eq!(Errno::ENOENT.as_i32(), 2);
        assert_eq!(Errno::EWOULDBLOCK.as_i32(), 11);
        assert_eq!(Errno::EMSGSIZE.as_i32(), 90);
        assert_eq!(Errno::ETIMEDOUT.as_i32(), 110);
    }
}
