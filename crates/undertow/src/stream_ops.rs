use std::io;

/// Classified outcome of one non-blocking read or write attempt.
///
/// The contract is: one syscall, no internal retries, no blocking. Everything
/// that is not a byte count is a condition the caller pattern-matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoVerdict {
    /// Bytes were transferred.
    Transferred(usize),
    /// Nothing happened this time; re-arm readiness and try again later.
    Momentary,
    /// The kernel is out of buffer space. Keep the connection but back it off.
    Blocked,
    /// The peer closed the connection (or an equivalent errno).
    Closed,
    /// Unrecoverable socket error, carrying the errno.
    Fatal(i32),
}

impl IoVerdict {
    /// Bytes moved by this attempt; momentary stalls count as zero.
    pub fn bytes(&self) -> Option<usize> {
        match self {
            IoVerdict::Transferred(n) => Some(*n),
            IoVerdict::Momentary => Some(0),
            _ => None,
        }
    }
}

/// One attempt at moving bytes through a non-blocking stream.
///
/// Implemented for tokio's `TcpStream` via `try_read`/`try_write`, and by
/// scripted fakes in tests.
pub trait RawStream {
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_raw(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl RawStream for tokio::net::TcpStream {
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn write_raw(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }
}

pub fn read_classified(stream: &mut impl RawStream, buf: &mut [u8]) -> IoVerdict {
    classify(stream.read_raw(buf))
}

pub fn write_classified(stream: &mut impl RawStream, buf: &[u8]) -> IoVerdict {
    classify(stream.write_raw(buf))
}

/// Zero bytes with no error is a peer-initiated close.
pub fn classify(result: io::Result<usize>) -> IoVerdict {
    match result {
        Ok(0) => IoVerdict::Closed,
        Ok(n) => IoVerdict::Transferred(n),
        Err(e) => classify_error(&e),
    }
}

fn classify_error(e: &io::Error) -> IoVerdict {
    let Some(errno) = e.raw_os_error() else {
        // Synthetic errors (e.g. from wrappers) only carry an ErrorKind.
        return match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => IoVerdict::Momentary,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => IoVerdict::Closed,
            _ => IoVerdict::Fatal(libc::EIO),
        };
    };

    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR {
        IoVerdict::Momentary
    } else if errno == libc::ENOBUFS || errno == libc::ENOMEM {
        IoVerdict::Blocked
    } else if errno == libc::ECONNRESET
        || errno == libc::ECONNABORTED
        || errno == libc::EPIPE
        || errno == libc::ETIMEDOUT
    {
        IoVerdict::Closed
    } else {
        IoVerdict::Fatal(errno)
    }
}
