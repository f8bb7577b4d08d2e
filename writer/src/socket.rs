use std::{
    io::{self, IoSlice},
    net::SocketAddr,
};

/// Non-blocking transport written by [crate::AsyncQueueWriter].
///
/// Implementations wrap a socket registered with an event loop. Writes must
/// never block: when the socket cannot accept more data, `write_vectored`
/// returns `Ok(0)` or an error of kind [io::ErrorKind::WouldBlock].
pub trait Socket: Send + Sync + 'static {
    /// Write as much of `bufs` as the socket accepts right now.
    ///
    /// `destination` is set for datagram sockets.
    fn write_vectored(
        &self,
        destination: Option<SocketAddr>,
        bufs: &[IoSlice<'_>],
    ) -> io::Result<usize>;

    /// Ask the event loop to call [crate::AsyncQueueWriter::on_ready] once the
    /// socket is writable.
    fn request_writable(&self) -> io::Result<()>;

    /// Size of the kernel send buffer, if known.
    fn send_buffer_size(&self) -> Option<usize> {
        None
    }

    /// Stop using the socket. Called once when the connection closes.
    fn shutdown(&self) {}
}
