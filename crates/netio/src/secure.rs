//! Seam for layering an encrypted channel over an established stream.

use std::io;

use mio::net::TcpStream;

/// Transforms bytes on their way through an established connection.
///
/// Attached with [`crate::SocketCore::set_secure_channel`] once a stream is
/// ready; from then on every read and write is routed through the channel.
/// Implementations run under the socket lock and must stay non-blocking:
/// propagate [`io::ErrorKind::WouldBlock`] from the transport instead of
/// spinning, and buffer partial records internally.
pub trait SecureChannel: Send {
    /// Reads and decrypts into `buf`, returning the plaintext length.
    /// `Ok(0)` means the peer finished sending.
    fn read(&mut self, transport: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize>;

    /// Encrypts and writes from `buf`, returning how many plaintext bytes
    /// were accepted.
    fn write(&mut self, transport: &mut TcpStream, buf: &[u8]) -> io::Result<usize>;
}
