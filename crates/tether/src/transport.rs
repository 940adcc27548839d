//! Byte-stream transport consumed by the connection engine.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// An ordered, reliable, bidirectional byte stream.
///
/// The connection engine drives a transport from two threads: the read
/// worker owns a [`Transport::try_clone`] handle, the write worker the
/// original. Implementations must allow a read and a write to proceed
/// concurrently on the two handles.
///
/// The WebSocket (or other) upgrade layer is outside this crate; anything
/// that preserves byte order and reliability can implement the trait.
pub trait Transport: Read + Write + Send {
    /// Duplicate the transport so reads and writes can run on separate
    /// threads.
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;

    /// Tear down both directions, unblocking a pending read on any clone.
    fn shutdown(&self);

    /// Remote endpoint description for logging.
    fn peer_addr(&self) -> String;
}

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(TcpStream::try_clone(self)?))
    }

    fn shutdown(&self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }

    fn peer_addr(&self) -> String {
        match TcpStream::peer_addr(self) {
            Ok(addr) => addr.to_string(),
            Err(_) => "unknown".to_string(),
        }
    }
}
