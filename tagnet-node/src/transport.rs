//! TCP transport: one frame out and one frame back per connection. A frame ends when the
//! writer shuts down its half of the stream.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tagnet_core::wire::MAX_FRAME_LEN;
use tagnet_core::PeerId;

/// Fixed read buffer; frames are read in chunks of this size until EOF.
const READ_BUFFER_SIZE: usize = 1024;

/// Read one frame: everything up to EOF, capped at the frame size limit.
pub fn read_frame(stream: &mut impl Read) -> io::Result<Vec<u8>> {
    read_frame_until(stream, |_| false)
}

/// Read one frame, stopping at EOF or as soon as `complete` accepts what has arrived.
/// `complete` is consulted after every chunk, so a writer that keeps its half open is
/// still answered.
pub fn read_frame_until(
    stream: &mut impl Read,
    complete: impl Fn(&[u8]) -> bool,
) -> io::Result<Vec<u8>> {
    let mut frame = Vec::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(frame),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if frame.len() + n > MAX_FRAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
        }
        frame.extend_from_slice(&buf[..n]);
        if complete(&frame) {
            return Ok(frame);
        }
    }
}

/// Write one frame and close the write half so the reader sees EOF.
pub fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> io::Result<()> {
    stream.write_all(frame)?;
    stream.flush()?;
    stream.shutdown(Shutdown::Write)
}

fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host}:{port} did not resolve"),
        ));
    }
    Ok(addrs)
}

/// Connect to `host:port`, trying each resolved address. With a timeout, the same limit
/// applies to connecting, reading and writing; without one, every step blocks.
pub fn connect(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let timeout = timeout.filter(|t| !t.is_zero());
    let mut last_err = None;
    for addr in resolve(host, port)? {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                stream.set_read_timeout(timeout)?;
                stream.set_write_timeout(timeout)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected)))
}

/// Send `frame` to a peer on a fresh connection and wait for its single response frame.
pub fn exchange(target: &PeerId, frame: &[u8], timeout: Option<Duration>) -> io::Result<Vec<u8>> {
    let mut stream = connect(&target.host, target.port, timeout)?;
    write_frame(&mut stream, frame)?;
    read_frame(&mut stream)
}

/// Liveness check: does anything accept connections on `host:port`?
pub fn ping(host: &str, port: u16, timeout: Duration) -> bool {
    connect(host, port, Some(timeout)).is_ok()
}
