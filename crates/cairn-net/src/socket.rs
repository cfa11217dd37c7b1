//! Blocking framed transport over TCP.
//!
//! [`FramedSocket`] wraps one `TcpStream` and speaks the frame format from
//! [`crate::frame`]. Reads resynchronize on magic: after garbage or a torn
//! frame, the reader scans forward byte-by-byte to the next valid magic
//! instead of abandoning the rest of a well-formed stream, giving up with
//! [`CairnError::FrameDesync`] only past a fixed scan limit. A graceful peer
//! close surfaces as [`ReadResult::Closed`], which callers treat very
//! differently from [`ReadResult::TimedOut`] — the first means discard and
//! reconnect, the second means try again.
//!
//! Compression is negotiated per-frame by magic, never by guessing; it is
//! unconditionally disabled toward loopback peers (pure overhead there).

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::AsFd;
use std::time::Duration;

use cairn_error::{CairnError, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, warn};

use crate::bytestream::ByteStream;
use crate::frame::{self, COMPRESSED_MAGIC, MAX_PAYLOAD_BYTES, PLAIN_MAGIC};

/// Synchronization byte sent by the server after accept in synchronous
/// protocol mode, closing the connect-returns-before-server-ready race.
const SYNC_BYTE: u8 = 0x01;

/// Maximum garbage scanned while resynchronizing on magic. A stream that
/// produces this much without a frame header is not speaking the protocol.
const RESYNC_SCAN_LIMIT: usize = 64 * 1024;

/// Transport configuration shared by client and server sides.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Whether compression may be used on non-loopback connections.
    pub compress: bool,
    /// Whether accept/connect exchange the synchronization byte.
    pub sync_protocol: bool,
    /// Timeout applied to `connect` and to the sync-byte wait.
    pub connect_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            compress: true,
            sync_protocol: false,
            connect_timeout: Duration::from_secs(20),
        }
    }
}

/// Outcome of a framed read.
#[derive(Debug)]
pub enum ReadResult {
    /// A complete message (possibly zero-length).
    Message(ByteStream),
    /// The timeout elapsed with no frame started. Try again.
    TimedOut,
    /// The peer closed the stream. Discard this socket.
    Closed,
}

/// Outcome of a readiness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Nothing yet.
    Timeout,
    /// At least one byte is readable.
    DataReady,
    /// The peer has closed.
    Closed,
    /// The descriptor is in an error state.
    Error,
}

/// Result of the non-blocking liveness probe used by the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Connected with no pending bytes: safe to reuse.
    Idle,
    /// Connected but bytes are waiting that no request asked for: the
    /// protocol state is desynchronized, do not reuse.
    PendingData,
    /// Disconnected or in an error state.
    Dead,
}

/// One framed, optionally compressing TCP connection.
#[derive(Debug)]
pub struct FramedSocket {
    stream: TcpStream,
    compress: bool,
}

impl FramedSocket {
    /// Connect to `addr` and complete the optional sync handshake.
    ///
    /// # Errors
    /// `EndpointUnreachable` if no address resolves or connects; `Io` for
    /// handshake failures.
    pub fn connect(addr: &str, opts: TransportOptions) -> Result<Self> {
        let mut last_err: Option<std::io::Error> = None;
        let resolved = addr
            .to_socket_addrs()
            .map_err(|_| CairnError::EndpointUnreachable {
                endpoint: addr.to_owned(),
            })?;
        for candidate in resolved {
            match TcpStream::connect_timeout(&candidate, opts.connect_timeout) {
                Ok(stream) => {
                    let mut sock = Self::from_stream(stream, opts)?;
                    if opts.sync_protocol {
                        sock.await_sync_byte(opts.connect_timeout)?;
                    }
                    debug!(addr, "connected");
                    return Ok(sock);
                }
                Err(e) => last_err = Some(e),
            }
        }
        warn!(addr, err = ?last_err, "connect failed");
        Err(CairnError::EndpointUnreachable {
            endpoint: addr.to_owned(),
        })
    }

    /// Wrap an accepted or connected stream.
    ///
    /// # Errors
    /// `Io` if socket options cannot be applied.
    pub fn from_stream(stream: TcpStream, opts: TransportOptions) -> Result<Self> {
        stream.set_nodelay(true)?;
        let loopback = is_loopback(&stream);
        Ok(Self {
            stream,
            compress: opts.compress && !loopback,
        })
    }

    /// Whether outbound frames may be compressed on this connection.
    #[must_use]
    pub fn compression_enabled(&self) -> bool {
        self.compress
    }

    /// Local address.
    ///
    /// # Errors
    /// `Io` from the OS.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Peer address.
    ///
    /// # Errors
    /// `Io` from the OS.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Frame and send one message.
    ///
    /// # Errors
    /// `PayloadTooLarge`, or `Io` on transport failure (the caller closes
    /// and optionally reconnects).
    pub fn write(&mut self, msg: &ByteStream) -> Result<()> {
        let frame = frame::encode(msg.unread(), self.compress)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }

    /// Read one framed message.
    ///
    /// `timeout == None` blocks indefinitely. A timeout before a frame has
    /// started is `TimedOut`; peer close anywhere is `Closed`. A timeout
    /// mid-frame is an `Io` error (the stream is torn and the caller must
    /// discard it).
    ///
    /// # Errors
    /// `Io` on transport failure mid-frame, `PayloadTooLarge` on an absurd
    /// header, `CompressionFailure` on corrupt compressed payload,
    /// `FrameDesync` if no magic appears within the resync scan limit.
    pub fn read(&mut self, timeout: Option<Duration>) -> Result<ReadResult> {
        self.stream.set_read_timeout(timeout)?;

        let magic = match self.read_magic()? {
            MagicScan::Found(m) => m,
            MagicScan::TimedOut => return Ok(ReadResult::TimedOut),
            MagicScan::Eof => return Ok(ReadResult::Closed),
        };

        let wire_len = match self.read_exact_u32()? {
            Some(v) => v as usize,
            None => return Ok(ReadResult::Closed),
        };
        if wire_len > MAX_PAYLOAD_BYTES {
            return Err(CairnError::PayloadTooLarge {
                len: wire_len,
                max: MAX_PAYLOAD_BYTES,
            });
        }
        let original_len = if magic == COMPRESSED_MAGIC {
            match self.read_exact_u32()? {
                Some(v) => Some(v),
                None => return Ok(ReadResult::Closed),
            }
        } else {
            None
        };

        let mut payload = vec![0u8; wire_len];
        if !self.fill(&mut payload)? {
            return Ok(ReadResult::Closed);
        }

        let body = match original_len {
            Some(original) => frame::decompress(&payload, original)?,
            None => payload,
        };
        Ok(ReadResult::Message(ByteStream::from_vec(body)))
    }

    /// `poll(2)`-based readiness check, distinguishing "nothing yet" from
    /// "dead".
    #[must_use]
    pub fn poll(&self, timeout: Duration) -> PollStatus {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let poll_timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
        let mut fds = [PollFd::new(self.stream.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout) {
            Ok(0) => PollStatus::Timeout,
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    PollStatus::Error
                } else if revents.contains(PollFlags::POLLIN) {
                    // POLLIN covers both data and EOF; peek disambiguates.
                    match self.stream.peek(&mut [0u8; 1]) {
                        Ok(0) => PollStatus::Closed,
                        Ok(_) => PollStatus::DataReady,
                        Err(_) => PollStatus::Error,
                    }
                } else if revents.contains(PollFlags::POLLHUP) {
                    PollStatus::Closed
                } else {
                    PollStatus::Timeout
                }
            }
            Err(_) => PollStatus::Error,
        }
    }

    /// Non-blocking liveness probe for pool health checks.
    #[must_use]
    pub fn probe(&self) -> Liveness {
        if self.stream.set_nonblocking(true).is_err() {
            return Liveness::Dead;
        }
        let result = match self.stream.peek(&mut [0u8; 1]) {
            Ok(0) => Liveness::Dead,
            Ok(_) => Liveness::PendingData,
            Err(e) if e.kind() == ErrorKind::WouldBlock => Liveness::Idle,
            Err(_) => Liveness::Dead,
        };
        if self.stream.set_nonblocking(false).is_err() {
            return Liveness::Dead;
        }
        result
    }

    /// Shut down both directions; subsequent reads on the peer see EOF.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Scan the stream for the next frame magic, tolerating up to
    /// [`RESYNC_SCAN_LIMIT`] bytes of garbage.
    fn read_magic(&mut self) -> Result<MagicScan> {
        let mut window = [0u8; 4];
        match self.fill_start(&mut window)? {
            FillStart::Full => {}
            FillStart::TimedOut => return Ok(MagicScan::TimedOut),
            FillStart::Eof => return Ok(MagicScan::Eof),
        }

        let mut skipped = 0usize;
        loop {
            let magic = u32::from_le_bytes(window);
            if frame::is_magic(magic) {
                if skipped > 0 {
                    warn!(skipped, "frame desync: resynchronized on magic");
                }
                return Ok(MagicScan::Found(magic));
            }
            if skipped >= RESYNC_SCAN_LIMIT {
                return Err(CairnError::FrameDesync { skipped });
            }
            // Slide the window one byte forward.
            let mut next = [0u8; 1];
            match self.stream.read(&mut next) {
                Ok(0) => return Ok(MagicScan::Eof),
                Ok(_) => {
                    window.copy_within(1.., 0);
                    window[3] = next[0];
                    skipped += 1;
                }
                Err(e) if is_timeout(&e) => return Err(e.into()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read exactly four bytes as a LE u32; `None` on EOF.
    fn read_exact_u32(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        if self.fill(&mut buf)? {
            Ok(Some(u32::from_le_bytes(buf)))
        } else {
            Ok(None)
        }
    }

    /// Fill `buf` completely. `Ok(false)` on EOF; timeouts mid-frame are
    /// `Io` errors.
    fn fill(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Ok(false),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Fill `buf`, treating a timeout before the first byte as a clean
    /// "no message available".
    fn fill_start(&mut self, buf: &mut [u8]) -> Result<FillStart> {
        let mut filled = 0usize;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Ok(FillStart::Eof),
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) && filled == 0 => return Ok(FillStart::TimedOut),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(FillStart::Full)
    }

    fn await_sync_byte(&mut self, timeout: Duration) -> Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte)?;
        if byte[0] != SYNC_BYTE {
            return Err(CairnError::internal(format!(
                "bad sync byte {:#04x}",
                byte[0]
            )));
        }
        Ok(())
    }
}

enum MagicScan {
    Found(u32),
    TimedOut,
    Eof,
}

enum FillStart {
    Full,
    TimedOut,
    Eof,
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn is_loopback(stream: &TcpStream) -> bool {
    match (stream.peer_addr(), stream.local_addr()) {
        (Ok(peer), Ok(local)) => peer.ip().is_loopback() || peer.ip() == local.ip(),
        _ => false,
    }
}

/// Listening side of the framed transport.
#[derive(Debug)]
pub struct FramedListener {
    listener: TcpListener,
    opts: TransportOptions,
}

impl FramedListener {
    /// Bind and listen.
    ///
    /// # Errors
    /// `Io` from the OS.
    pub fn bind(addr: &str, opts: TransportOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        debug!(addr, "listening");
        Ok(Self { listener, opts })
    }

    /// The bound address (useful with port 0 in tests).
    ///
    /// # Errors
    /// `Io` from the OS.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection, waiting at most `timeout` (or forever if
    /// `None`). `Ok(None)` means the timeout elapsed.
    ///
    /// In synchronous-protocol mode the sync byte is written to the peer
    /// immediately after accept, before this returns.
    ///
    /// # Errors
    /// `Io` from accept or the handshake write.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Option<FramedSocket>> {
        if let Some(timeout) = timeout {
            let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
            let poll_timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);
            let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, poll_timeout) {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }
        let (stream, peer) = self.listener.accept()?;
        debug!(%peer, "accepted");
        let mut sock = FramedSocket::from_stream(stream, self.opts)?;
        if self.opts.sync_protocol {
            sock.stream.write_all(&[SYNC_BYTE])?;
        }
        Ok(Some(sock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pair(opts: TransportOptions) -> (FramedSocket, FramedSocket) {
        let listener = FramedListener::bind("127.0.0.1:0", opts).unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let client = thread::spawn(move || FramedSocket::connect(&addr, opts).unwrap());
        let server = listener.accept(Some(Duration::from_secs(5))).unwrap().unwrap();
        (client.join().unwrap(), server)
    }

    fn msg(bytes: &[u8]) -> ByteStream {
        let mut bs = ByteStream::new();
        bs.put_raw(bytes);
        bs
    }

    #[test]
    fn frame_round_trip_across_compression_boundary() {
        let (mut client, mut server) = pair(TransportOptions::default());
        // Loopback: compression is disabled on both ends regardless of the
        // size, but every boundary size must still round-trip exactly.
        for size in [0usize, 1, 511, 512, 513, 1_000_000] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            client.write(&msg(&payload)).unwrap();
            match server.read(Some(Duration::from_secs(5))).unwrap() {
                ReadResult::Message(got) => assert_eq!(got.unread(), &payload[..], "size {size}"),
                other => panic!("expected message for size {size}, got {other:?}"),
            }
        }
    }

    #[test]
    fn loopback_disables_compression() {
        let (client, _server) = pair(TransportOptions::default());
        assert!(!client.compression_enabled());
    }

    #[test]
    fn timeout_is_distinct_from_close() {
        let (client, mut server) = pair(TransportOptions::default());
        match server.read(Some(Duration::from_millis(50))).unwrap() {
            ReadResult::TimedOut => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        client.shutdown();
        match server.read(Some(Duration::from_secs(5))).unwrap() {
            ReadResult::Closed => {}
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[test]
    fn reader_resynchronizes_after_garbage() {
        let (mut client, mut server) = pair(TransportOptions::default());
        // Inject garbage, then a well-formed frame; the reader must skip to
        // the magic and deliver the frame intact.
        client.stream.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x00]).unwrap();
        client.write(&msg(b"still here")).unwrap();
        match server.read(Some(Duration::from_secs(5))).unwrap() {
            ReadResult::Message(got) => assert_eq!(got.unread(), b"still here"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn garbage_flood_without_magic_is_frame_desync() {
        let (mut client, mut server) = pair(TransportOptions::default());
        // Zero bytes can never form a magic, so the scan runs to its limit.
        let garbage = vec![0u8; RESYNC_SCAN_LIMIT + 64];
        let writer = thread::spawn(move || {
            client.stream.write_all(&garbage).unwrap();
            client
        });
        let err = server.read(Some(Duration::from_secs(5))).unwrap_err();
        assert!(matches!(err, CairnError::FrameDesync { skipped } if skipped >= RESYNC_SCAN_LIMIT));
        drop(writer.join().unwrap());
    }

    #[test]
    fn poll_distinguishes_states() {
        let (mut client, server) = pair(TransportOptions::default());
        assert_eq!(server.poll(Duration::from_millis(20)), PollStatus::Timeout);

        client.write(&msg(b"x")).unwrap();
        assert_eq!(server.poll(Duration::from_secs(5)), PollStatus::DataReady);

        let mut server = server;
        server.read(Some(Duration::from_secs(5))).unwrap();
        client.shutdown();
        assert_eq!(server.poll(Duration::from_secs(5)), PollStatus::Closed);
    }

    #[test]
    fn probe_reports_liveness() {
        let (mut client, server) = pair(TransportOptions::default());
        assert_eq!(server.probe(), Liveness::Idle);

        client.write(&msg(b"unrequested")).unwrap();
        // Give the kernel a moment to deliver.
        assert_eq!(server.poll(Duration::from_secs(5)), PollStatus::DataReady);
        assert_eq!(server.probe(), Liveness::PendingData);

        let mut server = server;
        server.read(Some(Duration::from_secs(5))).unwrap();
        client.shutdown();
        assert_eq!(server.poll(Duration::from_secs(5)), PollStatus::Closed);
        assert_eq!(server.probe(), Liveness::Dead);
    }

    #[test]
    fn sync_protocol_handshake() {
        let opts = TransportOptions {
            sync_protocol: true,
            ..Default::default()
        };
        let (mut client, mut server) = pair(opts);
        client.write(&msg(b"after handshake")).unwrap();
        match server.read(Some(Duration::from_secs(5))).unwrap() {
            ReadResult::Message(got) => assert_eq!(got.unread(), b"after handshake"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn accept_timeout_returns_none() {
        let listener = FramedListener::bind("127.0.0.1:0", TransportOptions::default()).unwrap();
        let accepted = listener.accept(Some(Duration::from_millis(50))).unwrap();
        assert!(accepted.is_none());
    }

    #[test]
    fn zero_length_message_is_a_message() {
        let (mut client, mut server) = pair(TransportOptions::default());
        client.write(&ByteStream::new()).unwrap();
        match server.read(Some(Duration::from_secs(5))).unwrap() {
            ReadResult::Message(got) => assert!(got.is_empty()),
            other => panic!("expected empty message, got {other:?}"),
        }
    }
}
