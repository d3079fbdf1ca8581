//! Length-prefixed frame transport over TCP.
//!
//! Each frame is its protobuf encoding preceded by a big-endian `u32`
//! length. The client side is blocking and single-threaded; the server side
//! runs one reader thread and one writer thread per connection, the writer
//! draining the connection's notification channel.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use frames::{Frame, Status, decode_frame, encode_frame};
use tokio::sync::mpsc::unbounded_channel;

use crate::error::{SmError, SmResult};
use crate::server::{SharedServer, lock};
use crate::session::Transport;

/// Refuse frames larger than this many bytes.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Write one length-prefixed frame.
///
/// # Errors
///
/// Propagates socket errors.
pub fn write_frame(stream: &mut impl Write, frame: &Frame) -> SmResult<()> {
    let bytes = encode_frame(frame);
    let len = u32::try_from(bytes.len()).map_err(|_| SmError::Io(io::Error::other("frame too large")))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// # Errors
///
/// Returns [`SmError::TransportClosed`] on a clean EOF before the length
/// prefix, and I/O or codec errors otherwise.
pub fn read_frame(stream: &mut impl Read) -> SmResult<Frame> {
    let mut prefix = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut prefix) {
        return Err(if e.kind() == io::ErrorKind::UnexpectedEof { SmError::TransportClosed } else { e.into() });
    }
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(SmError::Io(io::Error::new(io::ErrorKind::InvalidData, format!("frame of {len} bytes"))));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    Ok(decode_frame(&body)?)
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct TcpTransport {
    stream: RefCell<TcpStream>,
    pending: RefCell<VecDeque<Frame>>,
    uri: String,
}

impl TcpTransport {
    /// Connect out to a listening server.
    ///
    /// # Errors
    ///
    /// Propagates connection errors.
    pub fn connect(host: &str, port: u16) -> SmResult<Self> {
        let stream = TcpStream::connect((host, port))?;
        tracing::info!(host, port, "session: tcp connected");
        Ok(Self::from_stream(stream, format!("cs://{host}:{port}")))
    }

    pub fn from_stream(stream: TcpStream, uri: String) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "session: could not disable nagle");
        }
        Self { stream: RefCell::new(stream), pending: RefCell::new(VecDeque::new()), uri }
    }

    fn read_available(&self) -> SmResult<()> {
        let mut stream = self.stream.borrow_mut();
        loop {
            stream.set_nonblocking(true)?;
            let mut probe = [0u8; 1];
            let ready = match stream.peek(&mut probe) {
                Ok(0) => false,
                Ok(_) => true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
                Err(e) => {
                    stream.set_nonblocking(false)?;
                    return Err(e.into());
                }
            };
            stream.set_nonblocking(false)?;
            if !ready {
                return Ok(());
            }
            let frame = read_frame(&mut *stream)?;
            self.pending.borrow_mut().push_back(frame);
        }
    }
}

impl Transport for TcpTransport {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn request(&self, frame: Frame) -> SmResult<Frame> {
        let id = frame.id.clone();
        let mut stream = self.stream.borrow_mut();
        write_frame(&mut *stream, &frame)?;
        loop {
            let incoming = read_frame(&mut *stream)?;
            if incoming.status == Status::Notify {
                self.pending.borrow_mut().push_back(incoming);
                continue;
            }
            if incoming.parent_id.as_deref() == Some(id.as_str()) && incoming.status.is_terminal() {
                return Ok(incoming);
            }
            tracing::debug!(syscall = %incoming.syscall, "session: dropping unmatched reply");
        }
    }

    fn drain_notifications(&self) -> Vec<Frame> {
        if let Err(e) = self.read_available() {
            tracing::warn!(error = %e, "session: error while polling notifications");
        }
        self.pending.borrow_mut().drain(..).collect()
    }

    fn close(&self) {
        if let Err(e) = self.stream.borrow().shutdown(std::net::Shutdown::Both) {
            tracing::debug!(error = %e, "session: shutdown on closed socket");
        }
    }
}

/// Wait on `listener` for a server to connect back, polling `keep_waiting`
/// every `poll`. Returns `None` once the callback gives up.
///
/// # Errors
///
/// Propagates accept errors other than "would block".
pub fn reverse_connect_with_listener(
    listener: &TcpListener,
    poll: Duration,
    mut keep_waiting: impl FnMut() -> bool,
) -> SmResult<Option<TcpTransport>> {
    listener.set_nonblocking(true)?;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                tracing::info!(%peer, "session: server connected back");
                let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
                return Ok(Some(TcpTransport::from_stream(stream, format!("csrc://{port}"))));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !keep_waiting() {
                    tracing::info!("session: reverse connection aborted");
                    return Ok(None);
                }
                thread::sleep(poll);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// Accept connections forever, one handler thread per client.
///
/// # Errors
///
/// Returns only if the listener itself fails.
pub fn serve(listener: &TcpListener, server: &SharedServer) -> SmResult<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "server: listening");
    for stream in listener.incoming() {
        let stream = stream?;
        let server = SharedServer::clone(server);
        thread::spawn(move || {
            if let Err(e) = handle_connection(stream, &server) {
                tracing::warn!(error = %e, "server: connection ended with error");
            }
        });
    }
    Ok(())
}

/// Connect out to a client waiting for a reverse connection and serve it.
///
/// # Errors
///
/// Propagates the connection error.
pub fn connect_back(addr: impl ToSocketAddrs, server: &SharedServer) -> SmResult<JoinHandle<()>> {
    let stream = TcpStream::connect(addr)?;
    let server = SharedServer::clone(server);
    Ok(thread::spawn(move || {
        if let Err(e) = handle_connection(stream, &server) {
            tracing::warn!(error = %e, "server: reverse connection ended with error");
        }
    }))
}

/// Serve one client until it disconnects.
///
/// # Errors
///
/// Propagates I/O and codec errors other than a clean close.
pub fn handle_connection(stream: TcpStream, server: &SharedServer) -> SmResult<()> {
    let peer: Option<SocketAddr> = stream.peer_addr().ok();
    let mut reader = stream.try_clone()?;
    let mut writer_stream = stream;

    let (tx, mut rx) = unbounded_channel::<Frame>();
    let client = lock(server).attach_client(tx.clone());
    tracing::info!(client, ?peer, "server: tcp client connected");

    let writer = thread::spawn(move || {
        while let Some(frame) = rx.blocking_recv() {
            if let Err(e) = write_frame(&mut writer_stream, &frame) {
                tracing::debug!(client, error = %e, "server: write failed");
                break;
            }
        }
        if let Err(e) = writer_stream.shutdown(std::net::Shutdown::Write) {
            tracing::debug!(client, error = %e, "server: shutdown failed");
        }
    });

    let result = loop {
        let frame = match read_frame(&mut reader) {
            Ok(frame) => frame,
            Err(SmError::TransportClosed) => break Ok(()),
            Err(e) => break Err(e),
        };
        let reply = lock(server).handle(client, frame);
        if tx.send(reply).is_err() {
            break Ok(());
        }
    };

    lock(server).detach_client(client);
    drop(tx);
    if writer.join().is_err() {
        tracing::error!(client, "server: writer thread panicked");
    }
    tracing::info!(client, "server: tcp client disconnected");
    result
}

#[cfg(test)]
#[path = "tcp_test.rs"]
mod tests;
