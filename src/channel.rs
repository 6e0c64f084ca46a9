//! Byte-stream transport used by both sides of a connection.
//!
//! A [`Channel`] is a pair of read and write halves plus a handle that can shut
//! the underlying transport down from another thread, which is how blocked
//! reads are interrupted (handshake timeout, hard export removal).
use std::io::{self, prelude::*};
use std::net::{self, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

/// Something that can be shut down to unblock pending reads and writes.
pub trait Shutdown: Send + Sync {
    fn shutdown(&self) -> io::Result<()>;
}

impl Shutdown for TcpStream {
    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, net::Shutdown::Both)
    }
}

impl Shutdown for UnixStream {
    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, net::Shutdown::Both)
    }
}

/// Cloneable handle shutting down a channel's transport.
///
/// Channels built from plain reader/writer halves have nothing to shut down,
/// and the handle does nothing.
#[derive(Clone, Default)]
pub struct ShutdownHandle(Option<Arc<dyn Shutdown>>);

impl ShutdownHandle {
    pub fn new<S: Shutdown + 'static>(s: S) -> Self {
        Self(Some(Arc::new(s)))
    }

    pub fn shutdown(&self) {
        if let Some(s) = &self.0 {
            if let Err(err) = s.shutdown() {
                debug!("transport shutdown: {err}");
            }
        }
    }
}

/// A bidirectional byte stream.
pub struct Channel {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    closer: ShutdownHandle,
}

impl Channel {
    /// Build a channel from separate halves (eg, a pair of pipes).
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::with_shutdown(reader, writer, ShutdownHandle::default())
    }

    /// Build a channel whose transport can be shut down through `closer`.
    ///
    /// TLS implementations use this to wrap an existing channel while keeping
    /// the original transport's shutdown handle.
    pub fn with_shutdown<R, W>(reader: R, writer: W, closer: ShutdownHandle) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            closer,
        }
    }

    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Self::with_shutdown(
            reader,
            writer,
            ShutdownHandle::new(stream),
        ))
    }

    pub fn unix(stream: UnixStream) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Self::with_shutdown(
            reader,
            writer,
            ShutdownHandle::new(stream),
        ))
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.closer.clone()
    }

    pub fn shutdown(&self) {
        self.closer.shutdown();
    }

    /// Separate the halves so reads and writes can happen on different threads.
    pub fn into_split(self) -> (Box<dyn Read + Send>, Box<dyn Write + Send>, ShutdownHandle) {
        (self.reader, self.writer, self.closer)
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Credentials for upgrading a channel to TLS after `NBD_OPT_STARTTLS`.
///
/// The handshake runs on the channel that carried the option negotiation so
/// far; the returned channel replaces it for the rest of the connection.
pub trait TlsCreds: Send + Sync {
    fn server_handshake(&self, channel: Channel) -> io::Result<Channel>;

    fn client_handshake(&self, channel: Channel, hostname: &str) -> io::Result<Channel>;
}

/// Bounds the negotiation phase: if not cancelled in time, shuts the transport
/// down so that any blocked read fails.
pub(crate) struct HandshakeTimer {
    cancel: Option<mpsc::Sender<()>>,
    expired: Arc<AtomicBool>,
}

impl HandshakeTimer {
    pub fn start(closer: ShutdownHandle, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let expired = Arc::new(AtomicBool::new(false));
        let flag = expired.clone();
        thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                warn!("handshake did not complete within {timeout:?}, closing connection");
                flag.store(true, Ordering::SeqCst);
                closer.shutdown();
            }
        });
        Self {
            cancel: Some(tx),
            expired,
        }
    }

    /// Whether the timer already fired.
    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Stop the timer; returns false if it had already fired.
    pub fn cancel(mut self) -> bool {
        // dropping the sender wakes the timer thread
        self.cancel.take();
        !self.expired()
    }
}
