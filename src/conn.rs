//! Per-connection bookkeeping: in-flight accounting, quiescing and
//! reference-counted teardown.
//!
//! The control thread reading requests owns teardown. Worker threads keep the
//! connection alive through [`ConnRef`] guards; when the last guard goes away
//! the control thread is told over a channel, and only then detaches from the
//! export and closes the transport.
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::channel::ShutdownHandle;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Messages delivered to the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnEvent {
    /// The reference count dropped to zero.
    Released,
}

#[derive(Debug, Default)]
struct ConnState {
    in_flight: usize,
    // nesting count, so overlapping drains compose
    quiescing: usize,
    closing: bool,
}

pub(crate) struct ConnShared {
    id: u64,
    max_in_flight: usize,
    state: Mutex<ConnState>,
    cond: Condvar,
    refs: AtomicUsize,
    events: Mutex<Sender<ConnEvent>>,
    closer: ShutdownHandle,
}

impl ConnShared {
    /// Create the shared state plus the control thread's end of the event
    /// channel. The count starts at zero; take a [`ConnRef`] before handing
    /// the connection to anyone.
    pub fn new(closer: ShutdownHandle, max_in_flight: usize) -> (Arc<Self>, Receiver<ConnEvent>) {
        let (tx, rx) = mpsc::channel();
        let conn = Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            max_in_flight: max_in_flight.max(1),
            state: Mutex::new(ConnState::default()),
            cond: Condvar::new(),
            refs: AtomicUsize::new(0),
            events: Mutex::new(tx),
            closer,
        });
        (conn, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn acquire(self: &Arc<Self>) -> ConnRef {
        self.refs.fetch_add(1, Ordering::SeqCst);
        ConnRef(self.clone())
    }

    fn release(&self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("connection {}: last reference released", self.id);
            // the control thread may already be gone after a fatal error
            let _ = self.events.lock().unwrap().send(ConnEvent::Released);
        }
    }

    /// Block until another request may be read: below the in-flight limit
    /// and not quiesced. Returns false once the connection is closing.
    ///
    /// A read that was already waiting on the transport when a drain started
    /// is not interrupted; its request is held in [`Self::begin_request`]
    /// instead, and the next read starts after resume.
    pub fn wait_capacity(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while !state.closing && (state.quiescing > 0 || state.in_flight >= self.max_in_flight) {
            state = self.cond.wait(state).unwrap();
        }
        !state.closing
    }

    /// Account for a request about to execute, holding it while the
    /// connection is quiesced. Returns false once the connection is closing;
    /// the request must then be dropped without a reply.
    pub fn begin_request(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        while !state.closing && state.quiescing > 0 {
            state = self.cond.wait(state).unwrap();
        }
        if state.closing {
            return false;
        }
        state.in_flight += 1;
        true
    }

    pub fn end_request(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        self.cond.notify_all();
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }

    /// Stop starting new requests and wait for the running ones to finish.
    /// An idle connection, including one blocked reading its next request,
    /// is drained immediately.
    pub fn quiesce(&self) {
        let mut state = self.state.lock().unwrap();
        state.quiescing += 1;
        debug!("connection {}: quiescing", self.id);
        while state.in_flight > 0 && !state.closing {
            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        state.quiescing = state.quiescing.saturating_sub(1);
        if state.quiescing == 0 {
            debug!("connection {}: resuming", self.id);
        }
        self.cond.notify_all();
    }

    pub fn is_closing(&self) -> bool {
        self.state.lock().unwrap().closing
    }

    /// Mark the connection closing without touching the transport.
    pub fn mark_closing(&self) {
        let mut state = self.state.lock().unwrap();
        state.closing = true;
        self.cond.notify_all();
    }

    /// Mark the connection closing and shut the transport down, which fails
    /// the control thread's pending read.
    pub fn close(&self) {
        self.mark_closing();
        self.closer.shutdown();
    }

    pub fn closer(&self) -> &ShutdownHandle {
        &self.closer
    }
}

/// Keeps a connection alive; see the module docs.
pub(crate) struct ConnRef(Arc<ConnShared>);

impl ConnRef {
    pub fn conn(&self) -> &Arc<ConnShared> {
        &self.0
    }
}

impl Clone for ConnRef {
    fn clone(&self) -> Self {
        self.0.acquire()
    }
}

impl Drop for ConnRef {
    fn drop(&mut self) {
        self.0.release();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn in_flight_is_bounded() {
        let (conn, _rx) = ConnShared::new(ShutdownHandle::default(), 2);
        assert!(conn.wait_capacity());
        assert!(conn.begin_request());
        assert!(conn.begin_request());
        let waiter = {
            let conn = conn.clone();
            thread::spawn(move || conn.wait_capacity())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        conn.end_request();
        assert!(waiter.join().unwrap());
        assert_eq!(conn.in_flight(), 1);
    }

    #[test]
    fn quiesce_waits_for_running_requests() {
        let (conn, _rx) = ConnShared::new(ShutdownHandle::default(), 16);
        assert!(conn.begin_request());
        let drain = {
            let conn = conn.clone();
            thread::spawn(move || conn.quiesce())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!drain.is_finished());
        conn.end_request();
        drain.join().unwrap();

        // new requests are held until resume
        let next = {
            let conn = conn.clone();
            thread::spawn(move || conn.begin_request())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!next.is_finished());
        conn.resume();
        assert!(next.join().unwrap());
    }

    #[test]
    fn quiesced_connection_reads_nothing_new() {
        let (conn, _rx) = ConnShared::new(ShutdownHandle::default(), 16);
        // idle: nothing to wait for
        conn.quiesce();
        let reader = {
            let conn = conn.clone();
            thread::spawn(move || conn.wait_capacity())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());
        conn.resume();
        assert!(reader.join().unwrap());
    }

    #[test]
    fn closing_releases_waiters() {
        let (conn, _rx) = ConnShared::new(ShutdownHandle::default(), 16);
        conn.quiesce();
        let held = {
            let conn = conn.clone();
            thread::spawn(move || conn.begin_request())
        };
        conn.close();
        assert!(!held.join().unwrap());
        assert!(!conn.wait_capacity());
    }

    #[test]
    fn last_reference_notifies_control_thread() {
        let (conn, rx) = ConnShared::new(ShutdownHandle::default(), 16);
        let control = conn.acquire();
        let worker = control.clone();
        let handle = thread::spawn(move || drop(worker));
        handle.join().unwrap();
        assert!(rx.try_recv().is_err());
        drop(control);
        assert_eq!(rx.try_recv(), Ok(ConnEvent::Released));
    }
}
