//! Scripted in-memory port for driver tests.
//!
//! Each flushed write releases the next queued reply into the receive
//! buffer, so a test lists replies in the order the driver sends commands.
//! Unsolicited data, like a wavemeter broadcast, is queued with
//! [`MockPort::broadcast`] and lands only once a read finds the buffer empty.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

use super::Port;

#[derive(Default)]
struct MockState {
    rx: VecDeque<u8>,
    pending: Vec<u8>,
    written: Vec<Vec<u8>>,
    replies: VecDeque<Vec<u8>>,
    broadcasts: VecDeque<Vec<u8>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue the reply to the next unanswered write. Empty means silence.
    pub(crate) fn reply(&self, bytes: impl AsRef<[u8]>) {
        self.state.lock().replies.push_back(bytes.as_ref().to_vec());
    }

    /// Put bytes straight into the receive buffer.
    pub(crate) fn preload(&self, bytes: impl AsRef<[u8]>) {
        self.state.lock().rx.extend(bytes.as_ref());
    }

    /// Queue data that arrives unprompted, after anything already waiting
    /// has been read or purged.
    pub(crate) fn broadcast(&self, bytes: impl AsRef<[u8]>) {
        self.state.lock().broadcasts.push_back(bytes.as_ref().to_vec());
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub(crate) fn written_strings(&self) -> Vec<String> {
        self.written()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub(crate) fn unread(&self) -> usize {
        self.state.lock().rx.len()
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.rx.is_empty() {
            if let Some(data) = state.broadcasts.pop_front() {
                state.rx.extend(data);
            }
        }
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock port is empty"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            return Ok(());
        }
        let frame = std::mem::take(&mut state.pending);
        state.written.push(frame);
        if let Some(reply) = state.replies.pop_front() {
            state.rx.extend(reply);
        }
        Ok(())
    }
}

impl Port for MockPort {
    fn bytes_to_read(&self) -> io::Result<usize> {
        Ok(self.state.lock().rx.len())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().rx.clear();
        Ok(())
    }
}
