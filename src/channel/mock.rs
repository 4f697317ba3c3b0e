use super::{Channel, POLL_INTERVAL};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep};

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    inbound: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    responder: Option<Responder>,
    closed: bool,
}

/// In-memory channel for tests and hardware-less dry runs.
///
/// Inbound bytes are queued through the paired [`MockHandle`], either up
/// front with [`push`](MockHandle::push) or on demand from a responder that
/// sees every write.
pub struct MockChannel {
    name: String,
    handle: MockHandle,
}

/// Test-side view of a [`MockChannel`].
#[derive(Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    pub fn new(name: impl Into<String>) -> (Self, MockHandle) {
        let handle = MockHandle::default();
        let channel = Self {
            name: name.into(),
            handle: handle.clone(),
        };
        (channel, handle)
    }
}

impl MockHandle {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue bytes for the channel to read.
    pub fn push(&self, data: &[u8]) {
        self.state().inbound.extend(data.iter().copied());
    }

    /// Reply to each write with whatever `f` returns.
    pub fn respond_with<F>(&self, f: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.state().responder = Some(Box::new(f));
    }

    /// Every write so far, one entry per call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state().writes.len()
    }

    /// All written bytes concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.state().writes.concat()
    }

    /// Simulate the device disappearing.
    pub fn close(&self) {
        self.state().closed = true;
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn describe(&self) -> String {
        format!("mock://{}", self.name)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.handle.state();
        if state.closed {
            return Err(Error::ChannelClosed(self.name.clone()));
        }
        state.writes.push(data.to_vec());
        let reply = state.responder.as_mut().and_then(|f| f(data));
        if let Some(reply) = reply {
            state.inbound.extend(reply);
        }
        Ok(())
    }

    async fn read(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.handle.state();
                if !state.inbound.is_empty() {
                    let n = max.max(1).min(state.inbound.len());
                    return Ok(state.inbound.drain(..n).collect());
                }
                if state.closed {
                    return Err(Error::ChannelClosed(self.name.clone()));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_responder_sees_writes() {
        let (mut ch, handle) = MockChannel::new("dut");
        handle.respond_with(|req| (req == b"AT\r\n").then(|| b"OK\r\n".to_vec()));
        ch.write(b"AT\r\n").await.unwrap();
        ch.write(b"ATI\r\n").await.unwrap();
        assert_eq!(handle.write_count(), 2);
        let reply = ch.read(16, Duration::from_millis(20)).await.unwrap();
        assert_eq!(reply, b"OK\r\n");
    }

    #[tokio::test]
    async fn test_closed_channel_fails() {
        let (mut ch, handle) = MockChannel::new("dut");
        handle.close();
        assert!(matches!(
            ch.write(b"x").await,
            Err(Error::ChannelClosed(_))
        ));
    }
}
