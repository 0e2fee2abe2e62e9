//! Periodic on-demand data requests

use log::{debug, error, info};
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::connection::{ConnectionState, Transport};
use crate::thread_util::spawn_named;

/// Background thread that sends one pre-encoded request every `interval`
/// while the session is authenticated.
pub struct PollScheduler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PollScheduler {
    pub fn start(
        transport: Arc<dyn Transport>,
        request: Vec<u8>,
        interval: Duration,
    ) -> io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = spawn_named("roverlink-poll", move || {
            poll_loop(transport.as_ref(), &request, interval, &stop_rx);
        })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Whether the thread is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            // Already exited if the receiver is gone
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Poll thread panicked");
            }
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(transport: &dyn Transport, request: &[u8], interval: Duration, stop_rx: &Receiver<()>) {
    info!("Poller started ({} ms interval)", interval.as_millis());
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let state = transport.state();
        if state.is_terminal() {
            info!("Connection {state}, poller exiting");
            break;
        }
        if state != ConnectionState::Authenticated {
            continue;
        }
        if let Err(e) = transport.send(request) {
            debug!("Poll request not sent: {e}");
        }
    }
    info!("Poller stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::ConnectionError;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Records every write instead of touching a socket
    pub struct FakeTransport {
        pub state: Mutex<ConnectionState>,
        pub sent: Mutex<Vec<Vec<u8>>>,
    }

    impl FakeTransport {
        pub fn new(state: ConnectionState) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(state),
                sent: Mutex::new(Vec::new()),
            })
        }

        pub fn set_state(&self, state: ConnectionState) {
            *self.state.lock().unwrap() = state;
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Transport for FakeTransport {
        fn state(&self) -> ConnectionState {
            *self.state.lock().unwrap()
        }

        fn send(&self, bytes: &[u8]) -> Result<(), ConnectionError> {
            if self.state().is_terminal() {
                return Err(ConnectionError::Closed);
            }
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    pub fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_polls_while_authenticated() {
        let transport = FakeTransport::new(ConnectionState::Authenticated);
        let mut poller = PollScheduler::start(
            transport.clone(),
            b"{\"t\":\"GET_DATA\"}\n".to_vec(),
            Duration::from_millis(10),
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(5), || transport.sent_count() >= 2));
        poller.stop();
        let sent = transport.sent.lock().unwrap();
        assert!(sent.iter().all(|m| m == b"{\"t\":\"GET_DATA\"}\n"));
    }

    #[test]
    fn test_waits_for_authentication() {
        let transport = FakeTransport::new(ConnectionState::HandshakeSent);
        let mut poller =
            PollScheduler::start(transport.clone(), b"x\n".to_vec(), Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(transport.sent_count(), 0);
        assert!(poller.is_running());

        transport.set_state(ConnectionState::Authenticated);
        assert!(wait_until(Duration::from_secs(5), || transport.sent_count() >= 1));
        poller.stop();
    }

    #[test]
    fn test_exits_when_connection_ends() {
        let transport = FakeTransport::new(ConnectionState::Authenticated);
        let poller =
            PollScheduler::start(transport.clone(), b"x\n".to_vec(), Duration::from_millis(5)).unwrap();
        transport.set_state(ConnectionState::Disconnected);
        assert!(wait_until(Duration::from_secs(5), || !poller.is_running()));
    }

    #[test]
    fn test_stop_does_not_wait_for_interval() {
        let transport = FakeTransport::new(ConnectionState::Authenticated);
        let mut poller =
            PollScheduler::start(transport.clone(), b"x\n".to_vec(), Duration::from_secs(3600)).unwrap();
        let start = Instant::now();
        poller.stop();
        poller.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!poller.is_running());
        assert_eq!(transport.sent_count(), 0);
    }
}
