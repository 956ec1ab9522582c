//! Connection and data-transfer notifications.
//!
//! Observers are notification-only: they never influence relay control flow.
//! The [`Dispatcher`] fans every event out to all registered observers in
//! registration order and contains any observer failure (error or panic) so
//! that one misbehaving observer cannot break another one or the relay path.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

/// Receives proxy events.
///
/// Every method has a no-op default so implementors only override the events
/// they care about. Returned errors are logged by the dispatcher and dropped.
pub trait ProxyObserver: Send + Sync + 'static {
    /// A client connected to `listen_port` and was relayed to `remote`.
    fn connection_made(&self, _listen_port: u16, _remote: SocketAddr) -> anyhow::Result<()> {
        Ok(())
    }

    /// Bytes read from the local client were written to `remote`.
    fn sent_data(&self, _listen_port: u16, _remote: SocketAddr, _data: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    /// Bytes read from `remote` were written to the local client.
    fn received_data(
        &self,
        _listen_port: u16,
        _remote: SocketAddr,
        _data: &[u8],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fans events out to registered observers.
#[derive(Default)]
pub struct Dispatcher {
    observers: RwLock<Vec<Arc<dyn ProxyObserver>>>,
}

impl Dispatcher {
    /// Create a dispatcher with no observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Takes effect for events dispatched afterwards,
    /// including those of relays that are already running.
    pub fn add_observer(&self, observer: Arc<dyn ProxyObserver>) {
        let mut observers = match self.observers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        observers.push(observer);
        debug!(observer_count = observers.len(), "Observer registered");
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connection_made(&self, listen_port: u16, remote: SocketAddr) {
        self.dispatch("connection_made", |o| o.connection_made(listen_port, remote));
    }

    pub fn sent_data(&self, listen_port: u16, remote: SocketAddr, data: &[u8]) {
        self.dispatch("sent_data", |o| o.sent_data(listen_port, remote, data));
    }

    pub fn received_data(&self, listen_port: u16, remote: SocketAddr, data: &[u8]) {
        self.dispatch("received_data", |o| o.received_data(listen_port, remote, data));
    }

    fn snapshot(&self) -> Vec<Arc<dyn ProxyObserver>> {
        match self.observers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn dispatch<F>(&self, event: &'static str, notify: F)
    where
        F: Fn(&dyn ProxyObserver) -> anyhow::Result<()>,
    {
        // Observers run outside the lock so they may register further observers.
        for (index, observer) in self.snapshot().iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| notify(observer.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(event, observer = index, error = %e, "Observer failed");
                }
                Err(_) => {
                    warn!(event, observer = index, "Observer panicked");
                }
            }
        }
    }
}

/// Observer that writes every event to the log at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ProxyObserver for LoggingObserver {
    fn connection_made(&self, listen_port: u16, remote: SocketAddr) -> anyhow::Result<()> {
        debug!(port = listen_port, remote = %remote, "Connection made");
        Ok(())
    }

    fn sent_data(&self, listen_port: u16, remote: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        debug!(port = listen_port, remote = %remote, bytes = data.len(), "Data sent");
        Ok(())
    }

    fn received_data(
        &self,
        listen_port: u16,
        remote: SocketAddr,
        data: &[u8],
    ) -> anyhow::Result<()> {
        debug!(port = listen_port, remote = %remote, bytes = data.len(), "Data received");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ProxyObserver for Recorder {
        fn connection_made(&self, listen_port: u16, _remote: SocketAddr) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:connect:{}", self.name, listen_port));
            Ok(())
        }

        fn sent_data(&self, _port: u16, _remote: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:sent:{}", self.name, String::from_utf8_lossy(data)));
            Ok(())
        }
    }

    struct Failing;

    impl ProxyObserver for Failing {
        fn connection_made(&self, _port: u16, _remote: SocketAddr) -> anyhow::Result<()> {
            anyhow::bail!("observer refused")
        }

        fn sent_data(&self, _port: u16, _remote: SocketAddr, _data: &[u8]) -> anyhow::Result<()> {
            panic!("observer exploded")
        }
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:9090".parse().unwrap()
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new();
        dispatcher.add_observer(Arc::new(Recorder {
            name: "a",
            log: Arc::clone(&log),
        }));
        dispatcher.add_observer(Arc::new(Recorder {
            name: "b",
            log: Arc::clone(&log),
        }));

        dispatcher.connection_made(7878, remote());

        assert_eq!(*log.lock().unwrap(), vec!["a:connect:7878", "b:connect:7878"]);
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn test_failing_observer_does_not_stop_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new();
        dispatcher.add_observer(Arc::new(Failing));
        dispatcher.add_observer(Arc::new(Recorder {
            name: "ok",
            log: Arc::clone(&log),
        }));

        dispatcher.connection_made(7878, remote());
        dispatcher.sent_data(7878, remote(), b"Hello World");

        assert_eq!(
            *log.lock().unwrap(),
            vec!["ok:connect:7878", "ok:sent:Hello World"]
        );
    }

    #[test]
    fn test_default_methods_are_noops() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_observer(Arc::new(LoggingObserver));
        dispatcher.received_data(7878, remote(), b"From Remote");
        assert!(!dispatcher.is_empty());
    }
}
