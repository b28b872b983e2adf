//! Modbus TCP connection management.
//!
//! [`ConnectionManager`] owns the single device session. Transactions are
//! serialized behind a mutex (Modbus TCP must not pipeline on one session),
//! connection-class failures trigger a reconnect with exponential backoff,
//! and each operation gets at most [`MAX_ATTEMPTS`] tries.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::ModbusConfig;
use crate::error::{Dx2wError, Result};

/// Tries per operation before the error is surfaced to the caller.
pub const MAX_ATTEMPTS: usize = 2;

/// An established session with the device.
pub trait ModbusSession: Send + 'static {
    /// Read `count` holding registers starting at `address`.
    fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> impl Future<Output = Result<Vec<u16>>> + Send;

    /// Write `words` to consecutive holding registers starting at `address`.
    fn write_multiple_registers(
        &mut self,
        address: u16,
        words: &[u16],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Close the session. Errors are ignored.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens new sessions to the device.
pub trait Connector: Send + Sync + 'static {
    type Session: ModbusSession;

    /// Make a single connection attempt.
    fn connect(&self) -> impl Future<Output = Result<Self::Session>> + Send;

    /// Peer description used in logs.
    fn describe(&self) -> String;
}

/// Connects to a Modbus TCP gateway with `tokio-modbus`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    unit_id: u8,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(config: &ModbusConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            unit_id: config.unit_id,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| Dx2wError::Connection(format!("Invalid address: {}", e)))?;
        addrs.next().ok_or_else(|| {
            Dx2wError::Connection(format!("No address found for {}", self.describe()))
        })
    }
}

impl Connector for TcpConnector {
    type Session = TcpSession;

    async fn connect(&self) -> Result<TcpSession> {
        let addr = self.resolve().await?;
        let ctx = tokio::time::timeout(self.timeout, tcp::connect_slave(addr, Slave(self.unit_id)))
            .await
            .map_err(|_| Dx2wError::Connection("Connection timeout".to_string()))??;

        Ok(TcpSession {
            ctx,
            timeout: self.timeout,
        })
    }

    fn describe(&self) -> String {
        format!("{}:{} (unit {})", self.host, self.port, self.unit_id)
    }
}

/// A live `tokio-modbus` client context.
#[derive(Debug)]
pub struct TcpSession {
    ctx: Context,
    timeout: Duration,
}

impl TcpSession {
    async fn with_timeout<T>(
        timeout: Duration,
        fut: impl Future<Output = tokio_modbus::Result<T>>,
    ) -> Result<T> {
        let response = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| Dx2wError::Connection("i/o timeout".to_string()))?;
        Ok(response??)
    }
}

impl ModbusSession for TcpSession {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        Self::with_timeout(self.timeout, self.ctx.read_holding_registers(address, count)).await
    }

    async fn write_multiple_registers(&mut self, address: u16, words: &[u16]) -> Result<()> {
        Self::with_timeout(self.timeout, self.ctx.write_multiple_registers(address, words)).await
    }

    async fn close(&mut self) {
        let _ = self.ctx.disconnect().await;
    }
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay following `current`: doubled, capped at `max`.
    pub fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Options for [`ConnectionManager::new`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub backoff: BackoffPolicy,
    /// Stops reconnect loops when `true` is sent.
    pub shutdown: Option<watch::Receiver<bool>>,
}

/// Connection state, owned by the manager.
#[derive(Debug)]
enum ConnectionState<S> {
    Disconnected,
    Connected(S),
}

/// A single register transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Operation {
    Read { address: u16, count: u16 },
    Write { address: u16, words: Vec<u16> },
}

#[derive(Debug)]
enum Outcome {
    Words(Vec<u16>),
    Written,
}

struct Inner<C: Connector> {
    connector: C,
    state: Mutex<ConnectionState<C::Session>>,
    backoff: BackoffPolicy,
    shutdown: Option<watch::Receiver<bool>>,
    reconnect_pending: AtomicBool,
}

/// Shared handle to the device session.
///
/// Cloning is cheap; every clone talks to the same session and the same lock.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager. No connection is made until [`connect`](Self::connect)
    /// or the first transaction.
    pub fn new(connector: C, options: ConnectionOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                state: Mutex::new(ConnectionState::Disconnected),
                backoff: options.backoff,
                shutdown: options.shutdown,
                reconnect_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Connect, retrying forever with exponential backoff (1s doubling up to 30s).
    /// Returns immediately if a session is already established.
    ///
    /// This is a liveness primitive, not an error path: it does not return
    /// until a session is established. If the device is permanently
    /// unreachable the caller blocks indefinitely, which is the intended
    /// behavior for an unattended controller. The only early exit is the
    /// shutdown signal, in which case the manager stays disconnected.
    ///
    /// The session lock is only taken to install the new session; backoff
    /// sleeps never hold it.
    pub async fn connect(&self) {
        let peer = self.inner.connector.describe();
        let mut delay = self.inner.backoff.initial;

        loop {
            if self.is_connected().await {
                return;
            }
            if self.is_shutting_down() {
                info!(peer = %peer, "Shutdown requested, abandoning connect");
                return;
            }

            info!(peer = %peer, "Connecting to Modbus device...");
            match self.inner.connector.connect().await {
                Ok(mut session) => {
                    let mut state = self.inner.state.lock().await;
                    if let ConnectionState::Connected(_) = &*state {
                        // Another caller connected while we were dialing
                        session.close().await;
                    } else {
                        *state = ConnectionState::Connected(session);
                        info!(peer = %peer, "Connected to Modbus device");
                    }
                    return;
                }
                Err(e) => {
                    error!(peer = %peer, error = %e, retry_in = ?delay, "Modbus connect failed");
                    if self.sleep_or_shutdown(delay).await {
                        info!(peer = %peer, "Shutdown requested, abandoning connect");
                        return;
                    }
                    delay = self.inner.backoff.next(delay);
                }
            }
        }
    }

    /// Whether a session is currently established.
    pub async fn is_connected(&self) -> bool {
        matches!(
            *self.inner.state.lock().await,
            ConnectionState::Connected(_)
        )
    }

    /// Read `count` holding registers starting at `address`.
    pub async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        match self.execute(Operation::Read { address, count }).await? {
            Outcome::Words(words) => Ok(words),
            Outcome::Written => Err(Dx2wError::Modbus("unexpected write response".to_string())),
        }
    }

    /// Write `words` starting at `address`.
    pub async fn write_registers(&self, address: u16, words: &[u16]) -> Result<()> {
        let op = Operation::Write {
            address,
            words: words.to_vec(),
        };
        self.execute(op).await.map(|_| ())
    }

    /// Close the session (shutdown).
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if let ConnectionState::Connected(session) = &mut *state {
            session.close().await;
            info!(peer = %self.inner.connector.describe(), "Modbus connection closed");
        }
        *state = ConnectionState::Disconnected;
    }

    /// Run one transaction with reconnect-and-retry.
    async fn execute(&self, op: Operation) -> Result<Outcome> {
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.try_once(&op).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connection() => {
                    warn!(attempt, error = %e, "Modbus connection error");
                    self.drop_session().await;
                    if attempt < MAX_ATTEMPTS {
                        self.connect().await;
                    }
                    last_err = Some(e);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Modbus transaction failed");
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| Dx2wError::Connection("no attempt made".to_string()));
        error!(error = %err, attempts = MAX_ATTEMPTS, "Too many retries, will reconnect");
        self.spawn_reconnect();
        Err(err)
    }

    async fn try_once(&self, op: &Operation) -> Result<Outcome> {
        if !self.is_connected().await {
            self.connect().await;
        }

        let mut state = self.inner.state.lock().await;
        let ConnectionState::Connected(session) = &mut *state else {
            return Err(Dx2wError::Connection("not connected".to_string()));
        };

        match op {
            Operation::Read { address, count } => {
                let words = session.read_holding_registers(*address, *count).await?;
                Ok(Outcome::Words(words))
            }
            Operation::Write { address, words } => {
                session.write_multiple_registers(*address, words).await?;
                Ok(Outcome::Written)
            }
        }
    }

    async fn drop_session(&self) {
        let mut state = self.inner.state.lock().await;
        if let ConnectionState::Connected(session) = &mut *state {
            session.close().await;
        }
        *state = ConnectionState::Disconnected;
    }

    /// Reconnect in the background so the next caller finds a fresh session.
    fn spawn_reconnect(&self) {
        if self.is_shutting_down() {
            return;
        }
        if self.inner.reconnect_pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.drop_session().await;
            manager.connect().await;
            manager.inner.reconnect_pending.store(false, Ordering::Release);
        });
    }

    fn is_shutting_down(&self) -> bool {
        self.inner
            .shutdown
            .as_ref()
            .is_some_and(|rx| *rx.borrow())
    }

    /// Sleep for `delay`; returns `true` if shutdown was signalled first.
    async fn sleep_or_shutdown(&self, delay: Duration) -> bool {
        let Some(rx) = &self.inner.shutdown else {
            tokio::time::sleep(delay).await;
            return false;
        };

        let mut rx = rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = stopped(&mut rx) => true,
        }
    }
}

/// Resolves once `true` is sent or the sender is dropped.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}


#[cfg(test)]
mod tests {
    use super::testing::{FakeDevice, Fault};
    use super::*;

    fn manager(device: &FakeDevice) -> ConnectionManager<FakeDevice> {
        ConnectionManager::new(device.clone(), ConnectionOptions::default())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::default();
        let mut delay = policy.initial;
        let mut seen = vec![delay.as_secs()];
        for _ in 0..6 {
            delay = policy.next(delay);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_with_backoff() {
        let device = FakeDevice::new();
        device.fail_next_connects(6);
        let manager = manager(&device);

        let start = tokio::time::Instant::now();
        manager.connect().await;

        // 1 + 2 + 4 + 8 + 16 + 30
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(61));
        assert!(elapsed < Duration::from_secs(62));
        assert!(manager.is_connected().await);
        assert_eq!(device.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_abandoned_on_shutdown() {
        let device = FakeDevice::new();
        device.fail_next_connects(usize::MAX);
        let (tx, rx) = watch::channel(false);
        let manager = ConnectionManager::new(
            device.clone(),
            ConnectionOptions {
                shutdown: Some(rx),
                ..Default::default()
            },
        );

        let task = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        tokio::time::sleep(Duration::from_secs(10)).await;
        tx.send(true).unwrap();

        task.await.unwrap();
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_read_connects_lazily() {
        let device = FakeDevice::new();
        device.set(100, &[1, 2, 3]);
        let manager = manager(&device);

        let words = manager.read_registers(100, 3).await.unwrap();
        assert_eq!(words, vec![1, 2, 3]);
        assert_eq!(device.connects(), 1);
    }

    #[tokio::test]
    async fn test_connection_error_reconnects_and_retries() {
        let device = FakeDevice::new();
        device.set(5, &[42]);
        let manager = manager(&device);
        manager.connect().await;

        device.inject(Fault::ConnectionReset);
        let words = manager.read_registers(5, 1).await.unwrap();

        assert_eq!(words, vec![42]);
        assert_eq!(device.connects(), 2);
    }

    #[tokio::test]
    async fn test_exception_retried_once_then_surfaced() {
        let device = FakeDevice::new();
        let manager = manager(&device);
        manager.connect().await;

        device.inject(Fault::Exception);
        device.inject(Fault::Exception);
        let err = manager.read_registers(5, 1).await.unwrap_err();
        assert!(matches!(err, Dx2wError::Modbus(_)));

        // Background reconnect prepares the session for the next call
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.read_registers(5, 1).await.unwrap(), vec![0]);
        assert_eq!(device.connects(), 2);
    }

    #[tokio::test]
    async fn test_persistent_connection_error_surfaced() {
        let device = FakeDevice::new();
        let manager = manager(&device);
        manager.connect().await;

        device.inject(Fault::ConnectionReset);
        device.inject(Fault::ConnectionReset);
        let err = manager.write_registers(1, &[7]).await.unwrap_err();

        assert!(err.is_connection());
        assert_eq!(device.writes(), 0);
    }

    #[tokio::test]
    async fn test_write_registers() {
        let device = FakeDevice::new();
        let manager = manager(&device);

        manager.write_registers(10, &[0xFFFF, 0x0001]).await.unwrap();
        assert_eq!(manager.read_registers(10, 2).await.unwrap(), vec![0xFFFF, 1]);
    }

    #[tokio::test]
    async fn test_close() {
        let device = FakeDevice::new();
        let manager = manager(&device);
        manager.connect().await;

        manager.close().await;
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_concurrent_transactions_serialized() {
        let device = FakeDevice::new();
        device.set(0, &[9]);
        let manager = manager(&device);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.read_registers(0, 1).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), vec![9]);
        }
    }
}
