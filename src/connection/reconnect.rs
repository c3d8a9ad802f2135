//! Automatic reconnection after network failures.
//!
//! [`ReconnectionManager`] listens to its connection. When the connection fails with a
//! network error it starts a single retry thread which, for each attempt, announces the
//! wait through [`ConnectionListener::reconnecting_in`], sleeps with exponential backoff and
//! then runs the [`PreReconnect`] hook. An explicit `disconnect` cancels pending attempts.
use std::{
    sync::{Arc, Condvar, Mutex, PoisonError, Weak},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::sync::lock;

use super::{Connection, ConnectionError, ConnectionListener};

/// Step run by the reconnection manager before each retry. [`Connection`] implements it by
/// reconnecting itself.
pub trait PreReconnect: Send + Sync {
    fn do_pre_reconnect(&self, connection: &Connection);
}

#[derive(Debug, Default)]
struct Control {
    enabled: bool,
    running: bool,
    failed_while_running: bool,
}

pub struct ReconnectionManager {
    this: Weak<ReconnectionManager>,
    connection: Weak<Connection>,
    initial: Duration,
    max: Duration,
    hook: Mutex<Option<Arc<dyn PreReconnect>>>,
    control: Mutex<Control>,
    wake: Condvar,
}

impl ReconnectionManager {
    pub(crate) fn new(connection: Weak<Connection>, initial: Duration, max: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            connection,
            initial,
            max: max.max(initial),
            hook: Mutex::new(None),
            control: Mutex::new(Control {
                enabled: true,
                ..Control::default()
            }),
            wake: Condvar::new(),
        })
    }

    /// Replaces the step run before each retry. Without one the connection reconnects itself.
    pub fn set_pre_reconnect(&self, hook: Arc<dyn PreReconnect>) {
        *lock(&self.hook) = Some(hook);
    }

    /// Delay before attempt number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Cancels pending attempts until the connection comes back up.
    pub fn stop(&self) {
        lock(&self.control).enabled = false;
        self.wake.notify_all();
    }

    pub fn is_running(&self) -> bool {
        lock(&self.control).running
    }

    fn schedule(&self) {
        let mut control = lock(&self.control);
        if !control.enabled {
            debug!("reconnection disabled, not retrying");
            return;
        }
        if control.running {
            control.failed_while_running = true;
            return;
        }

        let Some(manager) = self.this.upgrade() else {
            return;
        };
        let spawned = thread::Builder::new()
            .name("reconnect".into())
            .spawn(move || manager.run());
        match spawned {
            Ok(_) => control.running = true,
            Err(e) => warn!("failed to start reconnect thread: {e}"),
        }
    }

    fn run(&self) {
        let mut attempt = 0;
        loop {
            let Some(connection) = self.connection.upgrade() else {
                break;
            };

            let delay = self.delay_for(attempt);
            info!("reconnecting in {delay:?} (attempt {})", attempt + 1);
            connection.notify_reconnecting_in(delay.as_secs());
            if !self.sleep(delay) {
                debug!("reconnection cancelled");
                break;
            }

            let hook = lock(&self.hook).clone();
            match hook {
                Some(hook) => hook.do_pre_reconnect(&connection),
                None => connection.do_pre_reconnect(&connection),
            }

            if connection.is_connected() {
                let mut control = lock(&self.control);
                if !control.failed_while_running {
                    control.running = false;
                    return;
                }
                control.failed_while_running = false;
                attempt = 0;
            } else {
                attempt = attempt.saturating_add(1);
            }
        }

        lock(&self.control).running = false;
    }

    /// Returns false if the manager was stopped before `delay` elapsed.
    fn sleep(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut control = lock(&self.control);
        loop {
            if !control.enabled {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            control = match self.wake.wait_timeout(control, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => PoisonError::into_inner(poisoned).0,
            };
        }
    }
}

impl ConnectionListener for ReconnectionManager {
    fn connected(&self, _: &Connection) {
        let mut control = lock(&self.control);
        control.enabled = true;
        control.failed_while_running = false;
    }

    fn connection_closed(&self) {
        self.stop();
    }

    fn connection_closed_on_error(&self, error: &ConnectionError) {
        debug!("scheduling reconnect after: {error}");
        self.schedule();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{Configuration, packet::BincodePacketFactory};

    use super::*;

    fn connection(port: u16) -> Arc<Connection> {
        let config = Configuration::builder()
            .host("127.0.0.1")
            .port(port)
            .reconnect_backoff(Duration::from_millis(10), Duration::from_millis(40))
            .build()
            .unwrap();
        Connection::new(&config, Arc::new(BincodePacketFactory::without_heartbeat()))
    }

    #[derive(Default)]
    struct CountingHook(AtomicUsize);

    impl PreReconnect for CountingHook {
        fn do_pre_reconnect(&self, _: &Connection) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let connection = connection(1);
        let manager = connection.bind_reconnection_manager();

        assert_eq!(manager.delay_for(0), Duration::from_millis(10));
        assert_eq!(manager.delay_for(1), Duration::from_millis(20));
        assert_eq!(manager.delay_for(2), Duration::from_millis(40));
        assert_eq!(manager.delay_for(3), Duration::from_millis(40));
        assert_eq!(manager.delay_for(40), Duration::from_millis(40));
    }

    #[test]
    fn binding_twice_returns_the_same_manager() {
        let connection = connection(1);
        let first = connection.bind_reconnection_manager();
        let second = connection.bind_reconnection_manager();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn error_runs_hook_until_stopped() {
        let connection = connection(1);
        let manager = connection.bind_reconnection_manager();
        let hook = Arc::new(CountingHook::default());
        manager.set_pre_reconnect(hook.clone());

        manager.connection_closed_on_error(&ConnectionError::NotConnected);
        manager.connection_closed_on_error(&ConnectionError::NotConnected);
        thread::sleep(Duration::from_millis(150));
        assert!(manager.is_running());
        assert!(hook.0.load(Ordering::SeqCst) >= 2);

        manager.stop();
        thread::sleep(Duration::from_millis(100));
        assert!(!manager.is_running());
        let attempts = hook.0.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(hook.0.load(Ordering::SeqCst), attempts);
    }

    #[test]
    fn explicit_close_prevents_retries() {
        let connection = connection(1);
        let manager = connection.bind_reconnection_manager();
        let hook = Arc::new(CountingHook::default());
        manager.set_pre_reconnect(hook.clone());

        manager.connection_closed();
        manager.connection_closed_on_error(&ConnectionError::NotConnected);
        thread::sleep(Duration::from_millis(60));

        assert!(!manager.is_running());
        assert_eq!(hook.0.load(Ordering::SeqCst), 0);
    }
}
