//! Socket connection lifecycle.
//!
//! A [`Connection`] owns one TCP socket to the server together with everything bound to it:
//! the [`PacketWriter`] thread that serializes outbound packets, the [`PacketReader`] thread
//! that decodes inbound ones, and the heartbeat timer.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected --connect()--> Connecting --> Connected
//!      ^                                         |
//!      +------ disconnect() / network error -----+
//! ```
//!
//! - [`Connection::connect`] always tears down the previous socket first, so it doubles as
//!   reconnect.
//! - [`Connection::disconnect`] is idempotent; calling it on a closed connection does nothing.
//! - A network-level failure (reset, broken pipe, unexpected end of stream) seen by either
//!   thread tears the socket down once and reports
//!   [`ConnectionListener::connection_closed_on_error`]. Other I/O errors are only logged.
//!
//! # Listeners
//!
//! State changes fan out to [`ConnectionListener`]s, packets to [`PacketListener`]s. Both
//! registries ignore a listener that is already registered, and callbacks never run while a
//! connection lock is held, so a listener may call back into the connection.
pub mod reconnect;

mod reader;
pub(crate) mod writer;

use std::{
    fmt,
    io::{self, BufReader, BufWriter, ErrorKind},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use socket2::SockRef;
use thiserror::Error;

use crate::{
    config::{ConfigError, Configuration},
    listeners::ListenerSet,
    packet::{CodecError, Packet, PacketFactory},
    sync::lock,
    timer::ScheduledTask,
};

use reader::{PacketReader, ReaderEvents};
use reconnect::{PreReconnect, ReconnectionManager};
use writer::{PacketWriter, WriterEvents};

pub use writer::DEFAULT_WRITER_CAPACITY;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection IO error: {0}")]
    Io(#[from] io::Error),
    #[error("connection codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("could not resolve '{0}'")]
    Resolve(String),
    #[error("not connected")]
    NotConnected,
}

/// True for errors that mean the peer is gone and the socket cannot be reused.
pub fn is_network_fatal(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Observer of connection state changes.
pub trait ConnectionListener: Send + Sync {
    fn connected(&self, connection: &Connection);

    fn connection_closed(&self) {}

    fn connection_closed_on_error(&self, error: &ConnectionError);

    /// A reconnect attempt is scheduled in `seconds`.
    fn reconnecting_in(&self, _seconds: u64) {}
}

/// Observer of packets crossing the connection.
pub trait PacketListener: Send + Sync {
    fn process_packet(&self, packet: &Packet);

    fn on_send_successful(&self, _packet: &Packet) {}
}

#[derive(Debug, Clone)]
struct Settings {
    host: String,
    port: u16,
    heartbeat: Duration,
    connect_timeout: Duration,
    reconnect_initial: Duration,
    reconnect_max: Duration,
}

pub struct Connection {
    this: Weak<Connection>,
    factory: Arc<dyn PacketFactory>,
    settings: Mutex<Settings>,
    lifecycle: Mutex<()>,
    state: Mutex<ConnectionState>,
    socket: Mutex<Option<TcpStream>>,
    writer: PacketWriter,
    reader: PacketReader,
    heartbeat: Mutex<Option<ScheduledTask>>,
    reconnection: Mutex<Option<Arc<ReconnectionManager>>>,
    connection_listeners: ListenerSet<dyn ConnectionListener>,
    packet_listeners: ListenerSet<dyn PacketListener>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings = lock(&self.settings);
        f.debug_struct("Connection")
            .field("host", &settings.host)
            .field("port", &settings.port)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(config: &Configuration, factory: Arc<dyn PacketFactory>) -> Arc<Self> {
        let settings = Settings {
            host: config.host().to_string(),
            port: config.port(),
            heartbeat: config.heartbeat(),
            connect_timeout: config.connect_timeout(),
            reconnect_initial: config.reconnect_initial(),
            reconnect_max: config.reconnect_max(),
        };

        Arc::new_cyclic(|this: &Weak<Connection>| Self {
            this: this.clone(),
            writer: PacketWriter::new(
                Arc::clone(&factory),
                this.clone() as Weak<dyn WriterEvents>,
                config.writer_capacity(),
            ),
            reader: PacketReader::new(Arc::clone(&factory), this.clone() as Weak<dyn ReaderEvents>),
            factory,
            settings: Mutex::new(settings),
            lifecycle: Mutex::new(()),
            state: Mutex::new(ConnectionState::Disconnected),
            socket: Mutex::new(None),
            heartbeat: Mutex::new(None),
            reconnection: Mutex::new(None),
            connection_listeners: ListenerSet::default(),
            packet_listeners: ListenerSet::default(),
        })
    }

    /// Opens a fresh socket, replacing any previous one.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        let (was_open, result) = {
            let _guard = lock(&self.lifecycle);
            let was_open = self.teardown();
            *lock(&self.state) = ConnectionState::Connecting;

            let result = self.establish();
            if result.is_err() {
                self.teardown();
            }
            (was_open, result)
        };

        if was_open {
            self.notify_closed();
        }
        result?;

        let settings = lock(&self.settings).clone();
        info!("connected to {}:{}", settings.host, settings.port);
        for listener in self.connection_listeners.snapshot() {
            listener.connected(self);
        }

        // Inbound packets, read errors and heartbeats only start once listeners saw `connected`.
        if let Err(e) = self.reader.startup() {
            self.notify_connection_error(ConnectionError::Io(e));
            return Ok(());
        }
        if self.factory.support_heart_beat() {
            let _guard = lock(&self.lifecycle);
            if self.is_connected() {
                if let Err(e) = self.start_heart_beat() {
                    warn!("failed to start heartbeat: {e}");
                }
            }
        }
        Ok(())
    }

    pub fn reconnect(&self) -> Result<(), ConnectionError> {
        self.connect()
    }

    /// Closes the socket and stops every thread bound to it. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let was_open = {
            let _guard = lock(&self.lifecycle);
            self.teardown()
        };

        if was_open {
            info!("connection closed");
            self.notify_closed();
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn factory(&self) -> &Arc<dyn PacketFactory> {
        &self.factory
    }

    /// Address used by the next `connect`.
    pub fn set_address(&self, host: impl Into<String>, port: u16) {
        let mut settings = lock(&self.settings);
        settings.host = host.into();
        settings.port = port;
    }

    /// Takes effect on the next `connect`. A zero interval is rejected.
    pub fn set_heartbeat_interval(&self, interval: Duration) -> Result<(), ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::Zero("heartbeat"));
        }
        lock(&self.settings).heartbeat = interval;
        Ok(())
    }

    /// Queues `packet` for the writer. Returns false when there is no live socket.
    pub fn send_packet(&self, packet: Packet) -> bool {
        if !self.is_connected() {
            trace!("dropping packet command={}: not connected", packet.command());
            return false;
        }
        self.writer.send_packet(packet)
    }

    /// Drops packets queued for the writer that have not been written yet.
    pub fn clear_write_queue(&self) -> usize {
        self.writer.clear()
    }

    /// Packets queued for the writer and not written yet.
    pub fn pending_writes(&self) -> usize {
        self.writer.pending()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        self.connection_listeners.add(listener)
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.connection_listeners.remove(listener)
    }

    pub fn add_packet_listener(&self, listener: Arc<dyn PacketListener>) -> bool {
        self.packet_listeners.add(listener)
    }

    pub fn remove_packet_listener(&self, listener: &Arc<dyn PacketListener>) -> bool {
        self.packet_listeners.remove(listener)
    }

    /// Attaches a [`ReconnectionManager`] that reconnects after network errors.
    pub fn bind_reconnection_manager(&self) -> Arc<ReconnectionManager> {
        let mut reconnection = lock(&self.reconnection);
        if let Some(manager) = reconnection.as_ref() {
            return Arc::clone(manager);
        }

        let settings = lock(&self.settings).clone();
        let manager = ReconnectionManager::new(
            self.this.clone(),
            settings.reconnect_initial,
            settings.reconnect_max,
        );
        self.connection_listeners
            .add(Arc::clone(&manager) as Arc<dyn ConnectionListener>);
        *reconnection = Some(Arc::clone(&manager));
        manager
    }

    pub fn unbind_reconnection_manager(&self) {
        if let Some(manager) = lock(&self.reconnection).take() {
            manager.stop();
            self.connection_listeners
                .remove(&(manager as Arc<dyn ConnectionListener>));
        }
    }

    /// Sends a heartbeat immediately and then every configured interval.
    pub fn start_heart_beat(&self) -> io::Result<()> {
        self.stop_heart_beat();

        let interval = lock(&self.settings).heartbeat;
        let connection = self.this.clone();
        let task = ScheduledTask::repeating("heartbeat", Duration::ZERO, interval, move || {
            if let Some(connection) = connection.upgrade() {
                let beat = connection.factory.build_heart_beat_packet();
                if !connection.is_connected() || !connection.writer.try_send_packet(beat) {
                    debug!("heartbeat skipped: connection not writable");
                }
            }
        })?;
        *lock(&self.heartbeat) = Some(task);
        Ok(())
    }

    pub fn stop_heart_beat(&self) {
        if let Some(task) = lock(&self.heartbeat).take() {
            task.cancel();
        }
    }

    /// Routes an I/O failure from the reader or writer thread.
    pub fn handle_read_write_error(&self, error: io::Error) {
        if is_network_fatal(&error) {
            error!("network failure: {error}");
            self.notify_connection_error(ConnectionError::Io(error));
        } else {
            warn!("transient socket error: {error}");
        }
    }

    /// Tears down the live socket and reports `error` to every listener. Only the first
    /// failure of a given socket is reported.
    pub fn notify_connection_error(&self, error: ConnectionError) {
        let torn_down = {
            let _guard = lock(&self.lifecycle);
            if self.state() != ConnectionState::Connected {
                false
            } else {
                self.teardown();
                true
            }
        };

        if torn_down {
            for listener in self.connection_listeners.snapshot() {
                listener.connection_closed_on_error(&error);
            }
        }
    }

    pub(crate) fn notify_reconnecting_in(&self, seconds: u64) {
        for listener in self.connection_listeners.snapshot() {
            listener.reconnecting_in(seconds);
        }
    }

    fn notify_closed(&self) {
        for listener in self.connection_listeners.snapshot() {
            listener.connection_closed();
        }
    }

    /// Must be called with the lifecycle lock held.
    fn establish(&self) -> Result<(), ConnectionError> {
        let settings = lock(&self.settings).clone();
        let stream = open_socket(&settings)?;

        self.writer.init(Box::new(BufWriter::new(stream.try_clone()?)));
        self.reader.init(Box::new(BufReader::new(stream.try_clone()?)));
        *lock(&self.socket) = Some(stream);

        self.writer.startup()?;
        *lock(&self.state) = ConnectionState::Connected;
        Ok(())
    }

    /// Must be called with the lifecycle lock held. Returns true if a socket was open.
    fn teardown(&self) -> bool {
        self.reader.shutdown();
        self.writer.shutdown();
        self.stop_heart_beat();
        *lock(&self.state) = ConnectionState::Disconnected;

        match lock(&self.socket).take() {
            Some(socket) => {
                if let Err(e) = socket.shutdown(Shutdown::Both) {
                    debug!("socket shutdown failed: {e}");
                }
                true
            }
            None => false,
        }
    }
}

fn open_socket(settings: &Settings) -> Result<TcpStream, ConnectionError> {
    let target = format!("{}:{}", settings.host, settings.port);
    let addrs: Vec<SocketAddr> = (settings.host.as_str(), settings.port)
        .to_socket_addrs()?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match connect_addr(addr, settings.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("connect to {addr} failed: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(e) => ConnectionError::Io(e),
        None => ConnectionError::Resolve(target),
    })
}

fn connect_addr(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_nodelay(true)?;
    SockRef::from(&stream).set_keepalive(true)?;
    Ok(stream)
}

impl WriterEvents for Connection {
    fn on_send_successful(&self, packet: &Packet) {
        for listener in self.packet_listeners.snapshot() {
            listener.on_send_successful(packet);
        }
    }

    fn on_write_error(&self, error: io::Error) {
        self.handle_read_write_error(error);
    }
}

impl ReaderEvents for Connection {
    fn on_packet_received(&self, packet: Packet) {
        for listener in self.packet_listeners.snapshot() {
            listener.process_packet(&packet);
        }
    }

    fn on_read_error(&self, error: io::Error) {
        self.handle_read_write_error(error);
    }

    fn on_read_failed(&self, error: io::Error) {
        error!("giving up on socket after repeated read errors: {error}");
        self.notify_connection_error(ConnectionError::Io(error));
    }
}

impl PreReconnect for Connection {
    fn do_pre_reconnect(&self, connection: &Connection) {
        if let Err(e) = connection.reconnect() {
            warn!("reconnect failed: {e}");
        }
    }
}
