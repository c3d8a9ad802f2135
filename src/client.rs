//! High level entry point.
//!
//! A [`Client`] owns one [`Connection`] and the [`RequestQueue`] correlating its traffic.
//! Requests go out through [`Client::request`] and resolve on the supplied
//! [`ResponseHandler`]; packets the server pushes on its own are delivered to handlers
//! registered with [`Client::subscribe`].
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use log::{debug, trace};

use crate::{
    config::Configuration,
    connection::{Connection, ConnectionError, ConnectionListener, PacketListener},
    listeners::ListenerSet,
    packet::{Packet, PacketFactory},
    queue::{
        AttachInfo, PacketSink, QueueError, RequestContext, RequestFlags, RequestQueue,
        ResponseHandler, RequestError, serial::SerialRegistry,
    },
    sync::lock,
};

/// Flags used by [`Client::request`].
pub const DEFAULT_REQUEST_FLAGS: RequestFlags =
    RequestFlags::IS_REQUEST.union(RequestFlags::CHECK_CONNECT_STATUS);

/// Handlers for server-pushed packets, keyed by command.
#[derive(Default)]
struct Subscriptions {
    handlers: Mutex<HashMap<i32, ListenerSet<dyn ResponseHandler>>>,
}

impl Subscriptions {
    /// Registration and removal both run under the map lock, so an emptied set is never
    /// dropped while another thread is adding to it.
    fn subscribe(&self, command: i32, handler: Arc<dyn ResponseHandler>) -> bool {
        lock(&self.handlers).entry(command).or_default().add(handler)
    }

    fn unsubscribe(&self, command: i32, handler: &Arc<dyn ResponseHandler>) -> bool {
        let mut handlers = lock(&self.handlers);
        let Some(set) = handlers.get(&command) else {
            return false;
        };
        let removed = set.remove(handler);
        if set.len() == 0 {
            handlers.remove(&command);
        }
        removed
    }

    fn handlers_for(&self, command: i32) -> Vec<Arc<dyn ResponseHandler>> {
        lock(&self.handlers)
            .get(&command)
            .map(|set| set.snapshot())
            .unwrap_or_default()
    }
}

impl ResponseHandler for Subscriptions {
    fn on_success(&self, command: i32, params: Option<&str>, attach: &AttachInfo, packet: &Packet) {
        let handlers = self.handlers_for(command);
        trace!("packet {command} fanned out to {} subscribers", handlers.len());
        for handler in handlers {
            handler.on_success(command, params, attach, packet);
        }
    }

    fn on_failure(&self, command: i32, error: &RequestError) {
        for handler in self.handlers_for(command) {
            handler.on_failure(command, error);
        }
    }
}

pub struct Client {
    connection: Arc<Connection>,
    queue: Arc<RequestQueue>,
    subscriptions: Arc<Subscriptions>,
    request_timeout: Option<Duration>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl Client {
    pub fn new(
        config: Configuration,
        factory: Arc<dyn PacketFactory>,
        registry: SerialRegistry,
    ) -> Self {
        let connection = Connection::new(&config, factory);
        let sink = Arc::downgrade(&connection) as Weak<dyn PacketSink>;
        let queue = RequestQueue::new(sink, Arc::new(registry));

        connection.add_connection_listener(Arc::clone(&queue) as Arc<dyn ConnectionListener>);
        connection.add_packet_listener(Arc::clone(&queue) as Arc<dyn PacketListener>);

        let subscriptions = Arc::new(Subscriptions::default());
        queue.set_global_notify_handler(Some(Arc::clone(&subscriptions) as Arc<dyn ResponseHandler>));

        Self {
            connection,
            queue,
            subscriptions,
            request_timeout: config.request_timeout(),
        }
    }

    pub fn connect(&self) -> Result<(), ConnectionError> {
        self.connection.connect()
    }

    /// Connects and keeps reconnecting with backoff after network failures.
    pub fn connect_and_start_watch(&self) -> Result<(), ConnectionError> {
        self.connection.bind_reconnection_manager();
        self.connection.connect()
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Sends `body` as command `command`. The request waits for the connection if it is down
    /// and fails with [`RequestError::Timeout`] after the configured request timeout.
    pub fn request(
        &self,
        command: i32,
        body: &[u8],
        attach: AttachInfo,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<Arc<RequestContext>, QueueError> {
        self.request_with_flags(command, body, DEFAULT_REQUEST_FLAGS, attach, Some(handler))
    }

    /// Like [`Client::request`] with explicit flags. `IS_REQUEST` is always added. Without a
    /// handler the request is fire-and-forget.
    pub fn request_with_flags(
        &self,
        command: i32,
        body: &[u8],
        flags: RequestFlags,
        attach: AttachInfo,
        handler: Option<Arc<dyn ResponseHandler>>,
    ) -> Result<Arc<RequestContext>, QueueError> {
        let packet = self.connection.factory().build_request_packet(command, body);
        let mut context =
            RequestContext::new(packet, flags | RequestFlags::IS_REQUEST).with_attach(attach);
        if let Some(handler) = handler {
            context = context.with_handler(handler);
        }
        if let Some(timeout) = self.request_timeout {
            context = context.with_timeout(timeout);
        }

        let context = Arc::new(context);
        if !self.queue.add_request_context(Arc::clone(&context))? {
            debug!("request {command} was not queued");
        }
        Ok(context)
    }

    /// Delivers every inbound packet with `command` to `handler`.
    pub fn subscribe(&self, command: i32, handler: Arc<dyn ResponseHandler>) -> bool {
        self.subscriptions.subscribe(command, handler)
    }

    pub fn unsubscribe(&self, command: i32, handler: &Arc<dyn ResponseHandler>) -> bool {
        self.subscriptions.unsubscribe(command, handler)
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.connection.unbind_reconnection_manager();
        self.connection.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::mpsc, thread};

    use crate::{packet::BincodePacketFactory, server::EchoServer};

    use super::*;

    const WAIT: Duration = Duration::from_secs(3);

    enum Outcome {
        Success(Packet, AttachInfo),
        Failure(RequestError),
    }

    struct Channel(Mutex<mpsc::Sender<Outcome>>);

    impl Channel {
        fn new() -> (Arc<Self>, mpsc::Receiver<Outcome>) {
            let (tx, rx) = mpsc::channel();
            (Arc::new(Self(Mutex::new(tx))), rx)
        }
    }

    impl ResponseHandler for Channel {
        fn on_success(&self, _: i32, _: Option<&str>, attach: &AttachInfo, packet: &Packet) {
            let _ = self.0.lock().unwrap().send(Outcome::Success(packet.clone(), attach.clone()));
        }

        fn on_failure(&self, _: i32, error: &RequestError) {
            let _ = self.0.lock().unwrap().send(Outcome::Failure(error.clone()));
        }
    }

    fn echo_server() -> SocketAddr {
        let server = EchoServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(BincodePacketFactory::new()),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.listen());
        addr
    }

    fn client(addr: SocketAddr, timeout: Option<Duration>) -> Client {
        let config = Configuration::builder()
            .host(addr.ip().to_string())
            .port(addr.port())
            .request_timeout(timeout)
            .build()
            .unwrap();
        Client::new(config, Arc::new(BincodePacketFactory::new()), SerialRegistry::default())
    }

    #[test]
    fn request_round_trips_through_echo_server() {
        let client = client(echo_server(), Some(WAIT));
        client.connect().unwrap();

        let (handler, outcomes) = Channel::new();
        let mut attach = AttachInfo::new();
        attach.insert("origin".into(), "test".into());
        let context = client.request(7, b"hello", attach.clone(), handler).unwrap();

        match outcomes.recv_timeout(WAIT).unwrap() {
            Outcome::Success(packet, received) => {
                assert_eq!(packet.command(), 7);
                assert_eq!(packet.body(), b"hello");
                assert_eq!(packet.packet_id(), context.packet_id());
                assert_eq!(received, attach);
            }
            Outcome::Failure(e) => panic!("request failed: {e}"),
        }
        assert!(client.queue().is_empty());
    }

    #[test]
    fn request_waits_for_connection() {
        let client = client(echo_server(), Some(WAIT));
        let (handler, outcomes) = Channel::new();

        let context = client.request(3, b"later", AttachInfo::new(), handler).unwrap();
        assert!(!context.has_flags(RequestFlags::ALREADY_SENT));
        assert_eq!(client.queue().len(), 1);

        client.connect().unwrap();
        assert!(matches!(outcomes.recv_timeout(WAIT).unwrap(), Outcome::Success(..)));
    }

    #[test]
    fn unanswered_request_times_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = thread::spawn(move || listener.accept().map(|(stream, _)| stream));

        let timeout = Duration::from_millis(50);
        let client = client(addr, Some(timeout));
        client.connect().unwrap();
        let _peer = silent.join().unwrap().unwrap();

        let (handler, outcomes) = Channel::new();
        client.request(9, b"", AttachInfo::new(), handler).unwrap();

        match outcomes.recv_timeout(WAIT).unwrap() {
            Outcome::Failure(e) => assert_eq!(e, RequestError::Timeout { command: 9, after: timeout }),
            Outcome::Success(..) => panic!("silent server answered"),
        }
        thread::sleep(Duration::from_millis(20));
        assert!(client.queue().is_empty());
    }

    #[test]
    fn subscribers_see_packets_for_their_command() {
        let client = client(echo_server(), None);
        client.connect().unwrap();

        let (subscriber, pushed) = Channel::new();
        let subscriber = subscriber as Arc<dyn ResponseHandler>;
        assert!(client.subscribe(21, Arc::clone(&subscriber)));
        assert!(!client.subscribe(21, Arc::clone(&subscriber)));

        client
            .request_with_flags(22, b"other", DEFAULT_REQUEST_FLAGS, AttachInfo::new(), None)
            .unwrap();
        client
            .request_with_flags(21, b"news", DEFAULT_REQUEST_FLAGS, AttachInfo::new(), None)
            .unwrap();

        match pushed.recv_timeout(WAIT).unwrap() {
            Outcome::Success(packet, _) => assert_eq!(packet.body(), b"news"),
            Outcome::Failure(e) => panic!("unexpected failure: {e}"),
        }
        assert!(pushed.recv_timeout(Duration::from_millis(100)).is_err());

        assert!(client.unsubscribe(21, &subscriber));
        assert!(!client.unsubscribe(21, &subscriber));
    }

    #[test]
    fn resubscribing_after_the_last_unsubscribe_still_delivers() {
        let client = client(echo_server(), None);
        client.connect().unwrap();

        let (subscriber, pushed) = Channel::new();
        let subscriber = subscriber as Arc<dyn ResponseHandler>;
        assert!(client.subscribe(31, Arc::clone(&subscriber)));
        assert!(client.unsubscribe(31, &subscriber));
        assert!(client.subscribe(31, Arc::clone(&subscriber)));

        client
            .request_with_flags(31, b"again", DEFAULT_REQUEST_FLAGS, AttachInfo::new(), None)
            .unwrap();
        match pushed.recv_timeout(WAIT).unwrap() {
            Outcome::Success(packet, _) => assert_eq!(packet.body(), b"again"),
            Outcome::Failure(e) => panic!("unexpected failure: {e}"),
        }
    }

    #[test]
    fn concurrent_subscribe_and_unsubscribe_keep_live_handlers() {
        let subscriptions = Arc::new(Subscriptions::default());
        let (kept, _rx) = Channel::new();
        let kept = kept as Arc<dyn ResponseHandler>;

        let churn = {
            let subscriptions = Arc::clone(&subscriptions);
            thread::spawn(move || {
                for _ in 0..500 {
                    let (other, _rx) = Channel::new();
                    let other = other as Arc<dyn ResponseHandler>;
                    subscriptions.subscribe(5, Arc::clone(&other));
                    subscriptions.unsubscribe(5, &other);
                }
            })
        };
        for _ in 0..500 {
            assert!(subscriptions.subscribe(5, Arc::clone(&kept)));
            assert_eq!(
                subscriptions
                    .handlers_for(5)
                    .iter()
                    .filter(|h| Arc::ptr_eq(h, &kept))
                    .count(),
                1
            );
            assert!(subscriptions.unsubscribe(5, &kept));
        }
        churn.join().unwrap();
        assert!(subscriptions.handlers_for(5).is_empty());
    }
}
