//! Multi-packet ("serial") exchanges.
//!
//! Some commands start an exchange in which the server answers with several packets that
//! must be handled as one logical response. Each such command is registered once, at
//! startup, as a [`SerialSignal`]: the entrance command plus a factory building the
//! [`SerialContext`] that tracks one live exchange.
//!
//! When the [`RequestQueue`] hands an entrance request to the writer it builds a context
//! for it; every inbound packet is then offered to the live contexts through
//! [`SerialContext::should_process`] and, if accepted, [`SerialContext::process_packet`].
//! A context that returns no continuation packet is complete and is dropped. Contexts past
//! their deadline are swept whenever an ordinary request is sent.
use std::{
    collections::HashMap,
    error::Error,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::packet::Packet;

use super::{RequestContext, RequestQueue};

pub type BoxError = Box<dyn Error + Send + Sync>;

type SerialFactory =
    dyn Fn(&SerialSignal, &RequestContext) -> Result<Box<dyn SerialContext>, BoxError> + Send + Sync;

/// Fields every serial context carries.
#[derive(Debug, Clone)]
pub struct SerialState {
    entrance_command: i32,
    request_packet_id: Option<String>,
    deadline: Instant,
}

impl SerialState {
    /// State for the exchange started by `request`, expiring `ttl` from now.
    pub fn new(signal: &SerialSignal, request: &RequestContext, ttl: Duration) -> Self {
        Self {
            entrance_command: signal.entrance_command(),
            request_packet_id: request.packet_id().map(String::from),
            deadline: Instant::now() + ttl,
        }
    }

    pub fn entrance_command(&self) -> i32 {
        self.entrance_command
    }

    pub fn request_packet_id(&self) -> Option<&str> {
        self.request_packet_id.as_deref()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Live state of one serial exchange. Implementations keep their progress behind interior
/// mutability; the queue may call them from the reader thread and caller threads.
pub trait SerialContext: Send + Sync {
    fn state(&self) -> &SerialState;

    /// Whether `packet` belongs to this exchange.
    fn should_process(&self, queue: &RequestQueue, packet: &Packet) -> bool;

    /// Advances the exchange. `Some` keeps it alive and lets the packet through to ordinary
    /// dispatch; `None` completes it and consumes the packet.
    fn process_packet(&self, queue: &RequestQueue, packet: &Packet) -> Option<Packet>;

    fn entrance_command(&self) -> i32 {
        self.state().entrance_command()
    }

    fn request_packet_id(&self) -> Option<&str> {
        self.state().request_packet_id()
    }

    fn is_expired(&self) -> bool {
        self.state().is_expired()
    }
}

/// Registration of one entrance command.
#[derive(Clone)]
pub struct SerialSignal {
    entrance_command: i32,
    factory: Arc<SerialFactory>,
}

impl fmt::Debug for SerialSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialSignal")
            .field("entrance_command", &self.entrance_command)
            .finish()
    }
}

impl SerialSignal {
    pub fn new<F>(entrance_command: i32, factory: F) -> Self
    where
        F: Fn(&SerialSignal, &RequestContext) -> Result<Box<dyn SerialContext>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            entrance_command,
            factory: Arc::new(factory),
        }
    }

    pub fn entrance_command(&self) -> i32 {
        self.entrance_command
    }

    pub fn build(&self, request: &RequestContext) -> Result<Box<dyn SerialContext>, BoxError> {
        (self.factory)(self, request)
    }
}

/// Immutable lookup of serial signals by entrance command.
#[derive(Debug, Default, Clone)]
pub struct SerialRegistry {
    signals: HashMap<i32, SerialSignal>,
}

impl SerialRegistry {
    pub fn builder() -> SerialRegistryBuilder {
        SerialRegistryBuilder::default()
    }

    pub fn get(&self, entrance_command: i32) -> Option<&SerialSignal> {
        self.signals.get(&entrance_command)
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SerialRegistryBuilder {
    signals: HashMap<i32, SerialSignal>,
}

impl SerialRegistryBuilder {
    /// Registers `signal`; a later registration for the same command replaces it.
    pub fn register(mut self, signal: SerialSignal) -> Self {
        self.signals.insert(signal.entrance_command(), signal);
        self
    }

    pub fn build(self) -> SerialRegistry {
        SerialRegistry {
            signals: self.signals,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::queue::RequestFlags;

    use super::*;

    struct Noop(SerialState);

    impl SerialContext for Noop {
        fn state(&self) -> &SerialState {
            &self.0
        }

        fn should_process(&self, _: &RequestQueue, _: &Packet) -> bool {
            false
        }

        fn process_packet(&self, _: &RequestQueue, _: &Packet) -> Option<Packet> {
            None
        }
    }

    fn noop_signal(command: i32, ttl: Duration) -> SerialSignal {
        SerialSignal::new(command, move |signal, request| {
            Ok(Box::new(Noop(SerialState::new(signal, request, ttl))) as Box<dyn SerialContext>)
        })
    }

    #[test]
    fn registry_looks_up_by_entrance_command() {
        let registry = SerialRegistry::builder()
            .register(noop_signal(7, Duration::from_secs(1)))
            .register(noop_signal(9, Duration::from_secs(1)))
            .build();

        assert_eq!(registry.len(), 2);
        assert!(registry.get(7).is_some());
        assert!(registry.get(8).is_none());
    }

    #[test]
    fn built_context_carries_request_identity() {
        let signal = noop_signal(7, Duration::from_secs(5));
        let request = RequestContext::new(
            Packet::new(7, Some("abc".into()), Vec::new()),
            RequestFlags::IS_REQUEST,
        );

        let context = signal.build(&request).unwrap();
        assert_eq!(context.entrance_command(), 7);
        assert_eq!(context.request_packet_id(), Some("abc"));
        assert!(!context.is_expired());
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let signal = noop_signal(7, Duration::ZERO);
        let request = RequestContext::new(Packet::new(7, None, Vec::new()), RequestFlags::IS_REQUEST);

        assert!(signal.build(&request).unwrap().is_expired());
    }

    #[test]
    fn factory_errors_are_returned() {
        let signal = SerialSignal::new(7, |_, _| Err("no variant".into()));
        let request = RequestContext::new(Packet::new(7, None, Vec::new()), RequestFlags::IS_REQUEST);

        let err = signal.build(&request).err().unwrap();
        assert_eq!(err.to_string(), "no variant");
    }
}
