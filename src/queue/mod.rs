//! Request/response correlation.
//!
//! The [`RequestQueue`] tracks every in-flight [`RequestContext`], decides when each one is
//! written according to its [`RequestFlags`], and routes inbound packets back to the
//! contexts waiting for them.
//!
//! # Adding a context
//!
//! [`RequestQueue::add_request_context`] applies the flags in a fixed order:
//!
//! 1. `CLEAR_QUEUE` removes every queued context and drops unwritten packets.
//! 2. `NO_REPEAT` drops the new context if one with the same command is queued.
//! 3. The context is inserted at the head (`JUMP_QUEUE`) or the tail.
//! 4. The request is sent, unless `CHECK_CONNECT_STATUS` is set and the connection is down,
//!    in which case it waits for the next `connected` event.
//!
//! # Inbound packets
//!
//! Each packet is first offered to the live serial contexts (see [`serial`]). Unless one of
//! them consumes it, every queued context with the same command and correlation id is
//! resolved and removed. A global notify handler, when set, sees every dispatched packet.
//!
//! # Disconnects
//!
//! Closing the connection does not fail queued requests. Unsent ones are written when the
//! connection comes back; sent ones keep waiting for their response or timeout.
mod context;
pub mod serial;

use std::{
    io,
    sync::{Arc, Mutex, Weak},
};

use log::{debug, error, trace, warn};
use thiserror::Error;

use crate::{
    connection::{Connection, ConnectionError, ConnectionListener, PacketListener},
    packet::Packet,
    sync::lock,
};

pub use context::{AttachInfo, RequestContext, RequestError, RequestFlags, ResponseHandler};
use serial::{BoxError, SerialContext, SerialRegistry};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("context for command {0} is not flagged as a request")]
    NotARequest(i32),
    #[error("failed to arm request timeout: {0}")]
    Timer(io::Error),
    #[error("failed to build serial context for command {command}: {source}")]
    SerialContext {
        command: i32,
        #[source]
        source: BoxError,
    },
}

/// Where the queue writes request packets. Implemented by [`Connection`].
pub trait PacketSink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Hands `packet` to the writer. Returns false if it could not be queued.
    fn send_packet(&self, packet: Packet) -> bool;

    /// Drops packets accepted by `send_packet` that have not been written yet.
    fn clear_write_queue(&self) {}
}

impl PacketSink for Connection {
    fn is_connected(&self) -> bool {
        Connection::is_connected(self)
    }

    fn send_packet(&self, packet: Packet) -> bool {
        Connection::send_packet(self, packet)
    }

    fn clear_write_queue(&self) {
        let dropped = Connection::clear_write_queue(self);
        if dropped > 0 {
            debug!("dropped {dropped} unwritten packets");
        }
    }
}

pub struct RequestQueue {
    this: Weak<RequestQueue>,
    sink: Weak<dyn PacketSink>,
    registry: Arc<SerialRegistry>,
    contexts: Mutex<Vec<Arc<RequestContext>>>,
    serial_contexts: Mutex<Vec<Arc<dyn SerialContext>>>,
    global_notify_handler: Mutex<Option<Arc<dyn ResponseHandler>>>,
}

impl RequestQueue {
    pub fn new(sink: Weak<dyn PacketSink>, registry: Arc<SerialRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            sink,
            registry,
            contexts: Mutex::new(Vec::new()),
            serial_contexts: Mutex::new(Vec::new()),
            global_notify_handler: Mutex::new(None),
        })
    }

    /// Queues `context` and sends it if allowed. Returns false if it was dropped as a
    /// duplicate instance or by `NO_REPEAT`.
    pub fn add_request_context(&self, context: Arc<RequestContext>) -> Result<bool, QueueError> {
        if !context.has_flags(RequestFlags::IS_REQUEST) {
            return Err(QueueError::NotARequest(context.command()));
        }
        let flags = context.flags();

        let cleared = {
            let mut contexts = lock(&self.contexts);
            if contexts.iter().any(|c| Arc::ptr_eq(c, &context)) {
                return Ok(false);
            }

            // A cleared queue holds nothing to repeat.
            if !flags.contains(RequestFlags::CLEAR_QUEUE)
                && flags.contains(RequestFlags::NO_REPEAT)
                && contexts.iter().any(|c| c.command() == context.command())
            {
                trace!("dropping repeated request for command {}", context.command());
                return Ok(false);
            }

            // Armed while the lock is held so a concurrent removal always sees the timer.
            self.arm_timeout(&context)?;

            let cleared = if flags.contains(RequestFlags::CLEAR_QUEUE) {
                std::mem::take(&mut *contexts)
            } else {
                Vec::new()
            };

            if flags.contains(RequestFlags::JUMP_QUEUE) {
                contexts.insert(0, Arc::clone(&context));
            } else {
                contexts.push(Arc::clone(&context));
            }
            cleared
        };

        if flags.contains(RequestFlags::CLEAR_QUEUE) {
            debug!("clearing {} queued requests", cleared.len());
            for removed in &cleared {
                removed.on_removed();
            }
            if let Some(sink) = self.sink.upgrade() {
                sink.clear_write_queue();
            }
        }

        self.send_request(&context)?;
        Ok(true)
    }

    /// Hands the context's packet to the writer. Returns true if it was sent now.
    pub fn send_request(&self, context: &Arc<RequestContext>) -> Result<bool, QueueError> {
        if context.has_flags(RequestFlags::CHECK_CONNECT_STATUS) && !self.is_connected() {
            debug!("not connected, request {} waits", context.command());
            return Ok(false);
        }
        if !context.claim_send() {
            return Ok(false);
        }

        let sent = self
            .sink
            .upgrade()
            .is_some_and(|sink| sink.send_packet(context.packet().clone()));
        if !sent {
            context.remove_flags(RequestFlags::ALREADY_SENT);
            debug!("request {} could not be written yet", context.command());
            return Ok(false);
        }

        let result = self.on_packet_send(context);
        if let Err(e) = &result {
            context.notify_failure(&RequestError::Rejected {
                command: context.command(),
                reason: e.to_string(),
            });
        }
        if !context.has_handler() || result.is_err() {
            self.remove_request_context(context);
        }
        result.map(|()| true)
    }

    /// Serial bookkeeping after a request was handed to the writer.
    pub fn on_packet_send(&self, context: &RequestContext) -> Result<(), QueueError> {
        let Some(signal) = self.registry.get(context.command()) else {
            self.remove_expired_serial_contexts();
            return Ok(());
        };

        let mut serials = lock(&self.serial_contexts);
        let existing = serials.iter().any(|serial| {
            serial.entrance_command() == context.command()
                && serial.request_packet_id().is_some()
                && serial.request_packet_id() == context.packet_id()
        });
        if existing {
            debug!("serial context for command {} already exists", context.command());
            return Ok(());
        }

        let serial = signal
            .build(context)
            .map_err(|source| QueueError::SerialContext {
                command: context.command(),
                source,
            })?;
        trace!("built serial context for command {}", context.command());
        serials.push(Arc::from(serial));
        Ok(())
    }

    pub fn remove_request_context(&self, context: &Arc<RequestContext>) {
        self.remove_request_contexts(std::slice::from_ref(context));
    }

    /// Runs each context's removal hook, then stops tracking it.
    pub fn remove_request_contexts(&self, removed: &[Arc<RequestContext>]) {
        if removed.is_empty() {
            return;
        }
        for context in removed {
            context.on_removed();
        }
        lock(&self.contexts).retain(|c| !removed.iter().any(|r| Arc::ptr_eq(c, r)));
    }

    /// Snapshot of the queued contexts matching `filter`, in queue order.
    pub fn get_request_context<F>(&self, filter: F) -> Vec<Arc<RequestContext>>
    where
        F: Fn(&RequestContext) -> bool,
    {
        lock(&self.contexts)
            .iter()
            .filter(|c| filter(c))
            .cloned()
            .collect()
    }

    /// Resolves and removes every context waiting for `packet`.
    pub fn dispatch_packet(&self, packet: &Packet) {
        let command = packet.command();
        let packet_id = packet.packet_id().unwrap_or_default();
        let matched = self.get_request_context(|c| {
            c.command() == command && c.packet_id().unwrap_or_default() == packet_id
        });

        for context in &matched {
            context.notify_success(packet);
        }
        self.remove_request_contexts(&matched);

        let global = lock(&self.global_notify_handler).clone();
        if let Some(handler) = global {
            handler.on_success(command, None, &AttachInfo::new(), packet);
        }
    }

    /// Sends every queued request that has not been written yet.
    pub fn execute_all_request_context(&self) {
        let pending = self.get_request_context(|c| {
            c.has_flags(RequestFlags::IS_REQUEST) && !c.has_flags(RequestFlags::ALREADY_SENT)
        });
        debug!("executing {} pending requests", pending.len());

        for context in &pending {
            if let Err(e) = self.send_request(context) {
                error!("{e}");
            }
        }
    }

    /// Offers `packet` to the live serial contexts. Returns whether ordinary dispatch should
    /// still run.
    pub fn prepare_dispatch_packet(&self, packet: &Packet) -> bool {
        let serials = lock(&self.serial_contexts).clone();
        let Some(serial) = serials
            .into_iter()
            .find(|s| !s.is_expired() && s.should_process(self, packet))
        else {
            return true;
        };

        if serial.process_packet(self, packet).is_some() {
            return true;
        }

        if self.remove_serial_context(&serial) {
            trace!("serial context for command {} completed", serial.entrance_command());
        }
        false
    }

    pub fn set_global_notify_handler(&self, handler: Option<Arc<dyn ResponseHandler>>) {
        *lock(&self.global_notify_handler) = handler;
    }

    pub fn len(&self) -> usize {
        lock(&self.contexts).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.contexts).is_empty()
    }

    pub fn serial_context_count(&self) -> usize {
        lock(&self.serial_contexts).len()
    }

    fn is_connected(&self) -> bool {
        self.sink.upgrade().is_some_and(|sink| sink.is_connected())
    }

    fn arm_timeout(&self, context: &Arc<RequestContext>) -> Result<(), QueueError> {
        let Some(after) = context.timeout() else {
            return Ok(());
        };

        let queue = self.this.clone();
        let expired = Arc::clone(context);
        context
            .arm_timeout(move || {
                let command = expired.command();
                if expired.notify_failure(&RequestError::Timeout { command, after }) {
                    debug!("request {command} timed out");
                }
                if let Some(queue) = queue.upgrade() {
                    queue.remove_request_context(&expired);
                }
            })
            .map_err(QueueError::Timer)
    }

    /// Removes `serial` by identity. Returns false if another caller removed it first.
    fn remove_serial_context(&self, serial: &Arc<dyn SerialContext>) -> bool {
        let mut serials = lock(&self.serial_contexts);
        let before = serials.len();
        serials.retain(|s| !Arc::ptr_eq(s, serial));
        serials.len() != before
    }

    fn remove_expired_serial_contexts(&self) {
        let mut serials = lock(&self.serial_contexts);
        let before = serials.len();
        serials.retain(|s| !s.is_expired());
        let removed = before - serials.len();
        if removed > 0 {
            trace!("removed {removed} expired serial contexts");
        }
    }
}

impl PacketListener for RequestQueue {
    fn process_packet(&self, packet: &Packet) {
        if self.prepare_dispatch_packet(packet) {
            self.dispatch_packet(packet);
        }
    }
}

impl ConnectionListener for RequestQueue {
    fn connected(&self, _: &Connection) {
        self.execute_all_request_context();
    }

    fn connection_closed(&self) {
        debug!("connection closed, {} requests stay queued", self.len());
    }

    fn connection_closed_on_error(&self, error: &ConnectionError) {
        warn!("connection lost ({error}), {} requests stay queued", self.len());
    }

    fn reconnecting_in(&self, seconds: u64) {
        debug!("reconnecting in {seconds}s");
    }
}
