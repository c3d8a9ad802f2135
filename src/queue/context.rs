use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use bitflags::bitflags;
use thiserror::Error;

use crate::{packet::Packet, sync::lock, timer::ScheduledTask};

bitflags! {
    /// Dispatch policy of a [`RequestContext`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestFlags: u32 {
        /// The context carries an outbound request. Required for every queued context.
        const IS_REQUEST = 1 << 0;
        /// The request packet was handed to the writer.
        const ALREADY_SENT = 1 << 1;
        /// Drop every queued context before this one is added.
        const CLEAR_QUEUE = 1 << 2;
        /// Drop this context if one with the same command is already queued.
        const NO_REPEAT = 1 << 3;
        /// Insert at the head of the queue.
        const JUMP_QUEUE = 1 << 4;
        /// Only send while the connection is up; otherwise wait for `connected`.
        const CHECK_CONNECT_STATUS = 1 << 5;
    }
}

/// Caller-supplied key/value pairs handed back with the response.
pub type AttachInfo = HashMap<String, String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("request {command} timed out after {after:?}")]
    Timeout { command: i32, after: Duration },
    #[error("request {command} was rejected: {reason}")]
    Rejected { command: i32, reason: String },
}

/// Receives the outcome of a request.
pub trait ResponseHandler: Send + Sync {
    fn on_success(&self, command: i32, params: Option<&str>, attach: &AttachInfo, packet: &Packet);

    fn on_failure(&self, command: i32, error: &RequestError);
}

/// One in-flight request.
///
/// Contexts are shared as `Arc<RequestContext>`; the queue compares them by identity. A
/// context resolves at most once: whichever of response, timeout or failure comes first is
/// delivered and later ones are ignored.
pub struct RequestContext {
    packet: Packet,
    flags: AtomicU32,
    handler: Option<Arc<dyn ResponseHandler>>,
    attach: AttachInfo,
    timeout: Option<Duration>,
    timer: Mutex<Option<ScheduledTask>>,
    resolved: AtomicBool,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("command", &self.command())
            .field("packet_id", &self.packet_id())
            .field("flags", &self.flags())
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl RequestContext {
    pub fn new(packet: Packet, flags: RequestFlags) -> Self {
        Self {
            packet,
            flags: AtomicU32::new(flags.bits()),
            handler: None,
            attach: AttachInfo::new(),
            timeout: None,
            timer: Mutex::new(None),
            resolved: AtomicBool::new(false),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn ResponseHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_attach(mut self, attach: AttachInfo) -> Self {
        self.attach = attach;
        self
    }

    /// Fails the request with [`RequestError::Timeout`] if no response arrives in time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command(&self) -> i32 {
        self.packet.command()
    }

    pub fn packet_id(&self) -> Option<&str> {
        self.packet.packet_id()
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn flags(&self) -> RequestFlags {
        RequestFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn has_flags(&self, flags: RequestFlags) -> bool {
        self.flags().contains(flags)
    }

    pub fn insert_flags(&self, flags: RequestFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove_flags(&self, flags: RequestFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Sets `ALREADY_SENT`, returning false if it was already set.
    pub(crate) fn claim_send(&self) -> bool {
        let previous = self
            .flags
            .fetch_or(RequestFlags::ALREADY_SENT.bits(), Ordering::AcqRel);
        previous & RequestFlags::ALREADY_SENT.bits() == 0
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn attach_info(&self) -> &AttachInfo {
        &self.attach
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Starts the timeout timer; `on_timeout` runs unless the context is removed first.
    pub(crate) fn arm_timeout<F>(&self, on_timeout: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(timeout) = self.timeout else {
            return Ok(());
        };

        let task = ScheduledTask::once("request-timeout", timeout, on_timeout)?;
        if let Some(previous) = lock(&self.timer).replace(task) {
            previous.cancel();
        }
        Ok(())
    }

    /// Removal hook: cancels the timeout timer.
    pub fn on_removed(&self) {
        if let Some(task) = lock(&self.timer).take() {
            task.cancel();
        }
    }

    /// Delivers `packet` to the handler. Returns false if the context was already resolved.
    pub fn notify_success(&self, packet: &Packet) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(handler) = &self.handler {
            handler.on_success(packet.command(), None, &self.attach, packet);
        }
        true
    }

    /// Delivers `error` to the handler. Returns false if the context was already resolved.
    pub fn notify_failure(&self, error: &RequestError) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(handler) = &self.handler {
            handler.on_failure(self.command(), error);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        successes: Mutex<Vec<(i32, AttachInfo)>>,
        failures: Mutex<Vec<RequestError>>,
    }

    impl ResponseHandler for Counter {
        fn on_success(&self, command: i32, _: Option<&str>, attach: &AttachInfo, _: &Packet) {
            self.successes.lock().unwrap().push((command, attach.clone()));
        }

        fn on_failure(&self, _: i32, error: &RequestError) {
            self.failures.lock().unwrap().push(error.clone());
        }
    }

    #[test]
    fn flags_update_atomically() {
        let ctx = RequestContext::new(Packet::new(1, None, Vec::new()), RequestFlags::IS_REQUEST);

        assert!(ctx.has_flags(RequestFlags::IS_REQUEST));
        assert!(ctx.claim_send());
        assert!(!ctx.claim_send());
        assert!(ctx.has_flags(RequestFlags::IS_REQUEST | RequestFlags::ALREADY_SENT));

        ctx.remove_flags(RequestFlags::ALREADY_SENT);
        assert_eq!(ctx.flags(), RequestFlags::IS_REQUEST);
    }

    #[test]
    fn resolves_only_once() {
        let handler = Arc::new(Counter::default());
        let mut attach = AttachInfo::new();
        attach.insert("page".into(), "home".into());
        let ctx = RequestContext::new(Packet::new(3, Some("a".into()), Vec::new()), RequestFlags::IS_REQUEST)
            .with_handler(handler.clone())
            .with_attach(attach.clone());

        assert!(ctx.notify_success(&Packet::new(3, Some("a".into()), Vec::new())));
        assert!(!ctx.notify_failure(&RequestError::Timeout {
            command: 3,
            after: Duration::ZERO
        }));
        assert!(ctx.is_resolved());

        assert_eq!(handler.successes.lock().unwrap().as_slice(), [(3, attach)]);
        assert!(handler.failures.lock().unwrap().is_empty());
    }

    #[test]
    fn removal_cancels_the_timer() {
        let handler = Arc::new(Counter::default());
        let ctx = Arc::new(
            RequestContext::new(Packet::new(3, None, Vec::new()), RequestFlags::IS_REQUEST)
                .with_handler(handler.clone())
                .with_timeout(Duration::from_millis(30)),
        );

        let fired = Arc::clone(&ctx);
        ctx.arm_timeout(move || {
            fired.notify_failure(&RequestError::Timeout {
                command: 3,
                after: Duration::from_millis(30),
            });
        })
        .unwrap();
        ctx.on_removed();

        std::thread::sleep(Duration::from_millis(100));
        assert!(!ctx.is_resolved());
        assert!(handler.failures.lock().unwrap().is_empty());
    }
}
