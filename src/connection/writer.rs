//! Single-writer send pipeline.
//!
//! Callers hand packets to [`PacketWriter::send_packet`], which appends them to a bounded
//! FIFO. One dedicated thread drains the FIFO, encodes each packet with the connection's
//! [`PacketFactory`] and writes it to the socket, so packets hit the wire in exactly the
//! order they were queued. When the FIFO is full, `send_packet` blocks until the writer
//! thread frees a slot.
//!
//! After a reconnect the writer is rebound to the new socket with [`PacketWriter::init`].
//! Each `init` starts a new generation; a thread from an older generation notices and exits
//! at its next check, and [`PacketWriter::startup`] spawns a replacement.
use std::{
    collections::VecDeque,
    io::{self, Write},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    thread,
};

use log::{debug, trace, warn};

use crate::{
    packet::{CodecError, Packet, PacketFactory},
    sync::lock,
};

pub const DEFAULT_WRITER_CAPACITY: usize = 500;

/// Receives the outcome of every write attempt.
pub(crate) trait WriterEvents: Send + Sync {
    fn on_send_successful(&self, packet: &Packet);
    fn on_write_error(&self, error: io::Error);
}

pub(crate) type ByteSink = Box<dyn Write + Send>;

#[derive(Debug, Default)]
struct WriterQueue {
    packets: VecDeque<Packet>,
    done: bool,
    generation: u64,
    running: Option<u64>,
}

struct WriterShared {
    factory: Arc<dyn PacketFactory>,
    events: Weak<dyn WriterEvents>,
    capacity: usize,
    queue: Mutex<WriterQueue>,
    sink: Mutex<Option<ByteSink>>,
    not_empty: Condvar,
    not_full: Condvar,
}

pub(crate) struct PacketWriter {
    shared: Arc<WriterShared>,
}

fn wait<'a>(condvar: &Condvar, guard: MutexGuard<'a, WriterQueue>) -> MutexGuard<'a, WriterQueue> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

impl PacketWriter {
    pub(crate) fn new(
        factory: Arc<dyn PacketFactory>,
        events: Weak<dyn WriterEvents>,
        capacity: usize,
    ) -> Self {
        assert!(capacity > 0);

        Self {
            shared: Arc::new(WriterShared {
                factory,
                events,
                capacity,
                queue: Mutex::new(WriterQueue::default()),
                sink: Mutex::new(None),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    /// Binds the writer to a fresh sink and retires any thread bound to the previous one.
    pub(crate) fn init(&self, sink: ByteSink) {
        *lock(&self.shared.sink) = Some(sink);

        let mut queue = lock(&self.shared.queue);
        queue.generation += 1;
        queue.done = false;
        self.shared.not_empty.notify_all();
        trace!("packet writer bound, generation {}", queue.generation);
    }

    /// Starts the writer thread for the current generation. No-op if it is already running.
    pub(crate) fn startup(&self) -> io::Result<()> {
        let mut queue = lock(&self.shared.queue);
        queue.done = false;
        if queue.running == Some(queue.generation) {
            return Ok(());
        }

        let generation = queue.generation;
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("packet-writer".into())
            .spawn(move || write_packets(shared, generation))?;
        queue.running = Some(generation);
        Ok(())
    }

    /// Stops the writer thread and releases producers blocked on a full queue.
    pub(crate) fn shutdown(&self) {
        let mut queue = lock(&self.shared.queue);
        queue.done = true;
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    /// Queues `packet`, blocking while the queue is full. Returns false once shut down.
    pub(crate) fn send_packet(&self, packet: Packet) -> bool {
        let mut queue = lock(&self.shared.queue);
        while !queue.done && queue.packets.len() >= self.shared.capacity {
            queue = wait(&self.shared.not_full, queue);
        }
        if queue.done {
            return false;
        }

        queue.packets.push_back(packet);
        self.shared.not_empty.notify_one();
        true
    }

    /// Queues `packet` only if there is room right now.
    pub(crate) fn try_send_packet(&self, packet: Packet) -> bool {
        let mut queue = lock(&self.shared.queue);
        if queue.done || queue.packets.len() >= self.shared.capacity {
            return false;
        }

        queue.packets.push_back(packet);
        self.shared.not_empty.notify_one();
        true
    }

    /// Drops every queued packet that has not been written yet.
    pub(crate) fn clear(&self) -> usize {
        let mut queue = lock(&self.shared.queue);
        let dropped = queue.packets.len();
        queue.packets.clear();
        self.shared.not_full.notify_all();
        dropped
    }

    pub(crate) fn pending(&self) -> usize {
        lock(&self.shared.queue).packets.len()
    }

    #[cfg(test)]
    pub(crate) fn is_done(&self) -> bool {
        lock(&self.shared.queue).done
    }
}

impl WriterShared {
    fn next_packet(&self, generation: u64) -> Option<Packet> {
        let mut queue = lock(&self.queue);
        loop {
            if queue.done || queue.generation != generation {
                return None;
            }
            if let Some(packet) = queue.packets.pop_front() {
                self.not_full.notify_one();
                return Some(packet);
            }
            queue = wait(&self.not_empty, queue);
        }
    }

    fn write(&self, packet: &Packet) -> Result<(), CodecError> {
        let bytes = self.factory.encode(packet)?;

        let mut sink = lock(&self.sink);
        let sink = sink
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        sink.write_all(&bytes)?;
        sink.flush()?;
        Ok(())
    }

    fn is_done(&self) -> bool {
        lock(&self.queue).done
    }
}

fn write_packets(shared: Arc<WriterShared>, generation: u64) {
    debug!("packet writer generation {generation} started");

    while let Some(packet) = shared.next_packet(generation) {
        match shared.write(&packet) {
            Ok(()) => {
                trace!("wrote packet command={}", packet.command());
                if let Some(events) = shared.events.upgrade() {
                    events.on_send_successful(&packet);
                }
            }
            Err(CodecError::Io(e)) => {
                if shared.is_done() {
                    debug!("write failed during shutdown: {e}");
                } else if let Some(events) = shared.events.upgrade() {
                    events.on_write_error(e);
                }
            }
            Err(e) => warn!("dropping packet command={}: {e}", packet.command()),
        }
    }

    let mut queue = lock(&shared.queue);
    if queue.running == Some(generation) {
        queue.running = None;
    }
    debug!("packet writer generation {generation} stopped");
}
