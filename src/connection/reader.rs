//! Receive loop: decodes inbound packets on a dedicated thread.
use std::{
    io::{self, ErrorKind, Read},
    sync::{Arc, Mutex, Weak},
    thread,
};

use log::{debug, trace, warn};

use crate::{
    packet::{CodecError, Packet, PacketFactory},
    sync::lock,
};

use super::is_network_fatal;

/// Consecutive non-fatal read errors tolerated before the socket is given up.
pub(crate) const MAX_CONSECUTIVE_READ_ERRORS: u32 = 8;

pub(crate) trait ReaderEvents: Send + Sync {
    fn on_packet_received(&self, packet: Packet);

    /// A read failed; the reader keeps going unless the error is network-fatal.
    fn on_read_error(&self, error: io::Error);

    /// The reader stopped after too many consecutive errors and the socket is unusable.
    fn on_read_failed(&self, error: io::Error);
}

pub(crate) type PacketSource = Box<dyn Read + Send>;

#[derive(Default)]
struct ReaderState {
    source: Option<PacketSource>,
    done: bool,
    generation: u64,
}

struct ReaderShared {
    factory: Arc<dyn PacketFactory>,
    events: Weak<dyn ReaderEvents>,
    state: Mutex<ReaderState>,
}

impl ReaderShared {
    fn is_active(&self, generation: u64) -> bool {
        let state = lock(&self.state);
        !state.done && state.generation == generation
    }
}

pub(crate) struct PacketReader {
    shared: Arc<ReaderShared>,
}

impl PacketReader {
    pub(crate) fn new(factory: Arc<dyn PacketFactory>, events: Weak<dyn ReaderEvents>) -> Self {
        Self {
            shared: Arc::new(ReaderShared {
                factory,
                events,
                state: Mutex::new(ReaderState::default()),
            }),
        }
    }

    pub(crate) fn init(&self, source: PacketSource) {
        let mut state = lock(&self.shared.state);
        state.generation += 1;
        state.done = false;
        state.source = Some(source);
    }

    /// Spawns the receive thread for the source bound by the last `init`.
    pub(crate) fn startup(&self) -> io::Result<()> {
        let mut state = lock(&self.shared.state);
        state.done = false;
        let Some(source) = state.source.take() else {
            return Ok(());
        };

        let generation = state.generation;
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("packet-reader".into())
            .spawn(move || read_packets(shared, source, generation))?;
        Ok(())
    }

    /// Marks the reader as stopped. The blocked read returns once the socket is closed.
    pub(crate) fn shutdown(&self) {
        let mut state = lock(&self.shared.state);
        state.done = true;
        state.source = None;
    }
}

fn read_packets(shared: Arc<ReaderShared>, mut source: PacketSource, generation: u64) {
    debug!("packet reader generation {generation} started");
    let mut failures = 0;

    while shared.is_active(generation) {
        match shared.factory.decode(&mut source) {
            Ok(packet) => {
                failures = 0;
                if !shared.is_active(generation) {
                    break;
                }
                trace!("read packet command={}", packet.command());
                if let Some(events) = shared.events.upgrade() {
                    events.on_packet_received(packet);
                }
            }
            Err(CodecError::Io(e)) => {
                if !shared.is_active(generation) {
                    debug!("read failed during shutdown: {e}");
                    break;
                }
                let Some(events) = shared.events.upgrade() else {
                    break;
                };

                if is_network_fatal(&e) {
                    events.on_read_error(e);
                    break;
                }
                failures += 1;
                if failures >= MAX_CONSECUTIVE_READ_ERRORS {
                    events.on_read_failed(e);
                    break;
                }
                if e.kind() != ErrorKind::Interrupted {
                    events.on_read_error(e);
                }
            }
            Err(e) => {
                failures = 0;
                warn!("skipping malformed packet: {e}");
            }
        }
    }

    debug!("packet reader generation {generation} stopped");
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, time::Duration};

    use crate::packet::{BincodePacketFactory, MAX_FRAME_SIZE};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        packets: Mutex<Vec<Packet>>,
        errors: Mutex<Vec<ErrorKind>>,
        failed: Mutex<Vec<ErrorKind>>,
    }

    impl ReaderEvents for Recorder {
        fn on_packet_received(&self, packet: Packet) {
            self.packets.lock().unwrap().push(packet);
        }

        fn on_read_error(&self, error: io::Error) {
            self.errors.lock().unwrap().push(error.kind());
        }

        fn on_read_failed(&self, error: io::Error) {
            self.failed.lock().unwrap().push(error.kind());
        }
    }

    /// Fails with `ErrorKind::Other` for the first `failures` reads, then reads `inner`.
    struct Flaky {
        failures: usize,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::other("transient"));
            }
            self.inner.read(buf)
        }
    }

    fn start(factory: Arc<BincodePacketFactory>, source: PacketSource) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let reader = PacketReader::new(factory, Arc::downgrade(&recorder) as Weak<dyn ReaderEvents>);
        reader.init(source);
        reader.startup().unwrap();
        recorder
    }

    fn wait_until(done: impl Fn() -> bool) {
        for _ in 0..300 {
            if done() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn transient_error_does_not_stop_the_reader() {
        let factory = Arc::new(BincodePacketFactory::new());
        let wire = factory.encode(&Packet::new(4, None, Vec::new())).unwrap();

        let recorder = start(
            Arc::clone(&factory),
            Box::new(Flaky {
                failures: 1,
                inner: Cursor::new(wire),
            }),
        );
        wait_until(|| recorder.errors.lock().unwrap().len() >= 2);

        let commands: Vec<_> = recorder.packets.lock().unwrap().iter().map(Packet::command).collect();
        assert_eq!(commands, [4]);
        assert_eq!(
            recorder.errors.lock().unwrap().as_slice(),
            [ErrorKind::Other, ErrorKind::UnexpectedEof]
        );
        assert!(recorder.failed.lock().unwrap().is_empty());
    }

    #[test]
    fn repeated_errors_give_up_on_the_socket() {
        let factory = Arc::new(BincodePacketFactory::new());
        let recorder = start(
            factory,
            Box::new(Flaky {
                failures: usize::MAX,
                inner: Cursor::new(Vec::new()),
            }),
        );
        wait_until(|| !recorder.failed.lock().unwrap().is_empty());

        assert_eq!(recorder.failed.lock().unwrap().as_slice(), [ErrorKind::Other]);
        assert_eq!(
            recorder.errors.lock().unwrap().len(),
            MAX_CONSECUTIVE_READ_ERRORS as usize - 1
        );
    }

    #[test]
    fn oversized_frame_does_not_desync_the_stream() {
        let factory = Arc::new(BincodePacketFactory::new());
        let mut wire = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        wire.resize(wire.len() + MAX_FRAME_SIZE + 1, 0xFF);
        wire.extend(factory.encode(&Packet::new(4, None, Vec::new())).unwrap());

        let recorder = start(Arc::clone(&factory), Box::new(Cursor::new(wire)));
        wait_until(|| !recorder.errors.lock().unwrap().is_empty());

        let commands: Vec<_> = recorder.packets.lock().unwrap().iter().map(Packet::command).collect();
        assert_eq!(commands, [4]);
        assert_eq!(recorder.errors.lock().unwrap().as_slice(), [ErrorKind::UnexpectedEof]);
    }

    #[test]
    fn decodes_until_end_of_stream() {
        let factory = Arc::new(BincodePacketFactory::new());
        let mut wire = Vec::new();
        for command in [4, 5] {
            wire.extend(factory.encode(&Packet::new(command, None, Vec::new())).unwrap());
        }

        let recorder = Arc::new(Recorder::default());
        let reader = PacketReader::new(factory, Arc::downgrade(&recorder) as Weak<dyn ReaderEvents>);
        reader.init(Box::new(Cursor::new(wire)));
        reader.startup().unwrap();

        for _ in 0..200 {
            if !recorder.errors.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        let commands: Vec<_> = recorder.packets.lock().unwrap().iter().map(Packet::command).collect();
        assert_eq!(commands, [4, 5]);
        assert_eq!(recorder.errors.lock().unwrap().as_slice(), [ErrorKind::UnexpectedEof]);
    }

    #[test]
    fn startup_without_source_is_a_no_op() {
        let recorder = Arc::new(Recorder::default());
        let reader = PacketReader::new(
            Arc::new(BincodePacketFactory::new()),
            Arc::downgrade(&recorder) as Weak<dyn ReaderEvents>,
        );

        reader.startup().unwrap();
        reader.shutdown();
        assert!(recorder.packets.lock().unwrap().is_empty());
    }
}
