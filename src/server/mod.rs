//! Loopback echo server.
//!
//! [`EchoServer`] speaks the wire format of a [`PacketFactory`] and writes every packet it
//! receives straight back to the sender, heartbeats excepted. It exists to exercise the
//! client runtime by hand (`tether_echo`) and in tests.
mod thread;

use std::{
    io::{self, BufReader, BufWriter, ErrorKind, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
};

use log::{debug, info, trace, warn};

use crate::packet::{CodecError, HEARTBEAT_COMMAND, PacketFactory};

use thread::ThreadPool;

/// Connections served concurrently; later ones wait for a free worker.
pub const DEFAULT_WORKERS: usize = 15;

pub struct EchoServer {
    listener: TcpListener,
    factory: Arc<dyn PacketFactory>,
    pool: ThreadPool,
}

impl EchoServer {
    pub fn bind(address: SocketAddr, factory: Arc<dyn PacketFactory>) -> io::Result<Self> {
        Self::with_workers(address, factory, DEFAULT_WORKERS)
    }

    pub fn with_workers(
        address: SocketAddr,
        factory: Arc<dyn PacketFactory>,
        workers: usize,
    ) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(address)?,
            factory,
            pool: ThreadPool::new(workers),
        })
    }

    /// Address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the listener fails.
    pub fn listen(self) -> io::Result<()> {
        info!("listening at {}", self.local_addr()?);

        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let factory = Arc::clone(&self.factory);
                    let accepted = self.pool.execute(move || {
                        if let Err(e) = handle_connection(stream, factory) {
                            warn!("echo connection failed: {e}");
                        }
                    });
                    if !accepted {
                        warn!("no worker available, dropping connection");
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(stream: TcpStream, factory: Arc<dyn PacketFactory>) -> Result<(), CodecError> {
    let peer = stream.peer_addr()?;
    info!("accepted {peer}");

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    loop {
        let packet = match factory.decode(&mut reader) {
            Ok(packet) => packet,
            Err(CodecError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                info!("{peer} disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if factory.support_heart_beat() && packet.command() == HEARTBEAT_COMMAND {
            trace!("heartbeat from {peer}");
            continue;
        }

        debug!("echoing command={} id={:?}", packet.command(), packet.packet_id());
        writer.write_all(&factory.encode(&packet)?)?;
        writer.flush()?;
    }
}
