use std::{error::Error, net::SocketAddr, sync::Arc};

use clap::Parser;
use log::info;
use tether::{BincodePacketFactory, EchoServer, server::DEFAULT_WORKERS};

#[derive(Debug, Parser)]
#[command(version, about = "Echo server speaking the bundled tether codec", long_about = None)]
struct Cli {
    /// Listen for new connection at address
    address: SocketAddr,
    /// Connections served concurrently
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = EchoServer::with_workers(cli.address, Arc::new(BincodePacketFactory::new()), cli.workers)?;

    ctrlc::set_handler(|| {
        info!("shutting down");
        std::process::exit(0);
    })?;

    server.listen()?;
    Ok(())
}
