use std::{
    error::Error,
    io::{self, Write},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use tether::{
    AttachInfo, BincodePacketFactory, Client, Command, Configuration, Packet, RequestError,
    ResponseHandler, prompt, queue::serial::SerialRegistry,
};

#[derive(Parser)]
#[command(version, about = "Interactive client for a tether server", long_about = None)]
struct Cli {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Server port
    port: u16,
    /// Seconds to wait for a response, 0 disables the timeout
    #[arg(long, default_value_t = 30)]
    timeout: u64,
    /// Seconds between heartbeats
    #[arg(long, default_value_t = 30)]
    heartbeat: u64,
}

/// Prints responses and pushed packets as they arrive.
struct Printer;

impl ResponseHandler for Printer {
    fn on_success(&self, command: i32, _: Option<&str>, _: &AttachInfo, packet: &Packet) {
        println!("\n[{command}] {}", packet.body_str());
    }

    fn on_failure(&self, command: i32, error: &RequestError) {
        eprintln!("\n[{command}] error: {error}");
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let timeout = (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout));
    let config = Configuration::builder()
        .host(cli.host)
        .port(cli.port)
        .heartbeat(Duration::from_secs(cli.heartbeat))
        .request_timeout(timeout)
        .build()?;

    let client = Arc::new(Client::new(
        config,
        Arc::new(BincodePacketFactory::new()),
        SerialRegistry::default(),
    ));
    client.connect_and_start_watch()?;

    let handle = Arc::clone(&client);
    ctrlc::set_handler(move || {
        handle.disconnect();
        std::process::exit(0);
    })?;

    let printer: Arc<dyn ResponseHandler> = Arc::new(Printer);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        let cmd = match prompt(stdin.lock(), &mut stdout) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => break,
            Command::Request { command, body } => {
                if let Err(e) = client.request(
                    command,
                    body.as_bytes(),
                    AttachInfo::new(),
                    Arc::clone(&printer),
                ) {
                    eprintln!("request error: {e}");
                }
            }
            Command::Subscribe(command) => {
                client.subscribe(command, Arc::clone(&printer));
            }
            Command::Unsubscribe(command) => {
                client.unsubscribe(command, &printer);
            }
        }
        stdout.flush()?;
    }

    client.disconnect();
    Ok(())
}
