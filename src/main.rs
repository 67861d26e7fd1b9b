//! nixie-link
//!
//! Console front end for the Nixie clock link.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use nixie_link::domain::commands::OutgoingCommand;
use nixie_link::domain::models::{LinkEvent, LinkStatus, RemoteDevice};
use nixie_link::domain::settings::SettingsService;
use nixie_link::infrastructure::bluetooth::{
    ConnectionManager, LinkConfig, RfcommAdapter, TcpAdapter,
};
use nixie_link::infrastructure::logging;
use nixie_link::presentation::console::{ConsoleCommand, HELP};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Bluetooth serial link to a Nixie clock.
#[derive(Parser, Debug)]
#[command(name = "nixie-link")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to settings file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Socket backend
    #[arg(long, global = true, value_enum)]
    backend: Option<Backend>,

    /// Listen address for the TCP backend (overrides settings)
    #[arg(long, global = true, value_name = "ADDR")]
    tcp_bind: Option<String>,

    /// Treat links as verified without the challenge exchange
    #[arg(long, global = true)]
    skip_handshake: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Wait for the clock to connect (default)
    Listen,

    /// Dial a paired clock
    Connect {
        /// Bluetooth address (or host:port with the TCP backend); defaults to the last device
        address: Option<String>,

        /// Display name to remember for the device
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Windows Bluetooth RFCOMM
    Rfcomm,
    /// TCP bridge or emulator
    Tcp,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(windows) {
            Self::Rfcomm
        } else {
            Self::Tcp
        }
    }
}

fn make_adapter(backend: Backend, tcp_bind: String) -> anyhow::Result<Arc<dyn RfcommAdapter>> {
    match backend {
        Backend::Tcp => Ok(Arc::new(TcpAdapter::new(tcp_bind))),
        #[cfg(windows)]
        Backend::Rfcomm => Ok(Arc::new(nixie_link::infrastructure::bluetooth::WinRtAdapter::new())),
        #[cfg(not(windows))]
        Backend::Rfcomm => anyhow::bail!("the RFCOMM backend needs Windows; use --backend tcp"),
    }
}

struct Console {
    manager: ConnectionManager,
    settings: SettingsService,
    service_uuid: Uuid,
}

impl Console {
    async fn handle(&mut self, command: ConsoleCommand) -> anyhow::Result<ControlFlow<()>> {
        match command {
            ConsoleCommand::Send(command) => self.send(command).await,
            ConsoleCommand::SyncClock => {
                let offset = self.settings.get().utc_offset_minutes;
                self.send(OutgoingCommand::time_from_clock(SystemTime::now(), offset))
                    .await
            }
            ConsoleCommand::Connect(device) => self.connect(device).await?,
            ConsoleCommand::Listen => self.manager.start_listening().await?,
            ConsoleCommand::Disconnect => self.manager.disconnect().await?,
            ConsoleCommand::Status => print_status(&self.manager.status().await?),
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => return Ok(ControlFlow::Break(())),
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn send(&self, command: OutgoingCommand) {
        match self.manager.write(&command).await {
            Ok(()) => info!("Sent {}", command),
            Err(e) => warn!("Could not send {}: {}", command, e),
        }
    }

    async fn connect(&mut self, device: RemoteDevice) -> anyhow::Result<()> {
        if let Err(e) = self.settings.remember_device(device.clone()) {
            warn!("Could not save last device: {}", e);
        }
        self.manager.connect_to(device, self.service_uuid).await?;
        Ok(())
    }
}

fn print_status(status: &LinkStatus) {
    let session = match (&status.session, &status.peer) {
        (Some(role), Some(peer)) => format!("{} session with {}", role, peer),
        (Some(role), None) => format!("{} session", role),
        _ => "no session".to_string(),
    };
    let establishing = status
        .establishing
        .map(|role| format!(", {} running", role))
        .unwrap_or_default();
    println!(
        "{}{} (handshake {:?}, connected: {})",
        session,
        establishing,
        status.handshake,
        status.is_connected()
    );
}

fn report(event: &LinkEvent) {
    match event {
        LinkEvent::Listening => info!("Waiting for the clock to connect"),
        LinkEvent::ListenFailed { reason } => error!("Listener failed: {}", reason),
        LinkEvent::SessionOpened { role, peer } => match peer {
            Some(peer) => info!("Link open ({}) with {}", role, peer),
            None => info!("Link open ({})", role),
        },
        LinkEvent::Connected => info!("Clock connected"),
        LinkEvent::Disconnected => info!("Clock disconnected"),
        LinkEvent::HandshakeFailedRetrying { attempt } => {
            warn!("Clock rejected handshake, retry {}", attempt)
        }
        LinkEvent::HandshakeError { attempts } => {
            error!("Handshake failed after {} attempts", attempts)
        }
        LinkEvent::ConnectFailed { device, reason } => {
            error!("Could not connect to {}: {}", device, reason)
        }
        LinkEvent::UnknownFrame(frame) => warn!("Unexpected frame before verification: {:?}", frame),
        LinkEvent::IncomingMessage(frame) => println!("< {}", frame),
    }
}

async fn run(mut console: Console, mut events: mpsc::UnboundedReceiver<LinkEvent>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => report(&event),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line.context("reading stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match line.parse::<ConsoleCommand>() {
                    Ok(command) => {
                        if console.handle(command).await?.is_break() {
                            break;
                        }
                    }
                    Err(e) => println!("{} (type 'help')", e),
                },
                None => {
                    // keep serving the link until interrupted
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    console.manager.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => SettingsService::with_path(path.clone()),
        None => SettingsService::new()?,
    };
    if cli.verbose {
        settings.get_mut().log_settings.level = "debug".to_string();
    }
    if cli.skip_handshake {
        settings.get_mut().skip_handshake = true;
    }

    let _logging_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Settings: {}", settings.path().display());

    let tcp_bind = cli
        .tcp_bind
        .clone()
        .unwrap_or_else(|| settings.get().tcp_listen_addr.clone());
    let adapter = make_adapter(cli.backend.unwrap_or_default(), tcp_bind)?;

    let config = LinkConfig::from_settings(settings.get())?;
    let service_uuid = config.service.uuid;
    let (manager, events) = ConnectionManager::spawn(adapter, config);

    let mut console = Console {
        manager,
        settings,
        service_uuid,
    };

    match cli.command.unwrap_or(Commands::Listen) {
        Commands::Listen => console.manager.start_listening().await?,
        Commands::Connect { address, name } => {
            let device = match address {
                Some(address) => RemoteDevice::new(address, name.unwrap_or_default()),
                None => console
                    .settings
                    .get()
                    .last_device
                    .clone()
                    .context("no ADDRESS given and no remembered device")?,
            };
            console.connect(device).await?;
        }
    }

    println!("type 'help' for commands");
    run(console, events).await
}
