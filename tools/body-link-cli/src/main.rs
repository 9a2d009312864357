//! body-link - run discovery and the Data Source service from a terminal.

use std::fs;
use std::io::{self, BufRead};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use log::{info, warn};

use body_link::discovery::Listener;
use body_link::frame::SceneFrame;
use body_link::service::{
    HttpStatusProbe, StreamingSubsystem, SystemControl, TrackingServiceStore,
};
use body_link::{
    find_data_sources, find_tracking_service, Collaborators, Command, CommandQueue, CommandType,
    DataSourceListener, DiscoverySettings, Error, FileConfigStore, LocalIdentity, Result,
    ServiceCommandHandler, ServiceHandle, ServiceStatus, TrackingServiceListener, TrackingSessionConfig,
};

#[derive(Parser)]
#[command(name = "body-link", version, about = "Body-tracking discovery and service tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer discovery queries until interrupted
    Listen(ListenArgs),

    /// Look for a Tracking Service and print the first one that answers
    FindTrackingService(FindArgs),

    /// Collect every Data Source that answers within the window
    FindDataSources(FindArgs),

    /// Run a Data Source process, reading commands from stdin
    DataSource {
        /// TOML configuration file (created with defaults when missing)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Decode a binary scene frame and print it
    FrameDump {
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    TrackingService,
    DataSource,
}

#[derive(clap::Args)]
struct ListenArgs {
    /// Role to advertise
    #[arg(short, long, value_enum)]
    role: RoleArg,

    /// Identifier to advertise
    #[arg(long, default_value = "body-link")]
    id: String,

    #[arg(long, default_value_t = 9000)]
    data_port: u16,

    #[arg(long, default_value_t = 9001)]
    control_port: u16,

    /// Advertised host (first non-loopback IPv4 address when omitted)
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long, default_value = "N/A")]
    license: String,

    #[command(flatten)]
    network: NetworkArgs,
}

#[derive(clap::Args)]
struct FindArgs {
    /// Overall search window in milliseconds
    #[arg(short, long, default_value_t = 10_000)]
    duration_ms: u64,

    /// Interval between queries in milliseconds
    #[arg(short, long, default_value_t = 5_000)]
    polling_ms: u64,

    #[command(flatten)]
    network: NetworkArgs,
}

#[derive(clap::Args)]
struct NetworkArgs {
    /// Query target (a multicast group, or a unicast address for testing)
    #[arg(long, default_value_t = body_link::DEFAULT_MULTICAST_ADDRESS)]
    group: Ipv4Addr,

    #[arg(long, default_value_t = body_link::DEFAULT_MULTICAST_PORT)]
    group_port: u16,

    /// Local port; 0 picks an ephemeral one
    #[arg(long)]
    local_port: Option<u16>,

    /// Log foreign and loopback packets at debug level
    #[arg(long)]
    log_loopback: bool,
}

impl NetworkArgs {
    fn apply(&self, settings: DiscoverySettings) -> DiscoverySettings {
        let local_port = self.local_port.unwrap_or(settings.local_port);
        settings
            .with_local(settings.local_address, local_port)
            .with_multicast(self.group, self.group_port)
            .with_log_loopback(self.log_loopback)
    }
}

/// Streaming stand-in that only logs; the data plane lives elsewhere.
struct LoggingStreaming;

impl StreamingSubsystem for LoggingStreaming {
    fn start(&self, config: &TrackingSessionConfig) -> bool {
        info!("streaming: start session {}", config.session_id);
        true
    }

    fn stop(&self) {
        info!("streaming: stop");
    }
}

/// Reboot requests end the process; the supervisor restarts it.
struct ExitOnReboot {
    running: Arc<AtomicBool>,
}

impl SystemControl for ExitOnReboot {
    fn reboot(&self) {
        warn!("reboot requested, shutting down");
        self.running.store(false, Ordering::SeqCst);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Listen(args) => run_listener(args),
        Commands::FindTrackingService(args) => {
            let settings = find_settings(&args, DiscoverySettings::for_data_source());
            match find_tracking_service(settings)? {
                Some(device) => println!("{}", device),
                None => println!("no tracking service found"),
            }
            Ok(())
        }
        Commands::FindDataSources(args) => {
            let settings = find_settings(&args, DiscoverySettings::for_tracking_service());
            let devices = find_data_sources(settings)?;
            println!("{} data source(s)", devices.len());
            for device in devices {
                println!("  {}", device);
            }
            Ok(())
        }
        Commands::DataSource { config } => run_data_source(config),
        Commands::FrameDump { file } => {
            let bytes = fs::read(&file)
                .map_err(|e| Error::context(format!("reading {}", file.display()), e))?;
            let frame = SceneFrame::decode(&bytes)?;
            println!("{:#?}", frame);
            Ok(())
        }
    }
}

fn find_settings(args: &FindArgs, base: DiscoverySettings) -> DiscoverySettings {
    args.network
        .apply(base)
        .with_duration(Duration::from_millis(args.duration_ms))
        .with_polling_interval(Duration::from_millis(args.polling_ms))
}

fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| Error::context("installing Ctrl-C handler", e))?;
    Ok(running)
}

fn run_listener(args: ListenArgs) -> Result<()> {
    let mut identity =
        LocalIdentity::new(args.id, args.data_port, args.control_port).with_license_id(args.license);
    if let Some(endpoint) = args.endpoint {
        identity = identity.with_endpoint(endpoint);
    }

    let running = interrupt_flag()?;
    match args.role {
        RoleArg::TrackingService => {
            let settings = args.network.apply(DiscoverySettings::for_tracking_service());
            let mut listener = TrackingServiceListener::new(settings, identity);
            serve(&mut listener, &running)
        }
        RoleArg::DataSource => {
            let settings = args.network.apply(DiscoverySettings::for_data_source());
            let mut listener = DataSourceListener::new(settings, identity);
            serve(&mut listener, &running)
        }
    }
}

fn serve<R: body_link::discovery::Role>(
    listener: &mut Listener<R>,
    running: &AtomicBool,
) -> Result<()> {
    let addr = listener
        .start()
        .map_err(|e| Error::context("starting listener", e))?;
    info!("Answering {} queries on {}", R::NAME, addr);
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
    listener.stop();
    info!("Sent {} replies", listener.replies_sent());
    Ok(())
}

fn run_data_source(path: PathBuf) -> Result<()> {
    let store = Arc::new(FileConfigStore::open(&path)?);
    let config = store.config();
    let running = interrupt_flag()?;

    let probe = HttpStatusProbe::new(Duration::from_secs(2))?;
    let collaborators = Collaborators::new(
        Arc::new(LoggingStreaming),
        Arc::clone(&store) as Arc<dyn TrackingServiceStore>,
        Arc::new(ExitOnReboot {
            running: Arc::clone(&running),
        }),
        Arc::new(probe),
    )
    .with_status_sink(Arc::new(|status: &ServiceStatus| {
        info!("status: {}", status.state);
    }));

    let service = Arc::new(ServiceHandle::start(config.service.clone(), collaborators)?);

    let mut listener = DataSourceListener::new(config.discovery.clone(), config.identity.clone());
    let addr = listener
        .start()
        .map_err(|e| Error::context("starting listener", e))?;
    info!("{} answering ?DS queries on {}", config.identity.id, addr);

    let mut queue = CommandQueue::start(ServiceCommandHandler::new(Arc::clone(&service)), config.queue)
        .map_err(|e| Error::context("starting command queue", e))?;

    info!("Reading commands from stdin: <request-id> <command> [json-data]");
    let lines = stdin_lines()?;
    while running.load(Ordering::SeqCst) {
        let line = match lines.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Some(command) = parse_command(&line) else {
            warn!("cannot parse {:?}", line);
            continue;
        };
        if command.command_type == CommandType::Undefined {
            warn!("unknown command in {:?}", line);
            continue;
        }
        let request_id = command.request_id.clone();
        if queue.enqueue(command) {
            print_result(&queue, &request_id);
        } else {
            warn!("queue refused {}", request_id);
        }
    }

    queue.shutdown();
    listener.stop();
    drop(queue);
    drop(service);
    info!("Data Source stopped");
    Ok(())
}

/// Stdin lines, delivered on a channel so the main loop can watch the
/// interrupt flag.
fn stdin_lines() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            for line in io::stdin().lock().lines().map_while(|l| l.ok()) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        })
        .map_err(|e| Error::context("spawning stdin reader", e))?;
    Ok(rx)
}

fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.trim().splitn(3, ' ');
    let request_id = parts.next().filter(|s| !s.is_empty())?;
    let command_type: CommandType = parts.next()?.parse().ok()?;
    let mut command = Command::new(request_id, command_type);
    if let Some(data) = parts.next() {
        let value: serde_json::Value = serde_json::from_str(data).ok()?;
        for (key, value) in value.as_object()? {
            command = command.with_data(key, value.clone());
        }
    }
    Some(command)
}

fn print_result(queue: &CommandQueue, request_id: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Some(result) = queue.take_result(request_id) {
            match serde_json::to_string(&result) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("encoding result {}: {}", request_id, e),
            }
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    warn!("no result for {} yet", request_id);
}
