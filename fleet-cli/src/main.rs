use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use emufleet::sdk::{
    ExposureMode, FleetConfig, FleetSummary, FleetSupervisor, HardwareProfile, ScreenGeometry,
    SystemTools, ToolPaths,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "fleet-cli",
    version,
    about = "Provision and supervise a fleet of emulated device instances"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Bring the fleet up and keep it running until SIGINT/SIGTERM.
    Up(UpArgs),
    /// Print descriptor names and ports for every slot without launching.
    Plan(PlanArgs),
    /// Print the resolved paths of the host tools.
    Tools(ToolsArgs),
}

#[derive(Debug, Clone, Args)]
struct FleetArgs {
    /// Number of instances.
    #[arg(long, env = "INSTANCE_COUNT", default_value_t = 1)]
    instance_count: usize,

    /// Console port of the first instance; later ones advance by two.
    #[arg(long, env = "BASE_CONSOLE_PORT", default_value_t = 5554)]
    base_console_port: u16,

    /// Bridge port of the first instance; later ones advance by two.
    #[arg(long, env = "BASE_BRIDGE_PORT", default_value_t = 5555)]
    base_bridge_port: u16,

    /// Port of the shared bridge server.
    #[arg(long, env = "BRIDGE_SERVER_PORT", default_value_t = 5037)]
    bridge_server_port: u16,

    #[arg(long, env = "MEMORY_MB", default_value_t = 2048)]
    memory_mb: u32,

    #[arg(long, env = "CPU_CORES", default_value_t = 2)]
    cpu_cores: u32,

    #[arg(long, env = "PARTITION_SIZE_MB", default_value_t = 2048)]
    partition_size_mb: u32,

    #[arg(long, env = "SCREEN_WIDTH", default_value_t = 720)]
    screen_width: u32,

    #[arg(long, env = "SCREEN_HEIGHT", default_value_t = 1280)]
    screen_height: u32,

    #[arg(long, env = "SCREEN_DENSITY", default_value_t = 320)]
    screen_density: u32,

    /// Rendering backend passed to the emulator.
    #[arg(long, env = "RENDERING_BACKEND", default_value = "swiftshader_indirect")]
    rendering_backend: String,

    /// Skip bridge authentication on every instance.
    #[arg(
        long,
        env = "SKIP_AUTH",
        default_value = "true",
        value_parser = BoolishValueParser::new(),
        action = clap::ArgAction::Set
    )]
    skip_auth: bool,

    /// Descriptor name prefix.
    #[arg(long, env = "INSTANCE_NAME_PREFIX", default_value = "emulator")]
    name_prefix: String,

    #[arg(long, env = "PLATFORM_VERSION", default_value = "30")]
    platform_version: String,

    #[arg(long, env = "ABI", default_value = "x86_64")]
    abi: String,

    #[arg(long, env = "DEVICE_PROFILE", default_value = "pixel")]
    device_profile: String,

    /// System image package; derived from platform version and ABI if unset.
    #[arg(long, env = "SYSTEM_IMAGE_PACKAGE")]
    system_image_package: Option<String>,

    /// Delay between successive launches, in seconds.
    #[arg(long, env = "STAGGER_SECS", default_value_t = 30)]
    stagger_secs: u64,

    /// Boot wait deadline per instance, in seconds.
    #[arg(long, env = "BOOT_TIMEOUT_SECS", default_value_t = 300)]
    boot_timeout_secs: u64,

    #[arg(long, env = "BOOT_POLL_SECS", default_value_t = 5)]
    boot_poll_secs: u64,

    /// How long to wait for a port to listen before relaying it, in seconds.
    #[arg(long, env = "PORT_WAIT_SECS", default_value_t = 60)]
    port_wait_secs: u64,
}

impl FleetArgs {
    fn to_config(&self) -> FleetConfig {
        FleetConfig {
            instance_count: self.instance_count,
            base_console_port: self.base_console_port,
            base_bridge_port: self.base_bridge_port,
            bridge_server_port: self.bridge_server_port,
            profile: HardwareProfile {
                memory_mb: self.memory_mb,
                cpu_cores: self.cpu_cores,
                partition_size_mb: self.partition_size_mb,
                screen: ScreenGeometry {
                    width: self.screen_width,
                    height: self.screen_height,
                    density: self.screen_density,
                },
                rendering_backend: self.rendering_backend.clone(),
                skip_auth: self.skip_auth,
            },
            name_prefix: self.name_prefix.clone(),
            platform_version: self.platform_version.clone(),
            abi: self.abi.clone(),
            device_profile: self.device_profile.clone(),
            system_image_package: self.system_image_package.clone(),
            stagger: Duration::from_secs(self.stagger_secs),
            boot_timeout: Duration::from_secs(self.boot_timeout_secs),
            boot_poll_interval: Duration::from_secs(self.boot_poll_secs),
            port_wait_timeout: Duration::from_secs(self.port_wait_secs),
            ..FleetConfig::default()
        }
    }
}

#[derive(Debug, Clone, Args)]
struct UpArgs {
    #[command(flatten)]
    fleet: FleetArgs,

    /// `auto`, `off`, or the address relays bind on.
    #[arg(long, env = "EXPOSE", default_value = "auto", value_parser = parse_exposure)]
    expose: ExposureMode,

    /// SDK root used to locate emulator, adb and avdmanager.
    #[arg(long, env = "ANDROID_SDK_ROOT")]
    sdk_root: Option<PathBuf>,

    /// Directory for per-instance emulator logs.
    #[arg(long, env = "FLEET_LOG_DIR", default_value = "fleet-logs")]
    log_dir: PathBuf,

    /// Directory holding descriptors.
    #[arg(long, env = "AVD_HOME")]
    avd_home: Option<PathBuf>,

    /// Write the fleet summary as JSON to this path.
    #[arg(long, env = "SUMMARY_JSON")]
    summary_json: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct PlanArgs {
    #[command(flatten)]
    fleet: FleetArgs,

    /// Print the plan as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct ToolsArgs {
    #[arg(long, env = "ANDROID_SDK_ROOT")]
    sdk_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(command: Commands) -> Result<i32, Box<dyn std::error::Error>> {
    match command {
        Commands::Up(args) => return up(args).await,
        Commands::Plan(args) => plan(args)?,
        Commands::Tools(args) => tools(args)?,
    }
    Ok(0)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fleet_sdk=info,fleet_cli=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn up(args: UpArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let config = args.fleet.to_config();
    config.validate()?;

    let paths = ToolPaths::resolve(args.sdk_root.as_deref())?;
    let mut system = SystemTools::new(paths, &config).log_dir(&args.log_dir);
    if let Some(avd_home) = &args.avd_home {
        system = system.avd_home(avd_home);
    }

    let exposure = args.expose.resolve();
    match exposure {
        Some(bind) => tracing::info!(%bind, "exposure enabled"),
        None => tracing::info!(mode = %args.expose, "exposure disabled"),
    }

    let supervisor = FleetSupervisor::new(config, system, exposure)?;
    let summary_json = args.summary_json.as_deref();

    let outcome = supervisor
        .run_until_with(shutdown_signal(), |summary| {
            print_summary(summary);
            if let Some(path) = summary_json {
                write_summary(summary, path);
            }
        })
        .await;

    if let Some(path) = summary_json {
        write_summary(&outcome.summary, path);
    }
    if let Some(err) = &outcome.error {
        eprintln!("error: {err}");
    }
    println!(
        "shutdown signalled={} already_exited={} failed={}",
        outcome.shutdown.signalled, outcome.shutdown.already_exited, outcome.shutdown.failed
    );
    Ok(outcome.exit_code())
}

fn plan(args: PlanArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.fleet.to_config();
    config.validate()?;

    let slots = config.slots();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&slots)?);
        return Ok(());
    }

    println!("bridge_server_port={}", config.bridge_server_port);
    println!("system_image_package={}", config.system_image_package());
    for slot in slots {
        println!(
            "instance={} descriptor={} console_port={} bridge_port={}",
            slot.index, slot.descriptor_name, slot.console_port, slot.bridge_port
        );
    }
    Ok(())
}

fn tools(args: ToolsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let paths = ToolPaths::resolve(args.sdk_root.as_deref())?;
    println!("emulator={}", paths.emulator.display());
    println!("adb={}", paths.adb.display());
    println!("avdmanager={}", paths.avdmanager.display());
    println!("relay={}", paths.relay.display());
    println!("socket_inspector={}", paths.socket_inspector.display());
    println!("process_matcher={}", paths.process_matcher.display());
    Ok(())
}

fn print_summary(summary: &FleetSummary) {
    for line in summary.render_lines() {
        println!("{line}");
    }
}

fn write_summary(summary: &FleetSummary, path: &Path) {
    let result = serde_json::to_vec_pretty(summary)
        .map_err(std::io::Error::from)
        .and_then(|json| std::fs::write(path, json));
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "failed to write summary");
    }
}

fn parse_exposure(value: &str) -> Result<ExposureMode, String> {
    value.parse().map_err(|e: emufleet::sdk::Error| e.to_string())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        tokio::select! {
            _ = ctrl_c() => {},
            _ = terminate() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}
