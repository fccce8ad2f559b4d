//! thdctl - Talos Linux on Hetzner dedicated servers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use thdctl::provision::{ProvisionConfig, ProvisioningState, ServerDescriptor, StateMachine};
use thdctl::robot::{FirewallRule, RobotApi, RobotClient};
use thdctl::ssh::SshClient;
use thdctl::talos::{TalosApiProbe, DEFAULT_TALOS_VERSION};
use thdctl::validation::{validate_disk_name, validate_image_url, validate_talos_version};

/// Provision Hetzner dedicated servers with Talos Linux.
#[derive(Parser)]
#[command(name = "thdctl")]
#[command(about = "Provision Hetzner dedicated servers with Talos Linux", version)]
struct Cli {
    /// Robot webservice user (or set `HETZNER_USERNAME` env var).
    #[arg(long, env = "HETZNER_USERNAME", global = true, default_value = "")]
    username: String,

    /// Robot webservice password (or set `HETZNER_PASSWORD` env var).
    #[arg(long, env = "HETZNER_PASSWORD", global = true, default_value = "", hide_env_values = true)]
    password: String,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Txt, global = true)]
    log: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Txt,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List all dedicated servers of the account.
    ListServers,

    /// Show details of a server.
    GetServer {
        /// Server number.
        server_number: u32,
    },

    /// Show the firewall of a server.
    ListFirewallRules {
        /// Server number.
        server_number: u32,
    },

    /// Install Talos Linux on a server.
    Init {
        /// Server number.
        server_number: u32,

        /// Do not reset the server into the rescue system.
        #[arg(short = 'n', long)]
        skip_reboot: bool,

        /// Enable the rescue system even if it is already active.
        #[arg(short = 'r', long)]
        enable_rescue_system: bool,

        /// Target disk below /dev.
        #[arg(short, long, default_value = "nvme0n1")]
        disk: String,

        /// Talos release to install.
        #[arg(long, default_value = DEFAULT_TALOS_VERSION)]
        talos_version: String,

        /// Image URL to install instead of the release image.
        #[arg(short, long)]
        image: Option<String>,

        /// Ticks a state may make no progress before giving up.
        #[arg(long, default_value = "10")]
        max_retries: u32,

        /// Rescue system password (or set `HETZNER_SSH_PASSWORD` env var).
        #[arg(long, env = "HETZNER_SSH_PASSWORD", hide_env_values = true)]
        ssh_password: Option<String>,

        /// Start from this state instead of querying the server.
        #[arg(long)]
        from_state: Option<ProvisioningState>,
    },
}

fn init_tracing(debug: bool, format: LogFormat) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Txt => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn robot_client(cli: &Cli) -> Result<RobotClient> {
    if cli.username.is_empty() || cli.password.is_empty() {
        anyhow::bail!("Robot credentials missing: set --username/--password or HETZNER_USERNAME/HETZNER_PASSWORD");
    }
    RobotClient::new(&cli.username, &cli.password).context("Failed to create Robot client")
}

fn print_rules(direction: &str, rules: &[FirewallRule]) {
    println!("\n{direction}:");
    if rules.is_empty() {
        println!("  (none)");
        return;
    }
    println!(
        "  {:<24} {:<6} {:<20} {:<12} {:<8} {:<8}",
        "NAME", "IP", "SOURCE", "DST PORT", "PROTO", "ACTION"
    );
    println!("  {}", "-".repeat(82));
    for rule in rules {
        println!(
            "  {:<24} {:<6} {:<20} {:<12} {:<8} {:<8}",
            rule.name.as_deref().unwrap_or("-"),
            rule.ip_version.as_deref().unwrap_or("-"),
            rule.src_ip.as_deref().unwrap_or("any"),
            rule.dst_port.as_deref().unwrap_or("any"),
            rule.protocol.as_deref().unwrap_or("any"),
            rule.action
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.log);

    match &cli.command {
        Commands::ListServers => {
            let robot = robot_client(&cli)?;
            let servers = robot.list_servers().await.context("Failed to list servers")?;
            println!(
                "\n{:<10} {:<20} {:<12} {:<14} {:<16} {:<24}",
                "NUMBER", "NAME", "PRODUCT", "DC", "IPv4", "IPv6"
            );
            println!("{}", "-".repeat(100));
            for server in servers {
                println!(
                    "{:<10} {:<20} {:<12} {:<14} {:<16} {:<24}",
                    server.server_number,
                    server.server_name,
                    server.product,
                    server.dc,
                    server.server_ip.unwrap_or_default(),
                    server.server_ipv6_net.unwrap_or_default()
                );
            }
        }

        Commands::GetServer { server_number } => {
            let robot = robot_client(&cli)?;
            let server = robot
                .get_server(*server_number)
                .await
                .with_context(|| format!("Failed to get server {server_number}"))?;
            println!("\nServer Details:");
            println!("  Number:     {}", server.server_number);
            println!("  Name:       {}", server.server_name);
            println!("  Product:    {}", server.product);
            println!("  DC:         {}", server.dc);
            println!("  Status:     {}", server.status);
            println!("  IPv4:       {}", server.server_ip.unwrap_or_default());
            println!("  IPv6:       {}", server.server_ipv6_net.unwrap_or_default());
            println!("  Paid until: {}", server.paid_until.unwrap_or_default());
            println!("  Cancelled:  {}", server.cancelled);
        }

        Commands::ListFirewallRules { server_number } => {
            let robot = robot_client(&cli)?;
            let firewall = robot
                .get_firewall(*server_number)
                .await
                .with_context(|| format!("Failed to get firewall of server {server_number}"))?;
            println!("\nFirewall of {} ({}):", firewall.server_number, firewall.server_ip);
            println!("  Status:      {}", firewall.status);
            println!("  IPv6 filter: {}", firewall.filter_ipv6);
            println!("  Port:        {}", firewall.port);
            print_rules("Input rules", &firewall.rules.input);
            print_rules("Output rules", &firewall.rules.output);
        }

        Commands::Init {
            server_number,
            skip_reboot,
            enable_rescue_system,
            disk,
            talos_version,
            image,
            max_retries,
            ssh_password,
            from_state,
        } => {
            validate_disk_name(disk)?;
            validate_talos_version(talos_version)?;
            let image = image.as_deref().filter(|i| !i.is_empty());
            if let Some(image) = image {
                validate_image_url(image)?;
            }

            let robot = robot_client(&cli)?;

            let mut server =
                ServerDescriptor::new(*server_number, disk.as_str()).with_talos_version(talos_version.as_str());
            if let Some(image) = image {
                server = server.with_image_url(image);
            }

            let config = ProvisionConfig::default()
                .with_max_retries(*max_retries)
                .with_skip_reboot(*skip_reboot)
                .with_force_rescue(*enable_rescue_system)
                .with_ssh_password_override(ssh_password.clone());

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                warn!("Interrupted, stopping. Press Ctrl-C again to exit immediately");
                on_signal.cancel();

                // Blocking SSH calls can outlive the runtime.
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });

            let mut machine = StateMachine::new(
                robot,
                SshClient::default(),
                TalosApiProbe::default(),
                server,
                config,
            )
            .with_cancellation(cancel);
            if let Some(state) = from_state {
                info!(state = %state, "Starting from requested state");
                machine = machine.with_start_state(*state);
            }

            machine
                .run()
                .await
                .with_context(|| format!("Failed to provision server {server_number}"))?;
            println!("\n✅ Talos is running on server {server_number}");
        }
    }

    Ok(())
}
