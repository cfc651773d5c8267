use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use wyrm::client::{DeviceClient, EchoHandler};
use wyrm::control::ControlClient;
use wyrm::directory::{DeviceStore, Endpoint};

#[derive(Parser)]
#[command(name = "wyrm")]
#[command(about = "Wyrm tunnel gateway CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config and empty device directory).
    Init {
        /// Config file path (default: WYRM_CONFIG_PATH or ~/.wyrm/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the gateway (device tunnels on /tunnel, control API on /api/v1).
    Gateway {
        /// Config file path (default: WYRM_CONFIG_PATH or ~/.wyrm/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from config or 8080)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Manage the device directory.
    Device {
        /// Config file path (default: WYRM_CONFIG_PATH or ~/.wyrm/config.json)
        #[arg(long, short, value_name = "PATH", global = true)]
        config: Option<PathBuf>,

        #[command(subcommand)]
        command: DeviceCommands,
    },

    /// Invoke an endpoint on a connected device through a running gateway.
    Invoke {
        /// Config file path (default: WYRM_CONFIG_PATH or ~/.wyrm/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, value_name = "ID")]
        device: i64,

        #[arg(long)]
        pattern: String,

        /// Payload sent to the device (default: empty)
        #[arg(long, default_value = "")]
        data: String,

        /// Gateway base URL (default from config)
        #[arg(long)]
        url: Option<String>,
    },

    /// Drop a device's tunnel on a running gateway.
    Revoke {
        /// Config file path (default: WYRM_CONFIG_PATH or ~/.wyrm/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long, value_name = "ID")]
        device: i64,

        /// Gateway base URL (default from config)
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Subcommand)]
enum DeviceCommands {
    /// Register a device and print its auth key.
    Add {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Endpoint pattern the device exposes (repeatable)
        #[arg(long = "endpoint", value_name = "PATTERN")]
        endpoints: Vec<String>,
    },

    /// List registered devices.
    List,

    /// Remove a device from the directory.
    Remove {
        #[arg(long, value_name = "ID")]
        id: i64,
    },

    /// Issue a new auth key for a device; the old key stops working.
    RotateKey {
        #[arg(long, value_name = "ID")]
        id: i64,
    },

    /// Dial a gateway as a device and serve the echo endpoints until the tunnel closes.
    Connect {
        #[arg(long)]
        auth_key: String,

        /// Tunnel URL (default: ws://<gateway bind>:<port>/tunnel from config)
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("wyrm {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config),
        Some(Commands::Gateway { config, port }) => run_gateway(config, port).await,
        Some(Commands::Device { config, command }) => run_device(config, command).await,
        Some(Commands::Invoke {
            config,
            device,
            pattern,
            data,
            url,
        }) => run_invoke(config, device, pattern, data, url).await,
        Some(Commands::Revoke {
            config,
            device,
            url,
        }) => run_revoke(config, device, url).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };

    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(wyrm::config::default_config_path);
    let dir = wyrm::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = wyrm::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    wyrm::gateway::run_gateway(config, path).await
}

async fn open_store(config_path: Option<PathBuf>) -> anyhow::Result<DeviceStore> {
    let (config, path) = wyrm::config::load_config(config_path)?;
    wyrm::init::require_initialized(&path)?;
    let devices_path = wyrm::config::resolve_devices_path(&config, &path);
    Ok(DeviceStore::load(devices_path).await)
}

async fn run_device(config_path: Option<PathBuf>, command: DeviceCommands) -> anyhow::Result<()> {
    match command {
        DeviceCommands::Add {
            name,
            description,
            endpoints,
        } => {
            let store = open_store(config_path).await?;
            let endpoints = endpoints
                .into_iter()
                .map(|pattern| Endpoint {
                    display_name: pattern.trim_start_matches('/').to_string(),
                    pattern,
                    description: String::new(),
                })
                .collect();
            let device = store.add(name, description, endpoints).await?;
            println!("added device {} ({})", device.id, device.display_name);
            println!("auth key: {}", device.auth_key);
        }
        DeviceCommands::List => {
            let store = open_store(config_path).await?;
            let devices = store.list().await;
            if devices.is_empty() {
                println!("no devices registered");
            }
            for d in devices {
                let patterns: Vec<&str> = d.endpoints.iter().map(|e| e.pattern.as_str()).collect();
                println!(
                    "{}\t{}\t{}\t[{}]",
                    d.id,
                    d.display_name,
                    d.created_at.to_rfc3339(),
                    patterns.join(", ")
                );
            }
        }
        DeviceCommands::Remove { id } => {
            let store = open_store(config_path.clone()).await?;
            if store.remove(id).await? {
                println!("removed device {}", id);
                drop_live_tunnel(config_path, id).await;
            } else {
                anyhow::bail!("device {} not found", id);
            }
        }
        DeviceCommands::RotateKey { id } => {
            let store = open_store(config_path.clone()).await?;
            match store.rotate_key(id).await? {
                Some(key) => {
                    println!("new auth key for device {}: {}", id, key);
                    drop_live_tunnel(config_path, id).await;
                }
                None => anyhow::bail!("device {} not found", id),
            }
        }
        DeviceCommands::Connect { auth_key, url } => {
            let url = match url {
                Some(u) => u,
                None => {
                    let (config, _) = wyrm::config::load_config(config_path)?;
                    format!("ws://{}:{}/tunnel", config.gateway.bind.trim(), config.gateway.port)
                }
            };
            let connection = DeviceClient::new(url, auth_key)
                .connect(Arc::new(EchoHandler))
                .await?;
            println!("connected as device {}", connection.device_id());
            let interrupted = tokio::select! {
                reason = connection.closed() => {
                    println!("tunnel closed: {}", reason);
                    false
                }
                _ = tokio::signal::ctrl_c() => true,
            };
            if interrupted {
                connection.disconnect().await;
                println!("disconnected");
            }
        }
    }
    Ok(())
}

fn control_client(config_path: Option<PathBuf>, url: Option<String>) -> anyhow::Result<ControlClient> {
    let (config, _) = wyrm::config::load_config(config_path)?;
    let url = url.unwrap_or_else(|| {
        format!("http://{}:{}", config.gateway.bind.trim(), config.gateway.port)
    });
    Ok(ControlClient::new(Some(url), wyrm::config::resolve_gateway_token(&config)))
}

/// A tunnel admitted with the old credential stays up until revoked on the running gateway.
async fn drop_live_tunnel(config_path: Option<PathBuf>, id: i64) {
    let client = match control_client(config_path, None) {
        Ok(client) => client,
        Err(e) => {
            log::debug!("not revoking live tunnel: {}", e);
            println!("run `wyrm revoke --device {}` to drop a live tunnel", id);
            return;
        }
    };
    match client.revoke_if_running(id).await {
        Ok(true) => println!("revoked live tunnel for device {} on {}", id, client.base_url()),
        Ok(false) => log::debug!("no gateway at {}", client.base_url()),
        Err(e) => {
            log::warn!("revoking device {} on {} failed: {}", id, client.base_url(), e);
            println!("run `wyrm revoke --device {}` to drop a live tunnel", id);
        }
    }
}

async fn run_invoke(
    config_path: Option<PathBuf>,
    device: i64,
    pattern: String,
    data: String,
    url: Option<String>,
) -> anyhow::Result<()> {
    let client = control_client(config_path, url)?;
    let response = client.invoke(device, &pattern, &data).await?;
    if response.status != wyrm::gateway::STATUS_OK {
        eprintln!("device answered with status {}", response.status);
    }
    println!("{}", response.data);
    Ok(())
}

async fn run_revoke(config_path: Option<PathBuf>, device: i64, url: Option<String>) -> anyhow::Result<()> {
    let client = control_client(config_path, url)?;
    client.revoke(device).await?;
    println!("revoked device {}", device);
    Ok(())
}
