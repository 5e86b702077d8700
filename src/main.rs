//! PiControl MQTT client command line
//!
//! Connects to the broker as this installation's controller and asks the
//! coordinator for devices or accessories.

use clap::{Parser, Subcommand};
use picontrol_mqtt::config::ClientConfig;
use picontrol_mqtt::credentials::{CredentialStore, FileCredentialStore};
use picontrol_mqtt::discovery::ServiceDirectory;
use picontrol_mqtt::identity::DeviceIdentity;
use picontrol_mqtt::observability::init_default_logging;
use picontrol_mqtt::protocol::{
    Accessories, AccessoriesRequest, Devices, DevicesRequest, Message, MessageHeader,
    TopicBuilder,
};
use picontrol_mqtt::service::MqttClientService;
use picontrol_mqtt::transport::BrokerCredentials;
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{error, info, warn};

type CliResult<T> = Result<T, Box<dyn Error>>;

/// PiControl MQTT client
#[derive(Parser)]
#[command(name = "picontrol-mqtt")]
#[command(about = "Talk to a PiControl coordinator over MQTT")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "PICONTROL_CONFIG")]
    config: Option<PathBuf>,

    /// Broker host, overriding configuration and discovery
    #[arg(long)]
    host: Option<String>,

    /// Broker port
    #[arg(long, default_value_t = 1883)]
    port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request the device list from the coordinator
    Devices {
        /// Seconds to wait for the reply
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Request the accessories available for pairing
    Accessories {
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// Print this installation's device identity
    Identity,
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_default_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match &cli.command {
        Commands::Devices { wait } => run_devices(&cli, &config, Duration::from_secs(*wait)),
        Commands::Accessories { wait } => {
            run_accessories(&cli, &config, Duration::from_secs(*wait))
        }
        Commands::Identity => show_identity(&config),
        Commands::Config { show } => handle_config_command(&config, *show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> CliResult<ClientConfig> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ClientConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["picontrol.toml", "config/picontrol.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(ClientConfig::load_from_file(&path)?);
                }
            }
            info!("No configuration file found, using defaults");
            Ok(ClientConfig::default())
        }
    }
}

fn device_identity(config: &ClientConfig) -> CliResult<DeviceIdentity> {
    match &config.device.id {
        Some(id) => Ok(DeviceIdentity::new(id.as_str())?),
        None => Ok(DeviceIdentity::load_or_create(&config.device.identity_file)?),
    }
}

/// Command line host, then configured URL, then the first seeded broker
fn broker_address(cli: &Cli, config: &ClientConfig) -> CliResult<(String, u16)> {
    if let Some(host) = &cli.host {
        return Ok((host.clone(), cli.port));
    }
    if let Some(address) = config.mqtt.broker_address()? {
        return Ok(address);
    }

    let directory = ServiceDirectory::new();
    for service in config.seeded_services()? {
        directory.resolved(service);
    }
    directory
        .mqtt_services()
        .into_iter()
        .next()
        .map(|service| (service.hostname, service.port))
        .ok_or_else(|| "No broker configured; pass --host or set mqtt.broker_url".into())
}

fn broker_credentials(config: &ClientConfig) -> CliResult<Option<BrokerCredentials>> {
    let Some(service_url) = &config.credentials.service_url else {
        return Ok(None);
    };
    let store = FileCredentialStore::new(&config.credentials.store_path);
    Ok(Some(store.broker_credentials(service_url)?))
}

fn connected_client(
    cli: &Cli,
    config: &ClientConfig,
) -> CliResult<(MqttClientService, TopicBuilder)> {
    let identity = device_identity(config)?;
    let (host, port) = broker_address(cli, config)?;
    let credentials = broker_credentials(config)?;

    let client = MqttClientService::new(config.mqtt.client_settings(identity.id())?)?;
    client.connect(&host, port, credentials)?;
    info!(device_id = %identity.id(), host = %host, port, "Connected to broker");

    Ok((client, identity.topics().clone()))
}

/// Register a handler on `reply_topic`, send `request` and wait for one reply
fn request_reply<Req: Message, Rep: Message>(
    client: &MqttClientService,
    request_topic: &str,
    request: Req,
    reply_topic: &str,
    wait: Duration,
) -> CliResult<Rep> {
    let (tx, rx) = mpsc::channel();
    let handle = client.add_handler(reply_topic, move |reply: Rep| {
        let _ = tx.send(reply);
        Ok(())
    })?;

    client.publish(request_topic, &request)?;
    let reply = rx.recv_timeout(wait);
    client.remove_handler(&handle);

    reply.map_err(|_| format!("No {} reply within {}s", Rep::TYPE_TAG, wait.as_secs()).into())
}

fn run_devices(cli: &Cli, config: &ClientConfig, wait: Duration) -> CliResult<()> {
    let (client, topics) = connected_client(cli, config)?;
    let request = DevicesRequest {
        header: MessageHeader::now(topics.source()),
    };

    let result = request_reply::<_, Devices>(
        &client,
        &TopicBuilder::devices_request(),
        request,
        &topics.devices_reply(),
        wait,
    );
    disconnect_quietly(&client);

    let devices = result?;
    println!("{}", serde_json::to_string_pretty(&devices.devices)?);
    Ok(())
}

fn run_accessories(cli: &Cli, config: &ClientConfig, wait: Duration) -> CliResult<()> {
    let (client, topics) = connected_client(cli, config)?;
    let request = AccessoriesRequest {
        header: MessageHeader::now(topics.source()),
    };

    let result = request_reply::<_, Accessories>(
        &client,
        &TopicBuilder::accessories_request(),
        request,
        &topics.accessories_reply(),
        wait,
    );
    disconnect_quietly(&client);

    let accessories = result?;
    println!("{}", serde_json::to_string_pretty(&accessories.accessories)?);
    Ok(())
}

fn disconnect_quietly(client: &MqttClientService) {
    if let Err(e) = client.disconnect() {
        warn!("Disconnect failed: {}", e);
    }
}

fn show_identity(config: &ClientConfig) -> CliResult<()> {
    let identity = device_identity(config)?;
    println!("device id: {}", identity.id());
    println!("source:    {}", identity.source());
    Ok(())
}

fn handle_config_command(config: &ClientConfig, show: bool) -> CliResult<()> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    } else {
        println!("Configuration is valid");
    }
    Ok(())
}
