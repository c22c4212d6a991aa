//! WalletLink -- association descriptors and reflector.
//!
//! Usage:
//!   walletlink identity                                # Show association key fingerprint
//!   walletlink associate local --port 4455             # Print a loopback descriptor
//!   walletlink associate remote --reflector host:9480  # Print a relayed descriptor
//!   walletlink inspect <uri>                           # Parse and print a descriptor
//!   walletlink reflector --listen 0.0.0.0:9480 --open 4 # Run a reflector

use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use walletlink_crypto::AssociationKeypair;
use walletlink_protocol::{AssociationDescriptor, AssociationEndpoint, RelaySessionId};
use walletlink_session::config::WalletLinkConfig;
use walletlink_session::{expand_tilde, Reflector};

#[derive(Parser)]
#[command(name = "walletlink", about = "WalletLink association tooling")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.walletlink/config.toml")]
    config: String,

    /// Association key file (overrides session.association_key)
    #[arg(long)]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or generate the association keypair
    Identity,
    /// Print an association descriptor for this keypair
    Associate {
        #[command(subcommand)]
        target: AssociateTarget,
    },
    /// Parse a descriptor URI and print its fields as JSON
    Inspect {
        uri: String,
    },
    /// Run a reflector
    Reflector {
        /// Listen address (overrides reflector.listen_addr)
        #[arg(long)]
        listen: Option<String>,
        /// Open this many session ids at startup and print them
        #[arg(long, default_value_t = 0)]
        open: usize,
    },
}

#[derive(Subcommand)]
enum AssociateTarget {
    /// Wallet on this device, reached over loopback
    Local {
        #[arg(long)]
        port: u16,
    },
    /// Wallet reached through a reflector
    Remote {
        /// Reflector host[:port]
        #[arg(long)]
        reflector: String,
        /// Relay session id, base64url (random if omitted)
        #[arg(long)]
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "walletlink_session=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = WalletLinkConfig::load_or_default(&expand_tilde(&cli.config))?;
    let key_path = expand_tilde(cli.key.as_deref().unwrap_or(&cfg.session.association_key));

    match cli.command {
        Commands::Identity => {
            let keypair = AssociationKeypair::load_or_create(&key_path)?;
            println!("Association key: {}", keypair.fingerprint());
            println!("Key file: {}", key_path.display());
        }
        Commands::Associate { target } => {
            let keypair = AssociationKeypair::load_or_create(&key_path)?;
            let versions = cfg.scenario_config().supported_versions;
            let descriptor = match target {
                AssociateTarget::Local { port } => {
                    AssociationDescriptor::local(keypair.public_key().to_vec(), versions, port)?
                }
                AssociateTarget::Remote { reflector, id } => {
                    let id = match id {
                        Some(id) => RelaySessionId::from_base64url(&id)?,
                        None => RelaySessionId::random(),
                    };
                    AssociationDescriptor::relay(keypair.public_key().to_vec(), versions, reflector, id)?
                }
            };
            eprintln!("Association key: {}", keypair.fingerprint());
            println!("{descriptor}");
        }
        Commands::Inspect { uri } => {
            let descriptor = AssociationDescriptor::parse(&uri)?;
            let endpoint = match descriptor.endpoint() {
                AssociationEndpoint::Local { port } => serde_json::json!({
                    "scheme": "local",
                    "port": port,
                }),
                AssociationEndpoint::Relay {
                    host_authority,
                    session_id,
                } => serde_json::json!({
                    "scheme": "relay",
                    "reflector": host_authority,
                    "session_id": session_id.to_base64url(),
                }),
            };
            let fields = serde_json::json!({
                "association_key": walletlink_crypto::key_fingerprint(descriptor.association_public_key()),
                "versions": descriptor.supported_versions(),
                "endpoint": endpoint,
            });
            println!("{}", serde_json::to_string_pretty(&fields)?);
        }
        Commands::Reflector { listen, open } => {
            let addr = match listen {
                Some(addr) => addr.parse::<SocketAddr>()?,
                None => cfg.reflector_listen_addr()?,
            };
            let reflector = Reflector::bind(addr, cfg.reflector_config()).await?;
            for _ in 0..open {
                let id = reflector.open_session(None);
                println!("Session id: {id}");
            }
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down reflector");
            reflector.shutdown();
        }
    }

    Ok(())
}
