//! BLE Mesh provisioning tool
//!
//! Scans for unprovisioned devices, provisions them into the network and
//! runs the post-provisioning configuration sequence.

use clap::Parser;

use trellis_proto::DeviceUuid;
use trellis_provisioner::{
    config, EventBus, Operation, Outcome, OutcomeDetail, Provisioner, ProvisionerConfig,
    SimNetwork,
};

#[derive(clap::Parser)]
#[command(name = "trellis-ble")]
#[command(about = "BLE Mesh provisioner")]
#[command(group = clap::ArgGroup::new("operation").required(true).multiple(false))]
struct Cli {
    /// Scan for unprovisioned devices
    #[arg(long, group = "operation")]
    scan: bool,

    /// Provision a device (UUID: 16 hex octets, any single-char separators)
    #[arg(long, value_name = "UUID", group = "operation")]
    provision: Option<String>,

    /// List nodes in the device database
    #[arg(long, group = "operation")]
    nodelist: bool,

    /// Query a provisioned node's composition data
    #[arg(long, value_name = "UUID", group = "operation")]
    nodeinfo: Option<String>,

    /// Remove a node from the network and the device database
    #[arg(long, value_name = "UUID", group = "operation")]
    remove: Option<String>,

    /// Factory-reset the provisioner stack
    #[arg(long, group = "operation")]
    reset: bool,

    /// Run against the built-in simulated network instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Number of devices in the simulated network
    #[arg(long, default_value = "2")]
    sim_devices: usize,
}

fn parse_uuid(s: &str) -> DeviceUuid {
    match DeviceUuid::parse(s) {
        Ok(uuid) => uuid,
        Err(e) => {
            eprintln!("invalid UUID '{s}': {e}");
            std::process::exit(1);
        }
    }
}

fn operation_from(cli: &Cli) -> Operation {
    if cli.scan {
        Operation::Scan
    } else if let Some(uuid) = &cli.provision {
        Operation::Provision(parse_uuid(uuid))
    } else if cli.nodelist {
        Operation::ListNodes
    } else if let Some(uuid) = &cli.nodeinfo {
        Operation::NodeInfo(parse_uuid(uuid))
    } else if let Some(uuid) = &cli.remove {
        Operation::RemoveNode(parse_uuid(uuid))
    } else {
        Operation::FactoryReset
    }
}

fn print_outcome(outcome: &Outcome) {
    println!("{}", outcome.message);

    match &outcome.detail {
        OutcomeDetail::None => {}
        OutcomeDetail::Devices(devices) => {
            for device in devices {
                println!("  {} ({}) RSSI: {} dBm", device.uuid, device.bearer, device.rssi);
            }
        }
        OutcomeDetail::Nodes(nodes) => {
            for node in nodes {
                println!(
                    "  {} addr {} elements {} netkey {}",
                    node.uuid, node.address, node.elements, node.netkey_index
                );
            }
        }
        OutcomeDetail::Composition(dcd) => {
            println!(
                "  company 0x{:04x} product 0x{:04x} version 0x{:04x}",
                dcd.company_id, dcd.product_id, dcd.version_id
            );
            for (i, element) in dcd.elements.iter().enumerate() {
                let models: Vec<String> =
                    element.models.iter().map(|m| format!("0x{m:04x}")).collect();
                println!("  element {i}: models [{}]", models.join(", "));
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let operation = operation_from(&cli);

    let home = match config::trellis_home() {
        Ok(home) => home,
        Err(e) => {
            eprintln!("Failed to prepare TRELLIS_HOME: {e}");
            std::process::exit(1);
        }
    };
    let cfg = match ProvisionerConfig::load_or_create(&home) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if !cli.simulate {
        eprintln!("No hardware bearer is configured on this build; run with --simulate.");
        std::process::exit(1);
    }

    let (sender, bus) = EventBus::channel();
    let transport = SimNetwork::new().with_devices(cli.sim_devices).into_transport(sender.clone());
    let mut provisioner = Provisioner::new(cfg, transport, bus, sender);

    match provisioner.run(operation).await {
        Ok(outcome) => {
            print_outcome(&outcome);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
