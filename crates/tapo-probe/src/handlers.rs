use tapo_core::{
    Client, ClientOptions, Credentials, DeviceConfig, Error, ProtocolClient, ProtocolKind,
};
use tracing::debug;

use crate::cli::ProbeArgs;
use crate::utils::{
    is_hash_mismatch, print_debug_info, print_device_info, print_energy_usage, print_hash_hints,
};

/// Builds the client described by the command line.
pub fn build_client(args: &ProbeArgs) -> Result<Client, Error> {
    let protocol = if args.legacy {
        ProtocolKind::Legacy
    } else {
        ProtocolKind::Klap
    };
    let config = DeviceConfig::new(
        "probe",
        &args.host,
        Credentials::new(&args.username, &args.password),
        protocol,
    );
    let options = ClientOptions {
        connect_timeout: args.timeout,
        request_timeout: args.timeout,
        ..ClientOptions::default()
    };
    Client::from_config(&config, options)
}

/// Connects, then reads device info and energy usage once.
pub async fn run_probe(args: &ProbeArgs) -> Result<(), Error> {
    let mut client = build_client(args)?;
    println!(
        "Probing {} using the {} protocol",
        args.host,
        client.protocol()
    );

    if args.debug {
        print_debug_info(&args.username, &args.password);
    }

    println!("Connecting...");
    if let Err(e) = client.connect().await {
        if args.debug {
            println!("\nConnection failed: {}", e);
            if is_hash_mismatch(&e) {
                print_hash_hints();
            }
        }
        return Err(e);
    }
    println!("Connected");

    let info = client.get_device_info().await?;
    debug!(device_id = %info.device_id, model = %info.model, "received device info");
    print_device_info(&info);

    let usage = client.get_energy_usage().await?;
    print_energy_usage(&usage);

    client.close();
    println!("\nProbe completed successfully");
    Ok(())
}
