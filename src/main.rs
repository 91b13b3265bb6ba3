mod cache;
mod cli;
mod commands;
mod controller;
mod crd;
mod extender;
mod gpu;
mod registry;
mod strategy;
mod tls;

use std::time::Duration;

use clap::Parser;
use cli::{Cli, Commands, CrdAction, GasAction, TasAction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => commands::check::run().await?,

        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },

        Commands::Tas { action } => match action {
            TasAction::Serve { addr, tls_cert, tls_key, sync_period_secs } => {
                commands::tas::serve(
                    &addr,
                    tls_cert.as_deref(),
                    tls_key.as_deref(),
                    Duration::from_secs(sync_period_secs),
                )
                .await?
            }
            TasAction::CertGenerate { service_name, namespace, output_dir, ip_sans } => {
                crate::tls::generate_certs(&service_name, &namespace, &output_dir, &ip_sans)?
            }
        },

        Commands::Gas { action } => match action {
            GasAction::Serve { addr, tls_cert, tls_key, mode, respect_lists } => {
                let mode = gpu::SelectionMode::parse(&mode)
                    .ok_or_else(|| format!("unknown device selection mode '{mode}'"))?;
                commands::gas::serve(&addr, tls_cert.as_deref(), tls_key.as_deref(), mode, respect_lists).await?
            }
            GasAction::CertGenerate { service_name, namespace, output_dir, ip_sans } => {
                crate::tls::generate_certs(&service_name, &namespace, &output_dir, &ip_sans)?
            }
        },
    }

    Ok(())
}
