use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "telemetry-gpu-scheduler")]
#[command(about = "Telemetry-aware and GPU-aware Kubernetes scheduler extenders")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the telemetry-aware scheduler extender
    Tas {
        #[command(subcommand)]
        action: TasAction,
    },

    /// Run the GPU-aware scheduler extender
    Gas {
        #[command(subcommand)]
        action: GasAction,
    },

    /// Manage the TelemetryPolicy CRD
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Check cluster connectivity and permissions
    Check,
}

#[derive(Subcommand)]
pub enum TasAction {
    /// Start the filter/prioritize HTTP extender and the policy controller
    Serve {
        #[arg(long, default_value = "0.0.0.0:8888")]
        addr: String,
        #[arg(long)]
        tls_cert: Option<String>,
        #[arg(long)]
        tls_key: Option<String>,
        /// How often the enforcer loop and the metric puller tick, in seconds
        #[arg(long, default_value_t = 30)]
        sync_period_secs: u64,
    },
    /// Generate self-signed TLS certificates for development
    CertGenerate {
        #[arg(long, default_value = "tas")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
        #[arg(long = "ip-san")]
        ip_sans: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum GasAction {
    /// Start the filter/bind HTTP extender
    Serve {
        #[arg(long, default_value = "0.0.0.0:8889")]
        addr: String,
        #[arg(long)]
        tls_cert: Option<String>,
        #[arg(long)]
        tls_key: Option<String>,
        /// Device selection policy: spread, pack, balanced-memory, balanced-millicores
        #[arg(long, default_value = "spread")]
        mode: String,
        /// Honor per-pod gpu.intel.com/cards-allowed and cards-denied annotations
        #[arg(long, default_value_t = false)]
        respect_lists: bool,
    },
    /// Generate self-signed TLS certificates for development
    CertGenerate {
        #[arg(long, default_value = "gas")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
        #[arg(long = "ip-san")]
        ip_sans: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,
    /// Install the CRD into the connected cluster
    Install,
}
