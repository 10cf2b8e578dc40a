use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "firehose-worker",
    version,
    about = "Multi-tenant telemetry firehose ingestion and distribution"
)]
pub struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    /// Serve the read API without connecting to any upstream stream.
    #[arg(long, default_value_t = false)]
    pub no_ingest: bool,
}
