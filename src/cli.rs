use clap::Parser;
use std::path::PathBuf;
use uuid::Uuid;

/// CLI arguments for the delivery-plane server.
#[derive(Parser, Debug)]
#[clap(name = "roomcast-server")]
#[clap(about = "Real-time chat delivery plane", long_about = None)]
pub struct Args {
    /// Host to bind to
    #[clap(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[clap(short, long, default_value = "8080")]
    pub port: u16,

    /// MQTT broker URL linking this instance to its peers
    /// (e.g. mqtt://localhost:1883); without it the instance runs alone
    #[clap(long, value_name = "URL")]
    pub broker: Option<String>,

    /// Stable instance id used to tag cluster publications
    /// (defaults to a generated UUID)
    #[clap(long, value_name = "ID")]
    pub instance_id: Option<Uuid>,

    /// JSON file mapping bearer tokens to identity claims (dev mode)
    #[clap(long, value_name = "FILE")]
    pub tokens: Option<PathBuf>,

    /// Seed a demo room containing every user from the token file
    #[clap(long)]
    pub demo: bool,
}
