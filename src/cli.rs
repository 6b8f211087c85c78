use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "photodrop",
    version,
    about = "Batched, resumable photo uploads for gallery delivery",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    Auth {
        #[arg(short, long)]
        token: String,
    },

    Upload {
        #[arg(help = "Gallery id")]
        gallery: String,

        #[arg(required = true, num_args = 1.., help = "Image files to upload")]
        files: Vec<String>,

        #[arg(long, help = "Order id; uploads final deliverables for that order")]
        order: Option<String>,

        #[arg(long, help = "Storage already used, in bytes (defaults to the account's usage)")]
        used_bytes: Option<u64>,

        #[arg(long, help = "Storage limit, in bytes (defaults to the account's limit)")]
        limit_bytes: Option<u64>,

        #[arg(short, long, help = "Output the summary in JSON format")]
        json: bool,
    },

    Ls {
        #[arg(help = "Gallery id (falls back to default_gallery)")]
        gallery: Option<String>,

        #[arg(long, help = "Only list images of this order")]
        order: Option<String>,

        #[arg(short, long, help = "Output in JSON format")]
        json: bool,
    },

    Config {
        #[command(subcommand)]
        action: ConfigSubcommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    Get { key: String },
    Set { key: String, value: String },
    List,
}
