//! Player CLI: plays audio files through the streaming audio engine.
//!
//! The engine decodes each file with Symphonia, keeps short ones resident
//! and streams long ones, and mixes everything into one CPAL output stream.
//! This binary only opens a manager, starts the sounds and calls `update()`
//! once per frame.

mod cli;
mod runtime;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,audio_engine=info")),
        )
        .init();

    if args.list_devices {
        return runtime::list_devices();
    }
    runtime::run(&args)
}
