//! rview
//!
//! A remote desktop viewer for X11: paints the remote framebuffer into a
//! local window through the Present extension, one frame in flight at a time.

mod client;
mod config;
mod display;
mod input;
mod pipeline;
mod session;
mod signals;

use anyhow::Result;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use client::{Client, ClientOptions};
use config::{CliArgs, Config};
use display::X11Display;
use session::NetSession;

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rview=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match CliArgs::parse(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("rview: {}\n{}", e, CliArgs::usage());
            return ExitCode::from(2);
        }
    };
    if cli.help {
        println!("{}", CliArgs::usage());
        return ExitCode::SUCCESS;
    }

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &CliArgs) -> Result<ExitCode> {
    let stop = signals::install()?;

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply(cli);

    info!(
        "Starting rview: {}:{} ({}x{}, fullscreen={})",
        config.session.host, config.session.port, config.session.width, config.session.height, config.session.fullscreen
    );

    let display = X11Display::open(config.display.name.as_deref())?;
    let engine = NetSession::new(config.session_options(), config.session_settings());
    let options = ClientOptions {
        title: config.display.title.clone(),
        max_event_handles: config.display.max_event_handles,
        strict_input: config.input.strict_forwarding,
        stop: Some(stop),
    };

    let mut client = Client::new(display, engine, options);
    Ok(client.run())
}
