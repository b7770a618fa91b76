//! vkstep demo
//!
//! Renders animated offscreen framebuffers through the deferred render
//! manager, blits them together and presents to a window.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vkstep-demo -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;
mod config;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::event_loop::{ControlFlow, EventLoop};

use crate::app::DemoApp;
use crate::config::DemoConfig;

fn main() -> anyhow::Result<()> {
    let config = DemoConfig::from_args()?;
    if config.help {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!(
        scheduling = ?config.scheduling,
        frames_in_flight = config.frames_in_flight,
        "{} starting",
        config.title
    );

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);
    let mut app = DemoApp::new(config);
    if let Err(e) = event_loop.run_app(&mut app) {
        error!("Event loop error: {e}");
    }
    Ok(())
}

fn print_help() {
    eprintln!(
        "vkstep demo

USAGE:
    cargo run -p vkstep-demo -- [OPTIONS]

RENDERING OPTIONS:
    --threaded               Submit frames from a worker thread
    --frames-in-flight <N>   Frame slots, 1 to 3 (default: 2)
    --vsync                  Enable vsync
    --size <W>x<H>           Initial window size (default: 1280x720)
    --validation             Enable Vulkan validation layers
    --no-validation          Disable Vulkan validation layers

SCREENSHOT OPTIONS:
    -S, --screenshot         Enable screenshot capture of the offscreen scene
    -o, --output <PATTERN>   Output path pattern (use {{}} for frame number)
                             Default: screenshot_{{}}.png
    -f, --frames <FRAMES>    Frame indices to capture
                             Examples: \"0\" \"0,10,20\" \"0-5\" \"0,5-10,20\"
                             Default: 0
    --exit-after             Exit after capturing all specified frames

OTHER:
    -h, --help               Print this help message

EXAMPLES:
    # Threaded submission with three frames in flight
    cargo run -p vkstep-demo -- --threaded --frames-in-flight 3

    # Capture frames 0 and 60, then exit
    cargo run -p vkstep-demo -- -S -f 0,60 -o frame_{{}}.png --exit-after

ENVIRONMENT VARIABLES:
    RUST_LOG                 Set log level (e.g., info, debug, trace)"
    );
}
