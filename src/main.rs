use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

mod clock;
mod config;
mod core;
mod device;
mod sink;

use config::Config;

/// Give dual-role keys a tap function and a hold function.
#[derive(Debug, Parser)]
#[command(name = "janus-remap", about)]
enum Opt {
    /// List currently available input devices, to help pick the right
    /// path for `remap`.
    ListDevices,

    /// Show a list of possible KEY_XXX values usable in a config file.
    ListKeys,

    /// Load a config (or the compiled-in default) and run the remapper.
    /// This usually requires running as root to obtain exclusive access
    /// to the input device.
    Remap {
        /// The input device to grab, e.g. /dev/input/event4
        #[arg(name = "DEVICE")]
        device: PathBuf,

        /// Config file to load. Uses the compiled-in Caps Lock example
        /// (tap Escape, hold Left Alt) when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of seconds for the user to release keys on startup
        #[arg(short, long, default_value = "2")]
        delay: f64,

        /// Wait for the device to appear instead of failing immediately
        #[arg(short, long, action)]
        wait: bool,
    },
}

fn list_keys() -> Result<()> {
    for key in device::all_keys() {
        println!("{key}");
    }
    Ok(())
}

fn setup_logger() {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    if let Ok(s) = std::env::var("JANUS_REMAP_LOG") {
        builder.parse_filters(&s);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    builder.init();
}

fn load_config(config_file: Option<PathBuf>) -> Result<Config> {
    match config_file {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            log::info!("no --config given, using the compiled-in Caps Lock default");
            Ok(Config::default_caps_lock())
        }
    }
}

fn main() -> Result<()> {
    setup_logger();
    let opt = Opt::parse();

    match opt {
        Opt::ListDevices => device::list_devices(),
        Opt::ListKeys => list_keys(),
        Opt::Remap {
            device: device_path,
            config,
            delay,
            wait,
        } => {
            let config = load_config(config)?;

            log::warn!("short delay: release any keys now!");
            std::thread::sleep(Duration::from_secs_f64(delay));

            let mut attempt = 0f64;
            let (mut input, mut output) = loop {
                match device::open_and_grab(&device_path, &config) {
                    Ok(opened) => break opened,
                    Err(e) if wait => {
                        log::info!("{e:#}, retrying..");
                        std::thread::sleep(Duration::from_secs_f64(delay * attempt));
                        if attempt < 30f64 {
                            attempt += 1f64;
                        }
                    }
                    Err(e) => return Err(e),
                }
            };

            let mut engine =
                core::Engine::new(config.rows, Duration::from_millis(config.max_delay_ms));
            engine.run(&mut input, &mut output)
        }
    }
}
