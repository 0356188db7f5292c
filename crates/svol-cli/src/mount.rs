//! The `mount` subcommand: build the volume, hand it to FUSE, park until
//! SIGINT, then persist the new root identifier.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use svol_config::Config;
use svol_core::Volume;

static UNMOUNT: AtomicBool = AtomicBool::new(false);

extern "C" fn request_unmount(_sig: libc::c_int) {
    UNMOUNT.store(true, Ordering::SeqCst);
}

#[derive(Args, Debug)]
pub struct MountArgs {
    /// Where to mount the filesystem
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,

    /// Volume config file to read (and update at unmount)
    #[arg(short = 'c', long = "config", default_value = "config.yml")]
    config: PathBuf,

    /// Log level: error, warn, info, debug or trace
    #[arg(short = 'v', long = "verbosity", default_value = "info")]
    verbosity: String,
}

pub fn run(args: MountArgs) -> Result<()> {
    init_logging(&args.verbosity);

    let mut config = Config::load(&args.config)
        .with_context(|| format!("could not read config {}", args.config.display()))?;
    let driver = svol_driver::create(&config.driver, &config.driver_opts)
        .with_context(|| format!("could not construct driver {}", config.driver))?;

    let root_id = (!config.root_id.is_empty()).then(|| config.root_id.clone());
    let volume = Arc::new(Volume::new(driver, config.depth, root_id)?);
    info!(
        driver = %config.driver,
        capacity = volume.capacity(),
        "mounting volume"
    );

    let session = svol_fuse::mount(volume.clone(), &args.mountpoint)
        .with_context(|| format!("could not mount at {}", args.mountpoint.display()))?;
    unsafe {
        libc::signal(libc::SIGINT, request_unmount as libc::sighandler_t);
        libc::signal(libc::SIGTERM, request_unmount as libc::sighandler_t);
    }
    info!("mounted filesystem");

    while !UNMOUNT.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("unmounting filesystem");
    drop(session);

    config.root_id = volume.root_id().unwrap_or_default();
    info!("saving configuration");
    config.save(&args.config)?;
    Ok(())
}

fn init_logging(verbosity: &str) {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SVOL_LOG")
                .unwrap_or_else(|_| EnvFilter::new(verbosity)),
        )
        .init();
}
