mod api;
mod backend;
mod config;
mod error;
mod fs;
mod manifest;
mod poll;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;

use crate::config::MountConfig;

/// Mount a remote collection store as a filesystem.
#[derive(Parser, Debug)]
#[command(name = "harborfs")]
struct Args {
    /// Directory to mount on
    mount_point: std::path::PathBuf,

    /// Base URL of the Harbor API
    #[arg(long, env = "HARBOR_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Resolve only portable data hashes under by_id (no UUIDs, fully
    /// immutable content)
    #[arg(long)]
    pdh_only: bool,

    /// Seconds between background refreshes of remote listings
    #[arg(long, default_value_t = config::DEFAULT_POLL_TIME)]
    poll_time: u64,

    /// Owner UUID to leave out of the shared directory
    #[arg(long)]
    exclude: Option<String>,

    /// Maximum resident inode count before eviction
    #[arg(long, default_value_t = config::DEFAULT_CACHE_CAP)]
    cache_cap: usize,

    /// Inode count eviction never goes below
    #[arg(long, default_value_t = config::DEFAULT_CACHE_MIN_ENTRIES)]
    cache_min_entries: usize,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,
}

#[cfg(feature = "fuse")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    env_logger::init();

    let args = Args::parse();
    let token = std::env::var("HARBOR_API_TOKEN")
        .map_err(|_| "HARBOR_API_TOKEN must be set")?;

    let cfg = MountConfig {
        api_url: args.api_url.clone(),
        api_token: token.clone(),
        pdh_only: args.pdh_only,
        poll_time: args.poll_time,
        exclude: args.exclude.clone(),
        cache_cap: args.cache_cap,
        cache_min_entries: args.cache_min_entries,
        ..MountConfig::default()
    };

    let rt = tokio::runtime::Runtime::new()?;
    let client = api::ApiClient::new(&cfg.api_url, &cfg.api_token);
    let backend: Arc<dyn backend::Backend> =
        Arc::new(backend::HttpBackend::new(client, rt.handle().clone()));

    let user = backend.current_user()?;
    log::info!("mounting as {} ({})", user.full_name, user.uuid);

    let state = Arc::new(Mutex::new(fs::MountState::new(cfg.clone(), &user.uuid)));
    let poll = poll::spawn_poll(
        Arc::downgrade(&state),
        Arc::clone(&backend),
        Duration::from_secs(cfg.poll_time),
    );
    let harborfs = fs::operations::HarborFs::new(state, backend, Some(poll));

    let mut options = vec![
        fuser::MountOption::FSName("harborfs".to_string()),
        fuser::MountOption::DefaultPermissions,
        fuser::MountOption::NoExec,
    ];
    if args.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    fuser::mount2(harborfs, &args.mount_point, &options)?;
    Ok(())
}

#[cfg(not(feature = "fuse"))]
fn main() {
    eprintln!("harborfs was built without the fuse feature");
    std::process::exit(1);
}
