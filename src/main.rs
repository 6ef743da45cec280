use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use poolfs::{PoolConfig, config, mount_pool};
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about = "Pool several directory roots behind one mountpoint")]
struct Args {
    /// Backing directory root; repeat to pool several (search order = flag order)
    #[arg(long = "root", required = true, num_args = 1..)]
    roots: Vec<PathBuf>,

    /// Where to mount the pooled namespace
    mountpoint: PathBuf,

    /// Free-space headroom a root must keep before placement falls back
    /// to the fullest-fits root (suffixes k/m/g)
    #[arg(long, default_value = "4G", value_parser = config::parse_limit)]
    mlimit: u64,

    /// Mount through mount(2) instead of fusermount3
    #[arg(long)]
    not_unprivileged: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = match PoolConfig::new(args.roots, args.mlimit) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("poolfs: {e}");
            process::exit(1);
        }
    };

    let mut handle = match mount_pool(
        config,
        args.mountpoint.as_os_str(),
        !args.not_unprivileged,
    )
    .await
    {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("poolfs: mount {}: {e}", args.mountpoint.display());
            process::exit(1);
        }
    };

    tokio::select! {
        res = &mut handle => {
            if let Err(e) = res {
                eprintln!("poolfs: session ended: {e}");
                process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            if let Err(e) = handle.unmount().await {
                eprintln!("poolfs: unmount: {e}");
                process::exit(1);
            }
        }
    }
}
