use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::clock::SystemClock;
use crate::landing::CollisionPolicy;
use crate::srv;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:2180";

type Error = Box<dyn std::error::Error + Send + Sync>;

/// Stores files uploaded with `PUT /up?name=<name>` under
/// ROOT_DIR/YYYY/MM/DD/HHMMSS.NNNNNNNNN_<name>
#[derive(Parser, Debug)]
#[command(name = "intake-server", version, about, long_about = None)]
pub struct Args {
    /// Directory the date partitions are created in
    pub root_dir: PathBuf,

    /// Listen on address ADDR having format host:port
    #[arg(long, value_name = "ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_on: String,

    /// Refuse an upload whose final name already exists instead of replacing it
    #[arg(long)]
    pub no_clobber: bool,

    /// Partition and name files by UTC instead of local time
    #[arg(long)]
    pub utc: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Config {
    pub listen_addr: String,
    pub root_dir: PathBuf,
    pub collision: CollisionPolicy,
    pub utc: bool,
}

/// Ok if the directory can hold uploads. A missing directory is fine, the
/// first upload creates it.
fn check_root_dir(path: &Path) -> Result<(), Error> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::warn!(
                "{} does not exist yet, it will be created on the first upload",
                path.display()
            );
            return Ok(());
        }
        Err(e) => return Err(format!("Unable to inspect {}: {}", path.display(), e).into()),
    };
    if !metadata.is_dir() {
        return Err(format!("{} is not a directory", path.display()).into());
    }
    if metadata.permissions().readonly() {
        return Err(format!("Directory {} is not writable", path.display()).into());
    }

    Ok(())
}

impl Config {
    pub fn from_args(args: Args) -> Result<Config, Error> {
        let root_dir = std::path::absolute(&args.root_dir).map_err(|e| {
            format!(
                "Unable to resolve absolute path from '{}', error '{}'.",
                args.root_dir.display(),
                e
            )
        })?;
        check_root_dir(&root_dir)?;

        let collision = if args.no_clobber {
            CollisionPolicy::Reject
        } else {
            CollisionPolicy::Overwrite
        };

        Ok(Config {
            listen_addr: args.listen_on,
            root_dir,
            collision,
            utc: args.utc,
        })
    }

    pub fn make_server(&self) -> Result<srv::Srv, Error> {
        let http = tiny_http::Server::http(self.listen_addr.as_str())
            .map_err(|e| format!("Unable to listen on '{}': {}", self.listen_addr, e))?;

        let intake = srv::Intake::new(
            self.root_dir.clone(),
            Box::new(SystemClock { utc: self.utc }),
            self.collision,
        );

        Ok(srv::Srv::new(http, intake))
    }
}
