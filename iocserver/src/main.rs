//! Server process: parse the command line, wire the logging and debug
//! state, build the server and run the poll loop.

use clap::Parser;
use ioccore::backend::MemoryStorage;
use ioccore::debug;
use ioccore::logging;
use ioccore::server::{Server, ServerConfig};
use std::sync::Arc;

const DEFAULT_PORT: u16 = 8556;

#[derive(Parser)]
#[command(name = "iocatcher-server")]
#[command(about = "A memory cache between compute nodes and object storage")]
struct Args {
    /// IP to listen on.
    listen_ip: String,

    /// Port to listen on; the TCP auth channel binds right above it.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Store object data in files on the given persistent memory paths.
    #[arg(short = 'n', long = "nvdimm", value_delimiter = ',')]
    nvdimm: Vec<String>,

    /// Storage backend resource file.
    #[arg(short = 'm', long = "storage-file")]
    storage_file: Option<String>,

    /// Disable the mapping range consistency check.
    #[arg(short = 'c', long = "no-consistency-check")]
    no_consistency_check: bool,

    /// Spin on the completion queue instead of blocking.
    #[arg(short = 'p', long = "active-polling")]
    active_polling: bool,

    /// Disable client authentication.
    #[arg(short = 'a', long = "no-auth")]
    no_auth: bool,

    /// Verbose categories: 'all', '*' or a comma separated list.
    #[arg(short = 'v', long = "verbose")]
    verbose: Option<String>,

    /// Print the per second IO bandwidth.
    #[arg(long = "stats")]
    stats: bool,
}

fn main() {
    let args = Args::parse();

    // IOC_DEBUG applies at startup, the command line takes precedence.
    if let Some(verbose) = &args.verbose {
        debug::set_verbosity(verbose);
    }

    let log = logging::default_logger();

    let mut config = ServerConfig {
        listen_ip: args.listen_ip.clone(),
        nvdimm_mount_paths: args.nvdimm.clone(),
        consistency_check: !args.no_consistency_check,
        active_polling: args.active_polling,
        client_auth: !args.no_auth,
        ..ServerConfig::default()
    };
    if let Some(storage_file) = &args.storage_file {
        config.storage_resource_file = storage_file.clone();
    }

    // The production object store driver plugs in here; the in-memory
    // backend keeps the server usable stand alone.
    let storage = Arc::new(MemoryStorage::new());

    let mut server = match Server::new(&config, args.port, storage, Some(&log)) {
        Ok(server) => server,
        Err(error) => {
            logging::error!(log, "failed to start the server"; "error" => ?error);
            std::process::exit(1);
        }
    };

    if args.stats {
        server.start_stats_thread();
    }

    server.poll();
}
