#![deny(clippy::all, warnings)]

use std::io::Write;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use depot_store::{
    add_perm_root, build_log_exact, open_store, LocalStoreConfig, RootsRegistry, Store,
    StoreDefaults, StoreParams, StorePath,
};
use serde_json::json;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = DepotCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let defaults = match &cli.root {
        Some(root) => StoreDefaults::rooted(root),
        None => StoreDefaults::system(),
    };
    let params: StoreParams = cli.option.iter().cloned().collect();
    let store = open_store(&cli.store, &params, &defaults)
        .map_err(|err| eyre!("cannot open store {}: {err:#}", cli.store))?;

    match &cli.command {
        Command::Info => info(store.as_ref(), cli.json),
        Command::AddRoot { store_path, out } => {
            let store_path = parse_store_path(store.as_ref(), store_path)?;
            let out = std::path::absolute(out)
                .wrap_err("cannot resolve the root location to an absolute path")?;
            let root = add_perm_root(store.as_ref(), &store_path, &out)
                .map_err(|err| eyre!("{err:#}"))?;
            if cli.json {
                println!("{}", json!({ "gc-root": root }));
            } else {
                println!("{}", root.display());
            }
            Ok(())
        }
        Command::GcRoots => {
            // The registry is a filesystem artifact under the state
            // directory, readable without a daemon.
            let config = LocalStoreConfig::from_params(&params, &defaults);
            let registry = RootsRegistry::open(&config.state_dir, &config.real_store_dir)
                .map_err(|err| eyre!("{err:#}"))?;
            let roots = registry.live_roots().map_err(|err| eyre!("{err:#}"))?;
            if cli.json {
                println!("{}", json!(roots));
            } else {
                for root in roots {
                    println!("{}", root.display());
                }
            }
            Ok(())
        }
        Command::Log { store_path } => {
            let store_path = parse_store_path(store.as_ref(), store_path)?;
            match build_log_exact(store.as_ref(), &store_path).map_err(|err| eyre!("{err:#}"))? {
                Some(log) => {
                    print!("{log}");
                    Ok(())
                }
                None => Err(eyre!("no build log for {store_path}")),
            }
        }
        Command::Dump { store_path, out } => {
            let store_path = parse_store_path(store.as_ref(), store_path)?;
            let archive = store
                .nar_from_path(&store_path)
                .map_err(|err| eyre!("{err:#}"))?;
            match out {
                Some(path) => std::fs::write(path, archive)
                    .wrap_err_with(|| format!("cannot write archive to {}", path.display()))?,
                None => std::io::stdout()
                    .write_all(&archive)
                    .wrap_err("cannot write archive to stdout")?,
            }
            Ok(())
        }
    }
}

#[derive(Parser)]
#[command(name = "depot", version, about = "Query and manage depot stores")]
struct DepotCli {
    /// Store URI (local://, unix://, ssh-ng://, mounted-ssh://).
    #[arg(long, global = true, env = "DEPOT_STORE", default_value = "local://")]
    store: String,

    /// Root directory for store layout defaults.
    #[arg(long, global = true, env = "DEPOT_ROOT")]
    root: Option<PathBuf>,

    /// Store parameter as key=value; may be repeated.
    #[arg(long, global = true, value_parser = parse_key_val)]
    option: Vec<(String, String)>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Enable trace-level logging.
    #[arg(long, global = true)]
    trace: bool,

    /// Emit machine-readable JSON instead of plain text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the store URI, directories and capabilities.
    Info,
    /// Register a permanent GC root for a store path.
    AddRoot {
        /// Store object name or absolute store path.
        store_path: String,
        /// Where to create the root symlink.
        #[arg(long, default_value = "result")]
        out: PathBuf,
    },
    /// List registered GC roots whose symlinks still resolve into the store.
    GcRoots,
    /// Print the build log for a store path.
    Log { store_path: String },
    /// Write a store object as a canonical archive.
    Dump {
        store_path: String,
        /// Output file; stdout when omitted.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn info(store: &dyn Store, as_json: bool) -> Result<()> {
    let mut capabilities = Vec::new();
    if store.as_filesystem().is_some() {
        capabilities.push("filesystem");
    }
    if store.as_gc_root_store().is_some() {
        capabilities.push("gc-roots");
    }
    if store.as_log_access().is_some() {
        capabilities.push("build-logs");
    }
    if store.as_remote().is_some() {
        capabilities.push("remote");
    }

    if as_json {
        let mut doc = json!({
            "uri": store.uri(),
            "store-dir": store.store_dir(),
            "capabilities": capabilities,
        });
        if let Some(fs_access) = store.as_filesystem() {
            doc["real-store-dir"] = json!(fs_access.real_store_dir());
        }
        println!("{doc}");
        return Ok(());
    }

    println!("uri: {}", store.uri());
    println!("store-dir: {}", store.store_dir().display());
    if let Some(fs_access) = store.as_filesystem() {
        println!("real-store-dir: {}", fs_access.real_store_dir().display());
    }
    println!("capabilities: {}", capabilities.join(", "));
    Ok(())
}

/// Accept either a bare object name or an absolute path inside the store.
fn parse_store_path(store: &dyn Store, raw: &str) -> Result<StorePath> {
    if raw.starts_with('/') {
        store
            .parse_store_path(std::path::Path::new(raw))
            .map_err(|err| eyre!("{err}"))
    } else {
        StorePath::new(raw).map_err(|err| eyre!("{err}"))
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("depot_store={level},depot={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
