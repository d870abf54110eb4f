// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! adiskd — the search server daemon.

use adiskd::search::SearchFactory;
use adiskd::server::{Listener, ServerConfig, OBJECT_CACHE_SIZE};
use adiskd::store::{ObjectCache, DEFAULT_OBJ_DIR};
use adiskd::StopSignal;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    prelude::*,
    registry::Registry,
};

macro_rules! die {
    ($fmt:literal, $($arg:tt)*) => {{
        eprintln!($fmt, $($arg)*);
        std::process::exit(1);
    }};

    ($msg:literal) => {{
        eprintln!($msg);
        std::process::exit(1);
    }};
}

#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

fn init_tracing(silent: bool) {
    // Bridge log crate macros to tracing (library code uses log::*)
    tracing_log::LogTracer::init().expect("Failed to set log tracer");

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("ADISKD_LOG")
        .from_env_lossy();

    let registry = Registry::default();

    let subscriber = registry.with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(move || -> Box<dyn std::io::Write> {
                if silent {
                    Box::new(std::io::sink())
                } else {
                    Box::new(std::io::stderr())
                }
            })
            .compact(),
    );

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        die!("INTERNAL ERROR: setting default tracing::subscriber failed");
    }

    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing_panic::panic_hook(info);
        prev_hook(info); // daisy-chain to old panic hook
    }));
}

/// Server-side worker of an interactive brute-force search platform.
#[derive(Parser)]
#[command(name = "adiskd", version)]
struct Args {
    /// Do not run background tasks
    #[arg(short = 'b')]
    no_background: bool,

    /// Do not run adiskd as a daemon
    #[arg(short = 'd')]
    no_daemon: bool,

    /// Allow background to run when not idle
    #[arg(short = 'i')]
    eager_background: bool,

    /// Only listen on localhost
    #[arg(short = 'l')]
    local_only: bool,

    /// Debugging: do not fork for a new connection, do not daemonize
    #[arg(short = 'n')]
    no_fork: bool,

    /// Do not close stderr on fork
    #[arg(short = 's')]
    not_silent: bool,

    /// Object directory to serve
    #[arg(long, default_value = DEFAULT_OBJ_DIR)]
    dir: PathBuf,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => {
            // help or version
            let _ = e.print();
            std::process::exit(0);
        }
    };

    let config = ServerConfig {
        daemon: !args.no_daemon && !args.no_fork,
        fork_conns: !args.no_fork,
        background: !args.no_background,
        idle_background: !args.eager_background,
        bind_locally: args.local_only,
        not_silent: args.not_silent,
        obj_dir: args.dir.clone(),
        ..ServerConfig::default()
    };

    // daemonization proper (double fork, setsid) is the init system's job;
    // the daemon flag only governs whether stderr stays attached
    let silent = config.daemon && !config.not_silent;
    init_tracing(silent);

    info!("adiskd starting, serving {}", config.obj_dir.display());

    let cache = Arc::new(ObjectCache::new(OBJECT_CACHE_SIZE));
    let factory = Arc::new(SearchFactory::new(&config.obj_dir).with_cache(Arc::clone(&cache)));

    let listener = match Listener::bind_with_cache(config, factory, cache) {
        Ok(listener) => listener,
        Err(e) => die!("Unable to initialize the communications: {e}"),
    };

    if let Err(e) = listener.listen(&StopSignal::default()) {
        die!("listener failed: {e}");
    }
}
