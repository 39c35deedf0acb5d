use std::env;
use std::process::exit;
use std::sync::Arc;
use std::thread::{sleep, JoinHandle};
use std::time::Duration;

use getopts::Options;

use meridian::config::Config;
use meridian::dns::context::ServerContext;
use meridian::dns::server::{DnsTcpServer, DnsUdpServer};
use meridian::replication;
use meridian::store::Store;
use meridian::web;

const WORKER_THREADS: usize = 8;

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

/// Main entry point for the Meridian DNS server
fn main() {
    simple_logger::init_with_level(log::Level::Info).expect("failed to initialize logger");

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt("c", "config", "path to the configuration file (yaml)", "PATH");
    opts.optflag("t", "test", "validate the configuration and exit");
    opts.optopt(
        "p",
        "password",
        "print a bcrypt hash for an admin password and exit",
        "PASSWORD",
    );
    opts.optopt(
        "g",
        "gen-token",
        "print a bcrypt hash for an api token and exit",
        "TOKEN",
    );
    opts.optflag("v", "version", "print the version and exit");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("{}", e);
            print_usage(&program, &opts);
            exit(2);
        }
    };

    if matches.opt_present("h") {
        print_usage(&program, &opts);
        return;
    }

    if matches.opt_present("v") {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if let Some(password) = matches.opt_str("p") {
        match bcrypt::hash(&password, bcrypt::DEFAULT_COST) {
            Ok(hash) => {
                println!("Bcrypt hash for '{}':", password);
                println!("{}", hash);
            }
            Err(e) => {
                eprintln!("error generating bcrypt hash: {}", e);
                exit(1);
            }
        }
        return;
    }

    if let Some(token) = matches.opt_str("g") {
        match bcrypt::hash(&token, bcrypt::DEFAULT_COST) {
            Ok(hash) => {
                println!("Bcrypt hash for api token '{}':", token);
                println!("{}", hash);
                println!();
                println!("For a replication slave, keep the plain token in");
                println!("replication.api_token for outgoing requests.");
            }
            Err(e) => {
                eprintln!("error generating bcrypt hash: {}", e);
                exit(1);
            }
        }
        return;
    }

    // Config path precedence: -c/--config, then the environment, then
    // the working directory default.
    let config_path = matches
        .opt_str("c")
        .or_else(|| env::var("MERIDIAN_CONFIG").ok())
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("failed to load config {}: {}", config_path, e);
            exit(1);
        }
    };

    if matches.opt_present("t") {
        println!("Config OK: {}", config_path);
        return;
    }

    let store = match Store::open(&config.db) {
        Ok(store) => store,
        Err(e) => {
            log::error!("failed to open store: {}", e);
            exit(1);
        }
    };
    if let Err(e) = store.migrate() {
        log::error!("failed to migrate store: {}", e);
        exit(1);
    }

    let context = Arc::new(ServerContext::new(config, store));
    let shutdown = context.shutdown.clone();

    for signal in [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ] {
        if let Err(e) = signal_hook::flag::register(signal, shutdown.flag()) {
            log::error!("failed to register signal handler: {}", e);
            exit(1);
        }
    }

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    match DnsUdpServer::new(context.clone(), WORKER_THREADS).run_server() {
        Ok(mut udp_handles) => handles.append(&mut udp_handles),
        Err(e) => {
            log::error!("failed to start udp listener: {}", e);
            exit(1);
        }
    }

    match DnsTcpServer::new(context.clone(), WORKER_THREADS).run_server() {
        Ok(mut tcp_handles) => handles.append(&mut tcp_handles),
        Err(e) => {
            log::error!("failed to start tcp listener: {}", e);
            exit(1);
        }
    }

    match web::start(context.clone()) {
        Ok((handle, _)) => handles.push(handle),
        Err(e) => {
            log::error!("failed to start api service: {}", e);
            exit(1);
        }
    }

    if context.config.is_slave() {
        let sync_config = Arc::new(context.config.clone());
        match replication::start_periodic_sync(sync_config, shutdown.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                log::error!("failed to start replication worker: {}", e);
                exit(1);
            }
        }
    } else if context.config.is_master() {
        log::info!("replication: master mode, serving /sync/export");
    }

    log::info!("meridian {} up", env!("CARGO_PKG_VERSION"));

    while !shutdown.is_triggered() {
        sleep(Duration::from_millis(200));
    }

    log::info!("shutting down");
    if let Some(stop) = context.geo_stop.as_ref() {
        stop.stop();
    }
    for handle in handles {
        let _ = handle.join();
    }
}
