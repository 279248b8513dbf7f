// main.rs — server entry point
//
// The only place a ServerContext is instantiated. Wires logging, CLI
// options, the world load, the tick loop, and the shutdown save.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use ruo_server::config::ServerConfig;
use ruo_server::entity::TypeRegistry;
use ruo_server::events::NullEvents;
use ruo_server::save::resolve_current;
use ruo_server::server::Server;
use ruo_server::world::{LoadFailurePolicy, World};

#[derive(Parser)]
#[command(name = "ruo-server")]
#[command(about = "UO protocol shard server core")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = 2593)]
    port: u16,

    #[arg(long, default_value_t = 50)]
    tick_ms: u64,

    #[arg(long, default_value = "Saves")]
    save_root: PathBuf,

    #[arg(long, default_value_t = 0, help = "Save worker threads (0 = auto)")]
    save_parallelism: usize,

    #[arg(long, help = "Write save pages synchronously instead of in the background")]
    no_background_flush: bool,

    #[arg(long, default_value_t = 3600, help = "Seconds between autosaves (0 = off)")]
    save_interval: u64,

    #[arg(long, help = "Drop records that fail to load instead of aborting")]
    ignore_load_errors: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = ServerConfig {
        endpoints: vec![format!("{}:{}", args.bind, args.port)
            .parse()
            .context("bad bind address")?],
        tick_ms: args.tick_ms,
        save_root: args.save_root,
        save_parallelism: args.save_parallelism,
        background_flush: !args.no_background_flush,
        ..ServerConfig::default()
    };

    let policy = if args.ignore_load_errors {
        LoadFailurePolicy::DeleteRecord
    } else {
        LoadFailurePolicy::Abort
    };

    let mut world = World::new(TypeRegistry::with_defaults());
    if let Some(generation) = resolve_current(&config.save_root) {
        world
            .load(&generation, policy)
            .context("world load failed")?;
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("shutdown requested");
            running.store(false, Ordering::SeqCst);
        })
        .context("install shutdown handler")?;
    }

    let tick = Duration::from_millis(config.tick_ms);
    let save_interval = (args.save_interval > 0).then(|| Duration::from_secs(args.save_interval));

    let mut server = Server::new(config, world, Box::new(NullEvents));
    let mut next_save = save_interval.map(|every| Instant::now() + every);

    info!("server up; ticking every {:?}", tick);

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        server.run_once();

        if let (Some(at), Some(every)) = (next_save, save_interval) {
            if Instant::now() >= at {
                if let Err(e) = server.ctx.save(server.events.as_mut()) {
                    log::error!("autosave failed: {}", e);
                }
                next_save = Some(Instant::now() + every);
            }
        }

        if let Some(rest) = tick.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    info!("saving world before exit");
    if let Err(e) = server.ctx.save(server.events.as_mut()) {
        log::error!("shutdown save failed: {}", e);
    }

    let mut profile_dump = Vec::new();
    if server.ctx.diagnostics.write_all(&mut profile_dump).is_ok() && !profile_dump.is_empty() {
        info!("profiles:\n{}", String::from_utf8_lossy(&profile_dump));
    }

    Ok(())
}
