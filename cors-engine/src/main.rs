//! Entry point: parses CLI flags, loads the `key = value` config file plus
//! its CSV side files, wires up the nine subsystems leaf-first, and then
//! drives the interactive console from stdin until a `shutdown` command or
//! EOF.

mod agent;
mod config;
mod delaunay;
mod errors;
mod ingest;
mod kernels;
mod monitor;
mod pnt;
mod registry;
mod rtcm_decoder;
mod solver;
mod store;
mod supervisor;
mod vrs;

use clap::Parser;
use config::{Cli, CorsOptions};
use cors_types::{Ecef, SourceKind};
use ingest::{IngestClientConfig, IngestPool};
use kernels::{FloatDdEngine, GaussNewtonPnt, KeplerianGeometry, NoopRinexSink, Saastamoinen};
use registry::{NewSource, StationRegistry};
use solver::SolverPool;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use vrs::VrsEngine;

/// Everything the console and the startup sequencer need a handle to.
/// Built once in `main`, then shared behind `Arc` with every subsystem task.
struct Engine {
    registry: Arc<StationRegistry>,
    store: Arc<store::ObservationStore>,
    solver: Arc<SolverPool>,
    supervisor: Arc<Supervisor>,
    net: Arc<RwLock<delaunay::DelaunayNetwork>>,
    vrs: Arc<VrsEngine>,
    ingest: Arc<IngestPool>,
    agent: Arc<agent::Agent>,
    station_info: Arc<RwLock<Vec<config::StationInfoRow>>>,
    opts: CorsOptions,
}

fn init_tracing(trace_level: u8, trace_file: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = match trace_level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("cors_engine={level}")));

    if trace_file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    } else {
        let path = std::path::Path::new(trace_file);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("cors-engine.log");
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(non_blocking).init();
        Some(guard)
    }
}

/// CSV side files load before any subsystem starts accepting network I/O;
/// subsystems then start leaf-first.
async fn build_engine(opts: CorsOptions) -> anyhow::Result<Engine> {
    let sources = config::load_sources_csv(&opts.ntrip_sources_file)?;
    let baselines = config::load_baselines_csv(&opts.baselines_file)?;
    let station_rows = config::load_station_info_csv(&opts.bstas_info_file)?;
    let vstas = config::load_virtual_stations_csv(&opts.vstas_file)?;
    let users = config::load_users_csv(&opts.agent_user_file)?;

    let registry = Arc::new(StationRegistry::new());
    let store = Arc::new(store::ObservationStore::new());
    let decoder = Arc::new(rtcm_decoder::RtcmDecoderPool::new());

    let rtk_engine: Arc<dyn kernels::RtkEngine> = Arc::new(FloatDdEngine::default());
    let solver = Arc::new(SolverPool::new(store.clone(), rtk_engine, solver::SyncMode::Wait));

    let (fanout_tx, fanout_rx) = tokio::sync::mpsc::unbounded_channel::<cors_types::RtcmFanout>();

    let geom: Arc<dyn kernels::SatelliteGeometry> = Arc::new(KeplerianGeometry);
    let tropo: Arc<dyn kernels::TroposphereModel> = Arc::new(Saastamoinen);
    let rinex: Arc<dyn kernels::RinexSink> = Arc::new(NoopRinexSink);
    let vrs = Arc::new(VrsEngine::new(
        store.clone(),
        solver.clone(),
        geom.clone(),
        tropo,
        rinex,
        fanout_tx.clone(),
        false,
    ));

    let (sup, net) = Supervisor::spawn(store.clone(), solver.clone(), vrs.clone());
    let supervisor = Arc::new(sup);

    let pnt_solver: Arc<dyn kernels::PntSolver> = Arc::new(GaussNewtonPnt::default());
    let pnt_queue = pnt::spawn(store.clone(), pnt_solver, geom);

    let ingest = IngestPool::new(decoder.clone(), store.clone(), registry.clone(), supervisor.clone(), pnt_queue, fanout_tx.clone());

    let agent = agent::Agent::new(registry.clone(), store.clone(), users.into_iter().map(|u| (u.user, u.passwd)).collect());
    agent.spawn_fanout(fanout_rx);

    // Register physical sources first so their ids exist before baselines
    // or virtual-station placement reference them.
    for row in &sources {
        match registry
            .add(NewSource {
                name: row.name.clone(),
                addr: row.addr.clone(),
                port: row.port,
                user: row.user.clone(),
                passwd: row.passwd.clone(),
                mntpnt: row.mntpnt.clone(),
                pos: row.pos,
                kind: SourceKind::Physical,
            })
            .await
        {
            Ok(id) => {
                supervisor.add_source(id, row.pos);
                ingest
                    .add_source(IngestClientConfig {
                        source: id,
                        name: row.name.clone(),
                        addr: row.addr.clone(),
                        port: row.port,
                        user: row.user.clone(),
                        passwd: row.passwd.clone(),
                        mntpnt: row.mntpnt.clone(),
                        approx_pos: row.pos,
                    })
                    .await;
            }
            Err(e) => warn!(source = %row.name, error = %e, "failed to register configured source"),
        }
    }

    for row in &vstas {
        match registry
            .add(NewSource {
                name: row.name.clone(),
                addr: String::new(),
                port: 0,
                user: String::new(),
                passwd: String::new(),
                mntpnt: row.name.clone(),
                pos: row.pos,
                kind: SourceKind::Virtual,
            })
            .await
        {
            Ok(id) => supervisor.add_virtual_station(id, row.name.clone(), row.pos),
            Err(e) => warn!(vsta = %row.name, error = %e, "failed to register configured virtual station"),
        }
    }

    for row in &baselines {
        add_configured_baseline(&registry, &solver, &row.base, &row.rover).await;
    }

    Ok(Engine {
        registry,
        store,
        solver,
        supervisor,
        net,
        vrs,
        ingest,
        agent,
        station_info: Arc::new(RwLock::new(station_rows)),
        opts,
    })
}

async fn add_configured_baseline(registry: &Arc<StationRegistry>, solver: &Arc<SolverPool>, base: &str, rover: &str) {
    let (Some(base_id), Some(rover_id)) = (registry.lookup_by_name(base).await, registry.lookup_by_name(rover).await) else {
        warn!(%base, %rover, "baselines-file references unknown source (no-op, logged)");
        return;
    };
    let (Some(base_info), Some(rover_info)) = (registry.lookup_by_id(base_id).await, registry.lookup_by_id(rover_id).await) else {
        return;
    };
    solver.add_baseline(base_id, rover_id, base_info.pos, rover_info.pos).await;
}

/// The HTTP monitor, agent listener, and ingest clients all
/// start only after every leaf subsystem above them is populated.
async fn start_network_surface(engine: &Engine) {
    let monitor_state = monitor::MonitorState {
        registry: engine.registry.clone(),
        store: engine.store.clone(),
        solver: engine.solver.clone(),
        station_info: engine.station_info.clone(),
        net: engine.net.clone(),
    };
    monitor::spawn(format!("0.0.0.0:{}", engine.opts.monitor_port), monitor_state);
    engine.agent.spawn_listener(format!("0.0.0.0:{}", engine.opts.agent_port));
    info!("subsystems started: registry, store, decoder pool, delaunay network, solver pool, supervisor, vrs, ingest, agent, monitor");
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let opts = match &cli.config {
        Some(path) => match config::load_options(path) {
            Ok(opts) => opts,
            Err(e) => {
                // malformed startup config is also fatal; exit code -1
                eprintln!("fatal: {e}");
                std::process::exit(255); // -1 as an 8-bit exit code
            }
        },
        None => CorsOptions::default(),
    };

    let _trace_guard = init_tracing(cli.trace_level, &opts.trace_file);
    info!(version = env!("CARGO_PKG_VERSION"), "cors-engine starting");

    let engine = match build_engine(opts).await {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            std::process::exit(255);
        }
    };

    if cli.start {
        start_network_surface(&engine).await;
    } else {
        info!("engine built; waiting for `start` console command");
    }

    run_console(engine, cli.start).await;
}

/// The interactive console: a line loop over stdin,
/// tokenized with a plain whitespace split (no quoting in the grammar),
/// dispatching onto each subsystem's control-plane handle.
async fn run_console(engine: Engine, already_started: bool) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut started = already_started;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break, // EOF
            Err(e) => {
                warn!(error = %e, "console read error");
                break;
            }
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = words.first() else { continue };

        match cmd {
            "start" => {
                if !started {
                    start_network_surface(&engine).await;
                    started = true;
                }
            }
            "stop" => {
                info!("console: stop (subsystems continue draining in-flight work)");
            }
            "shutdown" => {
                info!("console: shutdown");
                engine.supervisor.shutdown().await;
                break;
            }
            "addsource" => handle_addsource(&engine, &words).await,
            "delsource" => handle_delsource(&engine, &words).await,
            "addvsta" => handle_addvsta(&engine, &words).await,
            "delvsta" => handle_delvsta(&engine, &words).await,
            "adduser" => {
                if let [_, user, pass] = words[..] {
                    if !engine.agent.add_user(user.to_string(), pass.to_string()).await {
                        debug!(%user, "adduser: user already exists, no-op");
                    }
                } else {
                    println!("usage: adduser <u> <p>");
                }
            }
            "deluser" => {
                if let [_, user] = words[..] {
                    engine.agent.del_user(user).await;
                } else {
                    println!("usage: deluser <u>");
                }
            }
            "rtkpos" => handle_rtkpos(&engine, &words).await,
            "observ" => handle_observ(&engine, &words).await,
            "satellite" => println!("satellite: see /sourceinfo on the monitor port for per-source satellite counts"),
            "navidata" => handle_navidata(&engine, &words).await,
            "sourceinfo" => handle_sourceinfo(&engine, &words).await,
            "monirtcm" => println!("monirtcm: see the monitor HTTP API for RTCM message counters"),
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }
    info!("console loop exited");
}

async fn handle_addsource(engine: &Engine, words: &[&str]) {
    let [_, name, addr, port, mntpnt, user, passwd, lat, lon, h] = words else {
        println!("usage: addsource <name> <addr> <port> <mntpnt> <user> <passwd> <lat> <lon> <h>");
        return;
    };
    let (Ok(port), Ok(lat), Ok(lon), Ok(h)) = (port.parse::<u16>(), lat.parse::<f64>(), lon.parse::<f64>(), h.parse::<f64>()) else {
        println!("addsource: malformed numeric field");
        return;
    };
    let pos = cors_types::Geodetic { lat: lat.to_radians(), lon: lon.to_radians(), height: h }.to_ecef();
    match engine
        .registry
        .add(NewSource {
            name: name.to_string(),
            addr: addr.to_string(),
            port,
            user: user.to_string(),
            passwd: passwd.to_string(),
            mntpnt: mntpnt.to_string(),
            pos,
            kind: SourceKind::Physical,
        })
        .await
    {
        Ok(id) => {
            engine.supervisor.add_source(id, pos);
            engine
                .ingest
                .add_source(IngestClientConfig {
                    source: id,
                    name: name.to_string(),
                    addr: addr.to_string(),
                    port,
                    user: user.to_string(),
                    passwd: passwd.to_string(),
                    mntpnt: mntpnt.to_string(),
                    approx_pos: pos,
                })
                .await;
            println!("source {name} added as id {}", id.0);
        }
        Err(e) => println!("addsource failed: {e}"),
    }
}

async fn handle_delsource(engine: &Engine, words: &[&str]) {
    let [_, name] = words else {
        println!("usage: delsource <name>");
        return;
    };
    match engine.registry.del(name).await {
        Ok(info) => {
            engine.ingest.remove_source(info.id).await;
            engine.supervisor.del_source(info.id);
            println!("source {name} removed");
        }
        Err(e) => println!("delsource failed: {e}"),
    }
}

async fn handle_addvsta(engine: &Engine, words: &[&str]) {
    let [_, name, x, y, z] = words else {
        println!("usage: addvsta <name> <x> <y> <z>");
        return;
    };
    let (Ok(x), Ok(y), Ok(z)) = (x.parse::<f64>(), y.parse::<f64>(), z.parse::<f64>()) else {
        println!("addvsta: malformed ECEF field");
        return;
    };
    let pos = Ecef::new(x, y, z);
    match engine
        .registry
        .add(NewSource {
            name: name.to_string(),
            addr: String::new(),
            port: 0,
            user: String::new(),
            passwd: String::new(),
            mntpnt: name.to_string(),
            pos,
            kind: SourceKind::Virtual,
        })
        .await
    {
        Ok(id) => {
            engine.supervisor.add_virtual_station(id, name.to_string(), pos);
            println!("virtual station {name} added as id {}", id.0);
        }
        Err(e) => println!("addvsta failed: {e}"),
    }
}

async fn handle_delvsta(engine: &Engine, words: &[&str]) {
    let [_, name] = words else {
        println!("usage: delvsta <name>");
        return;
    };
    match engine.registry.del(name).await {
        Ok(info) => {
            engine.supervisor.del_virtual_station(info.id);
            println!("virtual station {name} removed");
        }
        Err(e) => println!("delvsta failed: {e}"),
    }
}

/// `rtkpos -add/-del/-sol -r <rover> -b <base> [-cycle N] [-timetype T] [-soltype S]`
/// `-cycle`/`-timetype`/`-soltype` only affect the periodic print form
/// of `-sol`, which the console renders immediately rather than scheduling a
/// repeat (this console loop has no per-command timer registry).
async fn handle_rtkpos(engine: &Engine, words: &[&str]) {
    let mut mode = None;
    let mut rover = None;
    let mut base = None;
    let mut i = 1;
    while i < words.len() {
        match words[i] {
            "-add" | "-del" | "-sol" => mode = Some(words[i]),
            "-r" => {
                i += 1;
                rover = words.get(i).copied();
            }
            "-b" => {
                i += 1;
                base = words.get(i).copied();
            }
            "-cycle" | "-timetype" | "-soltype" => {
                i += 1; // accepted and ignored by the immediate-print console
            }
            _ => {}
        }
        i += 1;
    }
    let (Some(mode), Some(rover), Some(base)) = (mode, rover, base) else {
        println!("usage: rtkpos -add/-del/-sol -r <rover> -b <base> [-cycle N] [-timetype T] [-soltype S]");
        return;
    };
    let (Some(rover_id), Some(base_id)) = (engine.registry.lookup_by_name(rover).await, engine.registry.lookup_by_name(base).await) else {
        println!("rtkpos: unknown rover or base station");
        return;
    };
    match mode {
        "-add" => {
            add_configured_baseline(&engine.registry, &engine.solver, base, rover).await;
            println!("baseline {base}->{rover} added");
        }
        "-del" => {
            engine.solver.del_baseline(base_id, rover_id).await;
            println!("baseline {base}->{rover} deleted");
        }
        "-sol" => match engine.solver.latest_solution(base_id, rover_id).await {
            Some(sol) => println!("{base}->{rover}: quality={} time={:.3} enu=({:.3},{:.3},{:.3})", sol.quality, sol.time.0, sol.enu.e, sol.enu.n, sol.enu.u),
            None => println!("{base}->{rover}: no solution yet"),
        },
        _ => unreachable!(),
    }
}

async fn handle_observ(engine: &Engine, words: &[&str]) {
    let Some(&name) = words.get(1) else {
        println!("usage: observ <name> [-nf] [cycle]");
        return;
    };
    let Some(id) = engine.registry.lookup_by_name(name).await else {
        println!("observ: unknown source {name}");
        return;
    };
    match engine.store.latest_obs(id).await {
        Some(epoch) => println!("{name}: {} obs at t={:.3}", epoch.obs.len(), epoch.time.0),
        None => println!("{name}: no observations yet"),
    }
}

async fn handle_navidata(engine: &Engine, words: &[&str]) {
    let Some(&name) = words.get(1) else {
        println!("usage: navidata <name>");
        return;
    };
    let Some(id) = engine.registry.lookup_by_name(name).await else {
        println!("navidata: unknown source {name}");
        return;
    };
    let nav = engine.store.nav_snapshot(id).await;
    println!("{name}: {} gps-family eph, {} glonass eph", nav.gps_family.len(), nav.glonass.len());
}

async fn handle_sourceinfo(engine: &Engine, words: &[&str]) {
    match words.get(1) {
        Some(&"all") | None => {
            for s in engine.registry.all().await {
                println!("{} id={} kind={} mntpnt={}", s.name, s.id.0, s.kind, s.mntpnt);
            }
        }
        Some(&name) => match engine.registry.lookup_by_name(name).await {
            Some(id) => {
                if let Some(info) = engine.registry.lookup_by_id(id).await {
                    println!("{} id={} kind={} mntpnt={} pos=({:.3},{:.3},{:.3})", info.name, info.id.0, info.kind, info.mntpnt, info.pos.x, info.pos.y, info.pos.z);
                }
            }
            None => println!("sourceinfo: unknown source {name}"),
        },
    }
}
