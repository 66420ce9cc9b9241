use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use tradegate::broker::paper::{FaultProfile, PaperBroker};
use tradegate::clock::SystemClock;
use tradegate::config::EngineConfig;
use tradegate::engine::{Engine, EngineParts, OperatorCommand};
use tradegate::feedback::EventDiagnostician;
use tradegate::logging::{self, obj, v_bool, v_num, v_str, Domain};
use tradegate::status_server;
use tradegate::store::open_store;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = EngineConfig::from_env().context("invalid configuration")?;
    logging::info(
        Domain::System,
        "config_loaded",
        obj(&[
            ("profile", v_str(cfg.profile.as_str())),
            ("mode", v_str(cfg.mode.as_str())),
            ("strategy", v_str(cfg.strategy.as_str())),
            ("symbols", Value::from(cfg.symbols.clone())),
            ("cycle_ms", v_num(cfg.cycle_ms as f64)),
        ]),
    );

    let broker =
        PaperBroker::new(&cfg.symbols, cfg.paper_seed).with_faults(FaultProfile::from_env());
    let store = open_store(cfg.store, &cfg.store_dir)
        .with_context(|| format!("cannot open store in {}", cfg.store_dir.display()))?;
    let parts = EngineParts {
        broker: Box::new(broker),
        strategy: cfg.strategy.build(&cfg.exits, &cfg.symbols),
        store,
        feedback: Box::new(EventDiagnostician),
        clock: Arc::new(SystemClock),
    };
    let mut engine = Engine::new(&cfg, parts);
    let boot = engine.boot().context("boot failed")?;
    logging::info(
        Domain::System,
        "engine_ready",
        obj(&[
            ("state", v_str(boot.state.name())),
            ("mode", v_str(boot.mode.as_str())),
            ("restored", v_bool(boot.restored)),
        ]),
    );

    let (tx, mut rx) = mpsc::channel::<OperatorCommand>(16);

    let board = engine.status_board();
    let addr = cfg.status_addr.clone();
    let server_tx = tx.clone();
    tokio::spawn(async move {
        if let Err(e) = status_server::serve(&addr, board, server_tx).await {
            logging::error(
                Domain::System,
                "status_server_failed",
                obj(&[("err", v_str(&e.to_string()))]),
            );
        }
    });

    // Stdin is blocking; read it on its own thread.
    let stdin_tx = tx;
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines().map_while(|l| l.ok()) {
            match OperatorCommand::parse(&line) {
                Some(cmd) => {
                    if stdin_tx.blocking_send(cmd).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => eprintln!(
                    "unknown command: {} (confirm | cancel [reason] | resume | profile <name>)",
                    line.trim()
                ),
            }
        }
    });

    let mut ticker = interval(Duration::from_millis(cfg.cycle_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                logging::info(Domain::System, "shutdown", obj(&[("cause", v_str("ctrl_c"))]));
                break;
            }
            _ = ticker.tick() => {
                while let Ok(cmd) = rx.try_recv() {
                    let name = cmd.as_str();
                    let applied = engine.apply(cmd).context("operator command failed")?;
                    logging::info(
                        Domain::Operator,
                        "command_applied",
                        obj(&[("command", v_str(name)), ("effect", v_bool(applied))]),
                    );
                }
                if let Err(e) = engine.cycle() {
                    logging::error(
                        Domain::System,
                        "fatal",
                        obj(&[("err", v_str(&e.to_string()))]),
                    );
                    return Err(e.into());
                }
            }
        }
    }

    engine.persist().context("final snapshot failed")?;
    Ok(())
}
