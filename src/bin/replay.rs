//! Offline summary of a store's event log.
//!
//! Usage: replay [STORE_DIR] [json|sqlite] [LIMIT]

use std::path::PathBuf;

use anyhow::{Context, Result};

use tradegate::config::StoreKind;
use tradegate::feedback::{EventDiagnostician, EventStats, Feedback};
use tradegate::store::open_store;

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let dir = PathBuf::from(args.next().unwrap_or_else(|| "storage".to_string()));
    let kind = StoreKind::from_name(&args.next().unwrap_or_else(|| "json".to_string()))?;
    let limit: usize = match args.next() {
        Some(v) => v.parse().with_context(|| format!("bad limit: {}", v))?,
        None => 10_000,
    };

    let store = open_store(kind, &dir)
        .with_context(|| format!("cannot open store in {}", dir.display()))?;
    let events = store.read_events(limit)?;
    let trades = store.read_trades(limit)?;

    let stats = EventStats::from_events(&events);
    let diagnosis = EventDiagnostician.diagnose(&events);

    println!("events: {}", stats.total);
    println!(
        "  no_action={} approved={} blocked={} executed={} failures={}",
        stats.no_action, stats.approved, stats.blocked, stats.executed, stats.failures
    );
    println!(
        "  operator: confirms={} cancels={}  preflight rejections={}",
        stats.operator_confirms, stats.operator_cancels, stats.preflight_rejections
    );
    match stats.win_rate() {
        Some(rate) => println!(
            "trades: wins={} losses={} win_rate={:.1}%",
            stats.wins,
            stats.losses,
            rate * 100.0
        ),
        None => println!("trades: none closed"),
    }
    let pnl: f64 = trades.iter().map(|t| t.pnl).sum();
    println!("realized pnl: {:.4} over {} trade records", pnl, trades.len());

    for (label, map) in [
        ("states", &stats.states),
        ("modes", &stats.modes),
        ("sides", &stats.sides),
        ("exit reasons", &stats.reasons),
    ] {
        if map.is_empty() {
            continue;
        }
        let line: Vec<String> = map.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        println!("{}: {}", label, line.join(" "));
    }

    println!("health: {}", diagnosis.health.as_str());
    for signal in &diagnosis.signals {
        println!("  signal: {}", signal);
    }
    for rec in &diagnosis.recommendations {
        println!("  recommend: {}", rec);
    }
    Ok(())
}
