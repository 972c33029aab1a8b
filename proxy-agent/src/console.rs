//! Terminal dashboard: prints each transaction and a periodic statistics line.

use chrono::Local;
use proxy_core::{
    ListenerError, ObservingProxy, StatsSnapshot, Transaction, TransactionListener,
};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// Bodies at or above this many bytes are summarized instead of printed.
pub const MAX_BODY_DISPLAY: usize = 1000;
const QUEUE_DEPTH: usize = 256;

/// Hands transactions to the render task without blocking the request path.
pub struct ConsoleListener {
    tx: mpsc::Sender<Transaction>,
}

impl TransactionListener for ConsoleListener {
    fn on_transaction(&self, txn: &Transaction) -> Result<(), ListenerError> {
        self.tx.try_send(txn.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ListenerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ListenerError::Closed,
        })
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Register the console listener on `proxy` and start rendering.
pub fn spawn_console(
    proxy: &ObservingProxy,
    stats_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::channel(QUEUE_DEPTH);
    proxy.add_listener(std::sync::Arc::new(ConsoleListener { tx }));

    let proxy = proxy.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(stats_interval);
        ticker.tick().await;
        let mut last_total = 0;
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(txn) => print!("{}", format_transaction(&txn)),
                    None => break,
                },
                _ = ticker.tick() => {
                    let stats = proxy.statistics();
                    if stats.total_connections != last_total {
                        last_total = stats.total_connections;
                        println!("{}", format_stats(&stats));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Console dashboard stopped");
    })
}

/// Box-drawn summary of one exchange.
pub fn format_transaction(txn: &Transaction) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n╭─ {} {}", txn.method, txn.url);
    let _ = writeln!(out, "├─ From: {}", txn.remote_addr);
    let _ = writeln!(
        out,
        "├─ Time: {}",
        txn.timestamp.with_timezone(&Local).format("%H:%M:%S")
    );

    if !txn.headers.is_empty() {
        let _ = writeln!(out, "├─ Headers:");
        let mut names: Vec<&String> = txn.headers.keys().collect();
        names.sort();
        for name in names {
            let _ = writeln!(out, "│  {}: {}", name, txn.headers[name]);
        }
    }

    if !txn.body.is_empty() {
        if txn.body.len() < MAX_BODY_DISPLAY {
            let _ = writeln!(out, "├─ Body:");
            for line in txn.body.lines() {
                let _ = writeln!(out, "│  {}", line);
            }
        } else {
            let _ = writeln!(
                out,
                "├─ Body: [{} bytes - too large to display]",
                txn.body.len()
            );
        }
    }

    let icon = if txn.is_error() || txn.aborted { "✗" } else { "✓" };
    let _ = write!(
        out,
        "╰─ {} {} • {:.0}ms • {} bytes",
        icon,
        txn.status_code,
        txn.duration_ms(),
        txn.response.size
    );
    if txn.aborted {
        out.push_str(" • client disconnected");
    }
    out.push('\n');
    out
}

pub fn format_stats(stats: &StatsSnapshot) -> String {
    format!(
        "── total {} • open {} • avg 1m {:.1}ms • avg 5m {:.1}ms • p50 {:.1}ms • p90 {:.1}ms",
        stats.total_connections,
        stats.open_connections,
        stats.avg_response_time_1m,
        stats.avg_response_time_5m,
        stats.p50_response_time,
        stats.p90_response_time
    )
}
