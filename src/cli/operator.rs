//! Operator commands that act on persisted state while the engine is down
//! or through the stop file while it runs

use crate::config::Config;
use crate::recovery::{SessionStatus, SessionStore};
use clap::Args;
use std::path::Path;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Number of crash log entries to show
    #[arg(long, default_value_t = 5)]
    pub crashes: usize,
}

impl StatusArgs {
    pub fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let store = SessionStore::new(&config.recovery.state_dir);
        match store.load()? {
            None => println!("No session state in {}", store.dir().display()),
            Some(state) => {
                println!("Session {}", state.session_id);
                println!("  Status: {:?} (pid {})", state.status, state.pid);
                println!("  Started: {}", state.started_at);
                println!("  Last heartbeat: {}", state.last_heartbeat);
                match &state.halt {
                    Some(halt) => println!(
                        "  Emergency stop: {:?} since {}: {}",
                        halt.source, halt.at, halt.reason
                    ),
                    None => println!("  Emergency stop: clear"),
                }
                println!("  Positions: {}", state.positions.len());
                for position in &state.positions {
                    println!(
                        "    {} x{} @ {} since {}",
                        position.key, position.quantity, position.avg_price, position.opened_at
                    );
                }
                println!("  Active orders: {}", state.active_orders.len());
                for order in &state.active_orders {
                    println!(
                        "    {} {:?} {:?} {} {}/{} {:?}",
                        order.id,
                        order.side,
                        order.kind,
                        order.symbol,
                        order.filled_quantity,
                        order.quantity,
                        order.state
                    );
                }
                if !state.watched_orders.is_empty() {
                    println!("  Watched after failed cancel: {}", state.watched_orders.len());
                    for order in &state.watched_orders {
                        println!(
                            "    {} {:?} {} {}/{} {:?}",
                            order.id,
                            order.side,
                            order.symbol,
                            order.filled_quantity,
                            order.quantity,
                            order.state
                        );
                    }
                }
                println!("  Unresolved gaps: {}", state.gaps.len());
                for gap in &state.gaps {
                    println!("    {}", gap);
                }
            }
        }

        let crashes = store.crash_log(self.crashes)?;
        if !crashes.is_empty() {
            println!("Recent crashes:");
            for crash in crashes {
                println!(
                    "  {} session {} (last heartbeat {})",
                    crash.detected_at, crash.session.session_id, crash.session.last_heartbeat
                );
            }
        }
        if config.emergency.stop_file.exists() {
            println!("Stop file present: {}", config.emergency.stop_file.display());
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct HaltArgs {
    /// Recorded as the halt reason
    #[arg(long, default_value = "operator halt")]
    pub reason: String,
}

impl HaltArgs {
    pub fn execute(&self, config: &Config) -> anyhow::Result<()> {
        write_stop_file(&config.emergency.stop_file, &self.reason)?;
        println!(
            "Stop file written to {}; a running engine halts within {}s",
            config.emergency.stop_file.display(),
            config.emergency.poll_interval_secs
        );
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Also drop unresolved recovery gaps
    #[arg(long)]
    pub clear_gaps: bool,
}

impl ResumeArgs {
    pub fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let store = SessionStore::new(&config.recovery.state_dir);
        let cleared = clear_halt(&store, &config.emergency.stop_file, self.clear_gaps)?;
        if cleared {
            println!("Emergency stop cleared; takes effect on next start");
        } else {
            println!("No emergency stop was set");
        }
        Ok(())
    }
}

pub(crate) fn write_stop_file(path: &Path, reason: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", reason))?;
    Ok(())
}

/// Remove the stop file and any persisted halt. Returns whether either existed.
pub(crate) fn clear_halt(store: &SessionStore, stop_file: &Path, clear_gaps: bool) -> anyhow::Result<bool> {
    let mut cleared = false;
    if stop_file.exists() {
        std::fs::remove_file(stop_file)?;
        cleared = true;
    }

    if let Some(mut state) = store.load()? {
        if state.status == SessionStatus::Running {
            tracing::warn!(
                pid = state.pid,
                "Session is marked running; a live engine keeps its halt until restarted"
            );
        }
        let had_halt = state.halt.take().is_some();
        if clear_gaps {
            state.gaps.clear();
        }
        if had_halt || clear_gaps {
            store.save(&state)?;
        }
        cleared |= had_halt;
    }
    Ok(cleared)
}
