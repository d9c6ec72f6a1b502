//! Periodic polling of runtime and cell data.
//!
//! [`run`] polls the runtime snapshot and the cell voltages once per interval,
//! hands every record to a [`Persistence`] sink and flushes the sink every
//! tenth iteration. The sink is flushed one final time on every exit path:
//! duration reached, shutdown requested or a failing poll.

use crate::response::{CellPack, RuntimeSnapshot};
use crate::store;
use crate::tokio_async_client::B2500;
use crate::tokio_common::Result;
use crate::transport::Transport;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// The sink is flushed after every `FLUSH_EVERY`th iteration.
pub const FLUSH_EVERY: u64 = 10;

/// Receives the records collected while monitoring.
pub trait Persistence {
    fn append_runtime(&mut self, snapshot: &RuntimeSnapshot);
    fn append_cells(&mut self, pack: &CellPack);
    /// Writes everything collected so far.
    fn flush(&mut self) -> std::result::Result<(), store::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MonitorConfig {
    /// Pause between two polls.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub interval: Duration,
    /// Total monitoring time, unbounded if `None`.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub duration: Option<Duration>,
    /// Whether records are handed to the persistence sink.
    pub persist: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            duration: None,
            persist: true,
        }
    }
}

/// Why monitoring stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    DurationReached,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSummary {
    /// Number of started iterations.
    pub iterations: u64,
    pub exit: Exit,
}

/// Monitors the device until the configured duration elapsed or `shutdown`
/// completes.
///
/// Response timeouts are logged and skipped. Any other error ends monitoring
/// and is returned after the final flush.
pub async fn run<T, P, F>(
    client: &B2500<T>,
    config: &MonitorConfig,
    store: &mut P,
    shutdown: F,
) -> Result<MonitorSummary>
where
    T: Transport,
    P: Persistence,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let start = Instant::now();
    let mut iterations = 0;

    let outcome = loop {
        if let Some(duration) = config.duration {
            if start.elapsed() >= duration {
                log::info!("Monitoring completed after {duration:?}");
                break Ok(Exit::DurationReached);
            }
        }

        iterations += 1;
        log::info!("Monitoring iteration {iterations}");

        let polled = tokio::select! {
            _ = &mut shutdown => break Ok(Exit::Cancelled),
            polled = poll(client, config.persist, store) => polled,
        };
        if let Err(error) = polled {
            log::error!("Error during monitoring: {error}");
            break Err(error);
        }

        if config.persist && iterations % FLUSH_EVERY == 0 {
            flush(store);
        }

        tokio::select! {
            _ = &mut shutdown => break Ok(Exit::Cancelled),
            _ = tokio::time::sleep(config.interval) => {}
        }
    };

    if matches!(outcome, Ok(Exit::Cancelled)) {
        log::info!("Monitoring cancelled");
    }
    if config.persist {
        flush(store);
    }
    outcome.map(|exit| MonitorSummary { iterations, exit })
}

async fn poll<T: Transport, P: Persistence>(
    client: &B2500<T>,
    persist: bool,
    store: &mut P,
) -> Result<()> {
    match client.get_runtime_info().await {
        Ok(Some(runtime)) => {
            log::info!("{runtime}");
            if persist {
                store.append_runtime(&runtime);
            }
        }
        Ok(None) => log::warn!("No runtime data available"),
        Err(error) if error.is_timeout() => log::warn!("Runtime info skipped: {error}"),
        Err(error) => return Err(error),
    }

    match client.get_cell_voltages().await {
        Ok(Some(cells)) => {
            log::info!("{cells}");
            if persist {
                store.append_cells(&cells);
            }
        }
        Ok(None) => log::warn!("No cell data available"),
        Err(error) if error.is_timeout() => log::warn!("Cell voltages skipped: {error}"),
        Err(error) => return Err(error),
    }
    Ok(())
}

fn flush<P: Persistence>(store: &mut P) {
    if let Err(error) = store.flush() {
        log::error!("Error saving monitoring data: {error}");
    }
}
