//! Marstek B2500 CLI
//!
//! A command-line interface (CLI) application for reading and configuring
//! Marstek B2500 balcony power station batteries over Bluetooth Low Energy.
//!
//! This tool allows users to:
//! - Scan for nearby devices.
//! - Read device information, runtime status, cell voltages and timer settings.
//! - Set depth of discharge, grid region, adaptive mode and Wi-Fi credentials.
//! - Reboot the device or restore its factory settings.
//! - Continuously monitor the device and save the collected data to disk.
//!
//! The CLI leverages the `b2500_lib` crate for protocol definitions and client operations.

use anyhow::{Context, Result};
use b2500_lib::{
    ble::{self, BleTransport},
    config::Config,
    monitor::{self, Exit},
    store::FileStore,
    tokio_async_client::B2500,
};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use serde::Serialize;
use std::panic;

mod commandline;

use commandline::{CliCommands, Switch};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Cannot format output")?
    );
    Ok(())
}

macro_rules! print_record {
    ($record:expr, $what:literal) => {
        match $record.with_context(|| concat!("Cannot read ", $what))? {
            Some(record) => print_json(&record)?,
            None => println!("No {} available", $what),
        }
    };
}

fn confirm(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

async fn scan(config: &Config) -> Result<()> {
    println!("Scanning for {:?}...", config.scan_timeout);
    let devices = ble::scan(config.scan_timeout)
        .await
        .context("Cannot scan for devices")?;
    if devices.is_empty() {
        println!("No devices found");
    }
    for device in devices {
        println!(
            "{} name={} rssi={}",
            device.id,
            device.name.as_deref().unwrap_or("<unknown>"),
            device.rssi.map_or("?".to_string(), |rssi| rssi.to_string())
        );
    }
    Ok(())
}

async fn run_command(
    client: &B2500<BleTransport>,
    command: &CliCommands,
    config: &Config,
) -> Result<()> {
    match command {
        CliCommands::Scan => unreachable!("Scan should be handled earlier."),
        CliCommands::Info => print_record!(client.get_device_info().await, "device info"),
        CliCommands::Status => print_record!(client.get_runtime_info().await, "runtime info"),
        CliCommands::Cells => print_record!(client.get_cell_voltages().await, "cell data"),
        CliCommands::Timers => print_record!(client.get_timer_settings().await, "timer settings"),
        CliCommands::Ssid => {
            let ssid = client.get_wifi_ssid().await.context("Cannot read SSID")?;
            println!("SSID: {ssid}");
        }
        CliCommands::WifiVersion => {
            let version = client
                .get_wifi_module_version()
                .await
                .context("Cannot read Wi-Fi module version")?;
            println!("Wi-Fi module version: {version}");
        }
        CliCommands::SetDod { percent } => {
            client
                .set_depth_of_discharge(*percent)
                .await
                .context("Cannot set depth of discharge")?;
            println!("Depth of discharge set to {percent}%");
        }
        CliCommands::SetRegion { region } => {
            client
                .set_region(*region)
                .await
                .context("Cannot set region")?;
            println!("Region set to {region}");
        }
        CliCommands::Adaptive { mode } => {
            let enable = *mode == Switch::On;
            client
                .enable_adaptive_mode(enable)
                .await
                .context("Cannot set adaptive mode")?;
            println!("Adaptive mode {}", if enable { "enabled" } else { "disabled" });
        }
        CliCommands::SetWifi { ssid, password } => {
            client
                .set_wifi_config(ssid, password)
                .await
                .context("Cannot set Wi-Fi configuration")?;
            println!("Wi-Fi network set to {ssid}");
        }
        CliCommands::Reboot { yes } => {
            if !confirm("Are you sure you want to reboot the device?", *yes)? {
                info!("Reboot aborted by user.");
                return Ok(());
            }
            client.reboot().await.context("Cannot reboot device")?;
            println!("Reboot command sent");
        }
        CliCommands::FactoryReset { yes } => {
            println!("WARNING: All settings of the device will be lost.");
            if !confirm(
                "Are you sure you want to proceed with the factory reset?",
                *yes,
            )? {
                info!("Factory reset aborted by user.");
                return Ok(());
            }
            client
                .factory_reset()
                .await
                .context("Cannot reset device")?;
            println!("Factory reset command sent");
        }
        CliCommands::Monitor { .. } => {
            let mut store = FileStore::new(&config.data_dir);
            let shutdown = async {
                if let Err(error) = tokio::signal::ctrl_c().await {
                    error!("Cannot listen for Ctrl-C: {error}");
                    std::future::pending::<()>().await;
                }
            };
            let summary = monitor::run(client, &config.monitor, &mut store, shutdown)
                .await
                .context("Monitoring failed")?;
            let reason = match summary.exit {
                Exit::DurationReached => "duration reached",
                Exit::Cancelled => "cancelled",
            };
            println!(
                "Monitoring stopped after {} iterations ({reason})",
                summary.iterations
            );
        }
    }
    Ok(())
}

/// Merges command line overrides into the loaded configuration.
fn apply_overrides(config: &mut Config, args: &commandline::CliArgs) {
    if let Some(address) = &args.address {
        config.address = Some(address.clone());
    }
    if let Some(scan_timeout) = args.scan_timeout {
        config.scan_timeout = scan_timeout;
    }
    if let CliCommands::Monitor {
        duration,
        interval,
        no_save,
        data_dir,
    } = &args.command
    {
        if duration.is_some() {
            config.monitor.duration = *duration;
        }
        if let Some(interval) = interval {
            config.monitor.interval = *interval;
        }
        if *no_save {
            config.monitor.persist = false;
        }
        if let Some(data_dir) = data_dir {
            config.data_dir = data_dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();
    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut config = Config::load(args.config.as_deref()).context("Cannot load configuration")?;
    apply_overrides(&mut config, &args);
    debug!("Using {config:?}");

    if !args.command.needs_connection() {
        return scan(&config).await;
    }

    let transport = BleTransport::connect(config.address.as_deref(), config.scan_timeout)
        .await
        .context("Cannot connect to device")?;
    let client = B2500::connect(transport, config.timeouts)
        .await
        .context("Cannot initialise connection")?;

    let result = run_command(&client, &args.command, &config).await;
    if let Err(error) = client.disconnect().await {
        warn!("Cannot disconnect cleanly: {error}");
    }
    result
}
