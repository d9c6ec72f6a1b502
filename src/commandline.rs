use b2500_lib::protocol as proto;
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;

fn parse_depth_of_discharge(s: &str) -> Result<u8, String> {
    let value = s
        .parse::<u8>()
        .map_err(|e| format!("Invalid depth of discharge format: {e}"))?;
    proto::DepthOfDischarge::try_from(value)
        .map(|dod| *dod)
        .map_err(|e| e.to_string())
}

fn parse_region(s: &str) -> Result<u8, String> {
    let value = s
        .parse::<u8>()
        .map_err(|e| format!("Invalid region format: {e}"))?;
    proto::Region::try_from(value)
        .map(|region| region as u8)
        .map_err(|e| e.to_string())
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// List nearby devices advertising the B2500 service.
    Scan,

    /// Read and display the device type, id, MAC address and firmware version.
    Info,

    /// Read and display the runtime status: PV inputs, battery, outputs and settings.
    Status,

    /// Read and display the per-cell voltages, temperatures and state of charge.
    Cells,

    /// Read and display the output timer schedule and the adaptive mode settings.
    Timers,

    /// Read and display the SSID of the configured Wi-Fi network.
    Ssid,

    /// Read and display the firmware version of the Wi-Fi module.
    WifiVersion,

    /// Set the depth of discharge in percent (10 to 100).
    SetDod {
        #[arg(value_parser = parse_depth_of_discharge)]
        percent: u8,
    },

    /// Set the grid region.
    /// 0 = EU, 1 = China, 2 = Non-EU.
    #[clap(verbatim_doc_comment)]
    SetRegion {
        #[arg(value_parser = parse_region)]
        region: u8,
    },

    /// Switch the adaptive output mode on or off.
    Adaptive {
        #[arg(value_enum)]
        mode: Switch,
    },

    /// Configure the Wi-Fi network the device connects to.
    SetWifi { ssid: String, password: String },

    /// Reboot the device.
    Reboot {
        /// Do not ask for confirmation.
        #[arg(long)]
        yes: bool,
    },

    /// Restore the factory settings.
    /// **Warning:** This is an irreversible operation.
    #[clap(verbatim_doc_comment)]
    FactoryReset {
        /// Do not ask for confirmation.
        #[arg(long)]
        yes: bool,
    },

    /// Continuously poll runtime and cell data.
    /// Data is saved below the data directory every 10 iterations and on exit.
    /// Press Ctrl-C to stop.
    #[clap(verbatim_doc_comment)]
    Monitor {
        /// Total monitoring time (e.g., "30min", "2h"), unbounded if omitted.
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Interval between two polls (e.g., "10s", "1m").
        #[arg(long, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,

        /// Do not save the collected data.
        #[arg(long)]
        no_save: bool,

        /// Directory the collected data is saved to.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

impl CliCommands {
    /// Returns `false` for the commands that run without a connected device.
    pub fn needs_connection(&self) -> bool {
        !matches!(self, CliCommands::Scan)
    }
}

const fn about_text() -> &'static str {
    "Marstek B2500 CLI - Read and configure Marstek B2500 batteries via Bluetooth LE."
}

#[derive(Parser, Debug)]
#[command(name="b2500", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Configuration file, "b2500.yml" in the working directory is used if present.
    #[arg(global = true, long)]
    pub config: Option<PathBuf>,

    /// Bluetooth address or name of the device.
    /// The first device named like a B2500 is used if omitted.
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub address: Option<String>,

    /// How long to scan for devices.
    /// Examples: "5s", "30s".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub scan_timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }

    #[test]
    fn set_dod_range() {
        let args = CliArgs::try_parse_from(["b2500", "set-dod", "50"]).unwrap();
        assert_eq!(args.command, CliCommands::SetDod { percent: 50 });
        assert!(CliArgs::try_parse_from(["b2500", "set-dod", "5"]).is_err());
        assert!(CliArgs::try_parse_from(["b2500", "set-dod", "150"]).is_err());
    }

    #[test]
    fn only_scan_runs_unconnected() {
        let args = CliArgs::try_parse_from(["b2500", "scan", "--scan-timeout", "5s"]).unwrap();
        assert_eq!(args.command, CliCommands::Scan);
        assert!(!args.command.needs_connection());
        assert_eq!(args.scan_timeout, Some(Duration::from_secs(5)));

        let args = CliArgs::try_parse_from(["b2500", "info"]).unwrap();
        assert!(args.command.needs_connection());
    }

    #[test]
    fn monitor_options() {
        let args = CliArgs::try_parse_from([
            "b2500",
            "monitor",
            "--duration",
            "2h",
            "--interval",
            "30s",
            "--no-save",
            "-a",
            "AA:BB:CC:DD:EE:FF",
        ])
        .unwrap();
        assert_eq!(
            args.command,
            CliCommands::Monitor {
                duration: Some(Duration::from_secs(7200)),
                interval: Some(Duration::from_secs(30)),
                no_save: true,
                data_dir: None,
            }
        );
        assert_eq!(args.address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
    }
}
