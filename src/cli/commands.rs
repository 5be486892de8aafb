use clap::{Arg, ArgAction, ArgMatches, Command};
use log::info;

use crate::config::SimulationConfig;
use crate::devices::{MeasurementSource, SensorKind};
use crate::modbus::RegisterAssignment;
use crate::output::formatters::{NmeaEncoder, TelegramEncoder};
use crate::output::senders::to_register_value;
use crate::services::scheduler::route;
use crate::utils::error::SimulationError;

pub fn build_cli() -> Command {
    Command::new("crane_sim")
        .version(crate::VERSION)
        .about("Crane instrumentation simulator: Modbus holding registers and NMEA telegrams")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file")
                .global(true),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("ADDR")
                .help("Address both servers bind to")
                .global(true),
        )
        .arg(
            Arg::new("register-port")
                .long("register-port")
                .value_name("PORT")
                .help("Modbus TCP port")
                .global(true),
        )
        .arg(
            Arg::new("telegram-port")
                .long("telegram-port")
                .value_name("PORT")
                .help("NMEA telegram streaming port")
                .global(true),
        )
        .arg(
            Arg::new("interval-ms")
                .long("interval-ms")
                .value_name("MS")
                .help("Tick interval in milliseconds")
                .global(true),
        )
        .arg(
            Arg::new("sensors")
                .long("sensors")
                .value_name("N")
                .help("Number of register-backed temperature sensors")
                .global(true),
        )
        .arg(
            Arg::new("max-clients")
                .long("max-clients")
                .value_name("N")
                .help("Maximum concurrent telegram clients")
                .global(true),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_name("SEED")
                .help("Seed for reproducible values")
                .global(true),
        )
        .arg(
            Arg::new("ticks")
                .long("ticks")
                .value_name("N")
                .help("Stop after N ticks")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(Command::new("run").about("Run the simulation (default)"))
        .subcommand(Command::new("sample").about("Generate one tick and print registers and telegrams"))
        .subcommand(Command::new("show-config").about("Print the effective configuration as TOML"))
}

/// Runs one-shot subcommands. Returns `Ok(false)` when the simulation itself
/// should run.
pub async fn handle_subcommands(
    matches: &ArgMatches,
    config: &SimulationConfig,
) -> Result<bool, SimulationError> {
    match matches.subcommand_name() {
        Some("show-config") => {
            print!("{}", config.to_toml()?);
            Ok(true)
        }
        Some("sample") => {
            info!("🎲 Generating one sample tick...");
            print_sample(config)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn print_sample(config: &SimulationConfig) -> Result<(), SimulationError> {
    let channels = config.channels();
    let register_sensors: Vec<_> = channels
        .iter()
        .filter(|c| c.kind == SensorKind::Temperature)
        .map(|c| c.id)
        .collect();
    let assignment = RegisterAssignment::contiguous(config.register_base, &register_sensors)?;
    let spec = config.telegram_spec()?;

    let batch = MeasurementSource::new(config.seed).generate(&channels, 1);
    let (registers, telegrams) = route(&batch, &assignment, spec.kind.sensor_kind());

    println!("📊 Holding registers:");
    for measurement in &registers {
        if let Some(address) = assignment.address_of(measurement.sensor_id) {
            println!(
                "   HR[{}] = {} ({} {})",
                address,
                to_register_value(measurement.value)?,
                measurement.sensor_id,
                measurement.kind.unit()
            );
        }
    }

    println!("📡 Telegrams:");
    let encoder = NmeaEncoder;
    for measurement in &telegrams {
        let frame = encoder.encode(spec.talker, spec.kind, &spec.fields(measurement.value))?;
        print!("   {}", String::from_utf8_lossy(&frame));
    }
    Ok(())
}
