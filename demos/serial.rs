use std::env;
use std::path::PathBuf;
use std::time::Duration;

use bsmp_psu::error::TransportError;
use bsmp_psu::property::Binding;
use bsmp_psu::{Config, Facility, Property, PvValue};
use inquire::{Select, Text};
use serialport::SerialPort;
use strum::IntoEnumIterator;
use tracing_subscriber::EnvFilter;

// Short enough that an idle bus reads as "no data yet" instead of stalling the transport.
const SERIAL_TIMEOUT_MS: u64 = 1;
const WRITE_ACK_TIMEOUT_MS: u64 = 2000;
const QUIT: &str = "<quit>";

pub struct PortWrapper(Box<dyn SerialPort>);

#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

fn io_kind(kind: std::io::ErrorKind) -> embedded_io::ErrorKind {
    match kind {
        std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
        std::io::ErrorKind::NotConnected => embedded_io::ErrorKind::NotConnected,
        std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
        std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
        std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
        std::io::ErrorKind::TimedOut => embedded_io::ErrorKind::TimedOut,
        std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
        std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
        std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
        _ => embedded_io::ErrorKind::Other,
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        io_kind(self.0.kind())
    }
}

impl embedded_io::ErrorType for PortWrapper {
    type Error = IoError;
}

impl embedded_io::Read for PortWrapper {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for PortWrapper {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

fn open_port(path: &str, baud_rate: u32) -> Result<PortWrapper, TransportError> {
    serialport::new(path, baud_rate)
        .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
        .open()
        .map(PortWrapper)
        .map_err(|err| {
            let kind = match err.kind() {
                serialport::ErrorKind::NoDevice => embedded_io::ErrorKind::NotFound,
                serialport::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
                serialport::ErrorKind::Io(kind) => io_kind(kind),
                serialport::ErrorKind::Unknown => embedded_io::ErrorKind::Other,
            };
            TransportError::Fault(kind)
        })
}

/// Parse user input for a property: a number, or comma-separated points for waveforms.
fn parse_value(property: Property, input: &str) -> Option<PvValue> {
    if property == Property::WfmSp {
        let points: Result<Vec<f32>, _> = input.split(',').map(|p| p.trim().parse()).collect();
        return points.ok().map(PvValue::Waveform);
    }
    match input.trim().parse::<i64>() {
        Ok(value) => Some(PvValue::Int(value)),
        Err(_) => input.trim().parse::<f64>().ok().map(PvValue::Float),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Configuration file from command line arg, defaulting to ./bsmp.toml
    let path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("bsmp.toml"));
    let config = Config::load(&path).expect("Failed to load configuration");

    let facility = Facility::start(&config, |channel| {
        let port = channel.port.clone();
        let baud_rate = channel.baud_rate;
        println!("Channel {}: {} @ {} baud", channel.name, port, baud_rate);
        move || open_port(&port, baud_rate)
    })
    .expect("Failed to start scan loops");

    loop {
        let mut choices: Vec<&str> = facility.device_names();
        choices.push(QUIT);
        let device = Select::new("Select a device:", choices)
            .prompt()
            .expect("Failed to select device");
        if device == QUIT {
            break;
        }
        let model = facility.device(device).map(|d| d.model).expect("listed device");
        println!(
            "{} is {}",
            device,
            facility.connection_state(device).expect("listed device")
        );

        // Only the properties this model exposes
        let properties: Vec<Property> = Property::iter()
            .filter(|p| Binding::resolve(model, *p).is_some())
            .collect();
        let property = Select::new("Select a property:", properties)
            .prompt()
            .expect("Failed to select property");

        match Binding::resolve(model, property) {
            Some(Binding::Read(_)) => match facility.read(device, property.name()) {
                Ok(reading) => println!("{} = {:?}", property, reading.value),
                Err(err) => println!("{}: {} ({:?})", property, err, err),
            },
            Some(Binding::Write(_)) => {
                let input = Text::new("Value:").prompt().expect("Failed to read value");
                let Some(value) = parse_value(property, &input) else {
                    println!("Could not parse '{}'", input);
                    continue;
                };
                match facility.write_with_ticket(device, property.name(), value) {
                    Ok(ticket) => {
                        match ticket.wait_timeout(Duration::from_millis(WRITE_ACK_TIMEOUT_MS)) {
                            Some(Ok(())) => println!("{} written", property),
                            Some(Err(err)) => println!("{} failed: {}", property, err),
                            None => println!("{} still queued", property),
                        }
                    }
                    Err(err) => println!("{} rejected: {}", property, err),
                }
            }
            None => unreachable!("filtered above"),
        }
    }

    for (channel, stats) in facility.shutdown().expect("Scan thread panicked") {
        println!(
            "{}: {} cycles, avg {}us, max {}us, {} timing violations",
            channel,
            stats.cycle_count,
            stats.average_cycle_time_us(),
            stats.max_cycle_time_us,
            stats.timing_violations
        );
    }
}
