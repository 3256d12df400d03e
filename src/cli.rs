//! `clap`-derive CLI front-end over the [`crate::rcu::facade::Rcu`] façade:
//! `capture`/`read`/`write`/`monitor` subcommands for driving a session from
//! a terminal instead of embedding the façade in a host program directly.

use crate::rcu::error::RcuError;
use crate::rcu::facade::{Rcu, RcuConfig};
use crate::rcu::registry::{ConfigDocument, Registry};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rcu-emu", version, about = "Room Control Unit protocol emulator")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Passes through the raw byte stream with timestamps, for offline analysis.
    Capture {
        #[arg(long)]
        port: String,
        #[arg(long, default_value_t = 30)]
        duration: u64,
    },
    /// Runs a single read pass and prints the collected parameter table.
    Read {
        #[arg(long)]
        port: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        pump: Option<String>,
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Enqueues a single write request and reports its outcome.
    Write {
        #[arg(long)]
        port: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        pump: Option<String>,
        #[arg(long)]
        index: u8,
        #[arg(long)]
        value: i64,
    },
    /// Runs continuously, printing each decoded value as it arrives.
    Monitor {
        #[arg(long)]
        port: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        pump: Option<String>,
    },
}

/// Process exit codes: 0 success, 1 transport open failure, 2 collection
/// timeout with partial data, 3 configuration error.
pub fn run(cli: Cli) -> i32 {
    match cli.command {
        Command::Capture { port, duration } => run_capture(&port, duration),
        Command::Read { port, config, pump, timeout } => run_read(&port, config, pump, timeout),
        Command::Write { port, config, pump, index, value } => {
            run_write(&port, config, pump, index, value)
        }
        Command::Monitor { port, config, pump } => run_monitor(&port, config, pump),
    }
}

fn load_registry(config: Option<PathBuf>, pump: Option<String>) -> Result<Arc<Registry>, RcuError> {
    match config {
        None => Ok(Arc::new(Registry::built_in())),
        Some(path) => {
            let text = fs::read_to_string(&path)
                .map_err(|e| RcuError::Config(format!("reading {}: {e}", path.display())))?;
            let document = ConfigDocument::from_toml_str(&text)?;
            let pump = pump.ok_or_else(|| {
                RcuError::Config("--pump is required when --config is given".to_string())
            })?;
            Ok(Arc::new(Registry::from_document(&document, &pump)?))
        }
    }
}

fn run_capture(port: &str, duration_secs: u64) -> i32 {
    let registry = Arc::new(Registry::built_in());
    let rcu = match Rcu::open(RcuConfig::new(port, registry)) {
        Ok(rcu) => rcu,
        Err(e) => {
            eprintln!("failed to open {port}: {e}");
            return 1;
        }
    };
    let bytes = rcu.diagnostic_capture(Duration::from_secs(duration_secs));
    let start = bytes.first().map(|b| b.at);
    for b in &bytes {
        let elapsed = start.map(|s| b.at.duration_since(s)).unwrap_or_default();
        match b.tag {
            Some(tag) => println!("{:>8.3}s  {:?}  {:#04x}", elapsed.as_secs_f64(), tag, b.byte),
            None => println!("{:>8.3}s  ?      {:#04x}", elapsed.as_secs_f64(), b.byte),
        }
    }
    rcu.shutdown();
    0
}

fn run_read(port: &str, config: Option<PathBuf>, pump: Option<String>, timeout_secs: u64) -> i32 {
    let registry = match load_registry(config, pump) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 3;
        }
    };
    let expected: HashSet<u8> = registry.indices().collect();
    let rcu = match Rcu::open(RcuConfig::new(port, registry)) {
        Ok(rcu) => rcu,
        Err(e) => {
            eprintln!("failed to open {port}: {e}");
            return 1;
        }
    };
    let result = rcu.run_once(&expected, Duration::from_secs(timeout_secs));
    for (key, value) in &result.values {
        println!("{key:?} = {value:?}");
    }
    rcu.shutdown();
    if result.complete {
        0
    } else {
        eprintln!("collection timed out with partial data");
        2
    }
}

fn run_write(port: &str, config: Option<PathBuf>, pump: Option<String>, index: u8, value: i64) -> i32 {
    let registry = match load_registry(config, pump) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 3;
        }
    };
    let rcu = match Rcu::open(RcuConfig::new(port, registry)) {
        Ok(rcu) => rcu,
        Err(e) => {
            eprintln!("failed to open {port}: {e}");
            return 1;
        }
    };
    let outcome = rcu.request_write(index, value);
    rcu.shutdown();
    match outcome {
        Ok(()) => {
            println!("write to {index:#04x} accepted");
            0
        }
        Err(e) => {
            eprintln!("write to {index:#04x} failed: {e}");
            1
        }
    }
}

fn run_monitor(port: &str, config: Option<PathBuf>, pump: Option<String>) -> i32 {
    let registry = match load_registry(config, pump) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 3;
        }
    };
    let rcu = match Rcu::open(RcuConfig::new(port, registry)) {
        Ok(rcu) => rcu,
        Err(e) => {
            eprintln!("failed to open {port}: {e}");
            return 1;
        }
    };
    let stop = AtomicBool::new(false);
    ctrlc_or_never(&stop);
    rcu.run_forever(&stop, |key, value| {
        println!("{key:?} = {value:?}");
    });
    rcu.shutdown();
    0
}

/// Placeholder hook for wiring a signal handler. Left as a no-op so
/// `monitor` runs until the process itself is killed.
fn ctrlc_or_never(_stop: &AtomicBool) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_registry_without_config_uses_built_in_catalog() {
        let registry = load_registry(None, None).unwrap();
        assert_eq!(registry.definition(0x01).unwrap().name, "Outdoor Temperature");
    }

    #[test]
    fn load_registry_reads_pump_from_configuration_document() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [wph]
            baudrate = 19200
            cmd_data = 0xC0
            master_addr = 0x24
            rcu_addr = 0x14
            ack = 0x06
            enq = 0x05
            nak = 0x15
            etx = 0x03

            [[wph.register]]
            index = 9
            name = "Room Temperature"
            size = 2
            factor = 10.0
            unit = "°C"
            "#
        )
        .unwrap();
        file.flush().unwrap();

        let registry = load_registry(Some(file.path().to_path_buf()), Some("wph".to_string()))
            .unwrap();
        assert_eq!(registry.definition(0x09).unwrap().name, "Room Temperature");
    }

    #[test]
    fn load_registry_requires_pump_name_when_config_given() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [wph]
            baudrate = 19200
            cmd_data = 0xC0
            master_addr = 0x24
            rcu_addr = 0x14
            ack = 0x06
            enq = 0x05
            nak = 0x15
            etx = 0x03
            "#
        )
        .unwrap();
        file.flush().unwrap();

        let err = load_registry(Some(file.path().to_path_buf()), None).unwrap_err();
        assert!(matches!(err, RcuError::Config(_)));
    }

    #[test]
    fn load_registry_reports_missing_file_as_config_error() {
        let err = load_registry(
            Some(PathBuf::from("/nonexistent/rcu-emu-test.toml")),
            Some("wph".to_string()),
        )
        .unwrap_err();
        assert!(matches!(err, RcuError::Config(_)));
    }
}
