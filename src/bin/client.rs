//! # Handshake Client Binary
//!
//! Runs one handshake against a responder and reports whether both sides
//! derived the same secret.
//!
//! Exit status: 0 match, 1 I/O or protocol error, 2 usage error, 3 mismatch.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use kem_handshake::{
    exit_code_for_error, CiphertextFraming, CorruptionSpec, CorruptionTarget, HandshakeReport,
    Initiator, InitiatorConfig, MlKem768Kem, Outcome,
};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// ML-KEM-768 handshake initiator and mismatch harness
#[derive(Parser)]
#[command(name = "kem-client")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Responder host
    host: String,

    /// Responder port
    port: u16,

    /// Send the optional 2-byte ciphertext length header
    #[arg(long)]
    ct_header: bool,

    /// Field to corrupt before it is used
    #[arg(long, value_enum, default_value_t = CorruptionTarget::None)]
    corrupt: CorruptionTarget,

    /// Byte to flip, modulo the length of the corrupted field
    #[arg(long, value_name = "N", default_value_t = 0)]
    flip_byte: usize,

    /// Connect and I/O deadline in seconds
    #[arg(
        long,
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout: u64,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn print_report(report: &HandshakeReport) {
    println!("ss(initiator)[0..3] = {}", report.local_fingerprint);
    println!("ss(responder)[0..3] = {}", report.peer_fingerprint);

    match report.outcome {
        Outcome::Match => println!("RESULT: MATCH"),
        Outcome::Mismatch if report.mismatch_was_induced() => {
            let index = report.corrupted_index.unwrap_or(report.corruption.byte_index);
            println!(
                "RESULT: MISMATCH (induced by --corrupt={} at byte {})",
                report.corruption.target, index
            );
        }
        Outcome::Mismatch => println!("RESULT: MISMATCH (unexpected, no corruption requested)"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("warning: cannot install logger: {}", e);
    }

    let timeout = Duration::from_secs(cli.timeout);
    let config = InitiatorConfig {
        host: cli.host,
        port: cli.port,
        ciphertext_framing: if cli.ct_header {
            CiphertextFraming::Prefixed
        } else {
            CiphertextFraming::Bare
        },
        corruption: CorruptionSpec::new(cli.corrupt, cli.flip_byte),
        connect_timeout: Some(timeout),
        io_timeout: Some(timeout),
    };

    match Initiator::new(config, MlKem768Kem::new()).run().await {
        Ok(report) => {
            print_report(&report);
            ExitCode::from(report.outcome.exit_code())
        }
        Err(e) => {
            eprintln!("error ({}): {}", e.category(), e);
            if e.is_short_read() {
                eprintln!("note: the responder closed the connection without sending a secret");
            }
            ExitCode::from(exit_code_for_error(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["kem-client", "127.0.0.1", "8081"]).unwrap();
        assert_eq!(cli.timeout, 10);
        assert_eq!(cli.corrupt, CorruptionTarget::None);
        assert_eq!(cli.flip_byte, 0);
        assert!(!cli.ct_header);
    }

    #[test]
    fn test_corruption_flags() {
        let cli = Cli::try_parse_from([
            "kem-client", "host", "9000", "--ct-header", "--corrupt=pk", "--flip-byte=77",
        ])
        .unwrap();
        assert_eq!(cli.corrupt, CorruptionTarget::PublicKey);
        assert_eq!(cli.flip_byte, 77);
        assert!(cli.ct_header);
    }

    #[test]
    fn test_zero_timeout_is_usage_error() {
        let err = Cli::try_parse_from(["kem-client", "h", "1", "--timeout", "0"])
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_negative_flip_byte_is_usage_error() {
        let err = Cli::try_parse_from(["kem-client", "h", "1", "--flip-byte=-1"])
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), 2);
    }
}
