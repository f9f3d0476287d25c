//! # Handshake Self-Test
//!
//! Binds a loopback responder and drives the initiator through the framing
//! and corruption matrix in-process. Exits non-zero if any scenario ends
//! differently than expected.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use kem_handshake::{
    CiphertextFraming, ConcurrencyMode, ConnectionConfig, CorruptionSpec, CorruptionTarget,
    Initiator, InitiatorConfig, ListenConfig, MlKem768Kem, Outcome, ProtocolResult, Responder,
    ServerConfig, CT_LEN,
};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Run the ML-KEM-768 handshake scenario matrix on loopback
#[derive(Parser)]
#[command(name = "kem-handshake")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Handle connections one at a time instead of concurrently
    #[arg(long)]
    serial: bool,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

struct Scenario {
    name: &'static str,
    framing: CiphertextFraming,
    corruption: CorruptionSpec,
    expected: Outcome,
}

fn scenarios() -> Vec<Scenario> {
    use CiphertextFraming::{Bare, Prefixed};
    use CorruptionTarget::{Ciphertext, PublicKey};

    vec![
        Scenario {
            name: "bare ciphertext",
            framing: Bare,
            corruption: CorruptionSpec::none(),
            expected: Outcome::Match,
        },
        Scenario {
            name: "prefixed ciphertext",
            framing: Prefixed,
            corruption: CorruptionSpec::none(),
            expected: Outcome::Match,
        },
        Scenario {
            name: "corrupt ct[0]",
            framing: Bare,
            corruption: CorruptionSpec::new(Ciphertext, 0),
            expected: Outcome::Mismatch,
        },
        Scenario {
            name: "corrupt ct[last], prefixed",
            framing: Prefixed,
            corruption: CorruptionSpec::new(Ciphertext, CT_LEN - 1),
            expected: Outcome::Mismatch,
        },
        Scenario {
            name: "corrupt pk[100]",
            framing: Bare,
            corruption: CorruptionSpec::new(PublicKey, 100),
            expected: Outcome::Mismatch,
        },
        Scenario {
            name: "corrupt pk, wrapped index",
            framing: Prefixed,
            corruption: CorruptionSpec::new(PublicKey, 5000),
            expected: Outcome::Mismatch,
        },
    ]
}

async fn run_matrix(concurrency: ConcurrencyMode) -> ProtocolResult<usize> {
    let matrix = scenarios();
    let config = ServerConfig {
        listen: ListenConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        connection: ConnectionConfig {
            concurrency,
            max_connections: Some(matrix.len() as u64),
            read_timeout_secs: Some(5),
            write_timeout_secs: Some(5),
        },
    };

    let responder = Responder::bind(config, MlKem768Kem::new()).await?;
    let port = responder.local_addr().port();
    let server = tokio::spawn(async move { responder.run().await });

    let mut failures = 0;
    for scenario in &matrix {
        let config = InitiatorConfig {
            port,
            ciphertext_framing: scenario.framing,
            corruption: scenario.corruption,
            connect_timeout: Some(Duration::from_secs(5)),
            io_timeout: Some(Duration::from_secs(5)),
            ..InitiatorConfig::default()
        };

        match Initiator::new(config, MlKem768Kem::new()).run().await {
            Ok(report) if report.outcome == scenario.expected => {
                println!("[ OK ] {:<28} {}", scenario.name, report.outcome);
            }
            Ok(report) => {
                failures += 1;
                println!(
                    "[FAIL] {:<28} {} (expected {})",
                    scenario.name, report.outcome, scenario.expected
                );
            }
            Err(e) => {
                failures += 1;
                println!("[FAIL] {:<28} {} error: {}", scenario.name, e.category(), e);
            }
        }
    }

    match server.await {
        Ok(stats) => info!(
            "Responder served {} connection(s), {} failed",
            stats.accepted, stats.failed
        ),
        Err(e) => error!("Responder task failed: {}", e),
    }

    Ok(failures)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("warning: cannot install logger: {}", e);
    }

    let concurrency = if cli.serial {
        ConcurrencyMode::Serial
    } else {
        ConcurrencyMode::PerConnection
    };

    match run_matrix(concurrency).await {
        Ok(0) => {
            println!("All scenarios behaved as expected");
            ExitCode::SUCCESS
        }
        Ok(failures) => {
            println!("{} scenario(s) failed", failures);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Self-test could not start: {}", e);
            ExitCode::FAILURE
        }
    }
}
