use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use tokio::sync::mpsc;

use soundmeter_rs::prelude::*;

const HELP: &[&str] = &[
    "Commands (type + Enter):",
    "  c  – connect to the meter",
    "  s  – start measuring",
    "  x  – stop measuring",
    "  d  – disconnect",
    "  h  – show the last readings",
    "  q  – quit",
];

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=soundmeter_rs=debug cargo run
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let args: Vec<String> = std::env::args().skip(1).collect();
    let simulate = args.iter().any(|a| a == "--simulate");
    let scan_timeout = match args.iter().position(|a| a == "--scan-timeout") {
        Some(i) => {
            let secs: u64 = args
                .get(i + 1)
                .context("--scan-timeout needs a value in seconds")?
                .parse()
                .context("--scan-timeout must be a whole number of seconds")?;
            Some(Duration::from_secs(secs))
        }
        None => None,
    };
    let config = SessionConfig {
        scan_timeout,
        ..Default::default()
    };

    let (presenter, events) = ChannelPresenter::new();
    let presenter = Arc::new(presenter);

    if simulate {
        info!("Using the built-in simulated meter.");
        let meter = SimulatedMeter::new("SoundMeter-SIM").with_auto_respond(true);
        run(BleSession::new(meter, presenter, config), events).await
    } else {
        let transport = BtleplugTransport::new().await?;
        run(BleSession::new(transport, presenter, config), events).await
    }
}

async fn run<T: BleTransport>(
    session: BleSession<T>,
    mut events: mpsc::UnboundedReceiver<SoundMeterEvent>,
) -> Result<()> {
    for line in HELP {
        info!("{line}");
    }

    // Stdin is read on a plain thread; a StdinLock must not live across awaits.
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match line.as_str() {
                    "" => {}
                    "c" => {
                        let session = session.clone();
                        // Scanning can take a while; keep printing events meanwhile.
                        tokio::spawn(async move {
                            if let Err(e) = session.connect().await {
                                debug!("connect: {e}");
                            }
                        });
                    }
                    "s" => {
                        if let Err(e) = session.start().await {
                            println!("Cannot start: {e}");
                        }
                    }
                    "x" => session.stop(),
                    "d" => session.disconnect().await,
                    "h" => print_history(&session.snapshot()),
                    "q" => {
                        info!("Quit requested.");
                        break;
                    }
                    other => println!("Unknown command '{other}'. {}", HELP[0]),
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SoundMeterEvent::Log(line) => println!("{line}"),
                    SoundMeterEvent::Reading(r) => {
                        println!("[{:5}] {:5.1} dB(A)", r.sequence, r.value_db);
                    }
                    SoundMeterEvent::History(window) => {
                        if let Some((min, max, avg)) = summarize(&window) {
                            debug!(
                                "window n={} min={min:.1} max={max:.1} avg={avg:.1}",
                                window.len()
                            );
                        }
                    }
                }
            }
        }
    }

    session.disconnect().await;
    info!("Exiting.");
    Ok(())
}

/// `(min, max, mean)` of the window, or `None` when empty.
fn summarize(window: &[Reading]) -> Option<(f64, f64, f64)> {
    if window.is_empty() {
        return None;
    }
    let (min, max, sum) = window.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, 0.0),
        |(min, max, sum), r| (min.min(r.value_db), max.max(r.value_db), sum + r.value_db),
    );
    Some((min, max, sum / window.len() as f64))
}

fn print_history(window: &[Reading]) {
    let Some((min, max, avg)) = summarize(window) else {
        println!("No readings yet.");
        return;
    };
    let recent: Vec<String> = window
        .iter()
        .rev()
        .take(10)
        .rev()
        .map(|r| format!("{:.1}", r.value_db))
        .collect();
    println!(
        "{} reading(s)  min {min:.1}  max {max:.1}  avg {avg:.1} dB(A)  last: {}",
        window.len(),
        recent.join(" ")
    );
}
