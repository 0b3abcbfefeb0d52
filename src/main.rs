use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use flowstate_rs::aggregator::{BoundedAggregator, MemoryStats, SessionSummary};
use flowstate_rs::ble::BleTransport;
use flowstate_rs::closed_loop::{EntrainmentController, EntrainmentStats, ThetaState};
use flowstate_rs::config::AppConfig;
use flowstate_rs::handlers::{
    ControlHandler, StatusHandler, StreamHandler, TelemetryHandler, TelemetryStats,
};
use flowstate_rs::protocol::{CONTROL_CHARACTERISTIC, STATUS_CHARACTERISTIC, TELEMETRY_CHARACTERISTIC};
use flowstate_rs::session::{SessionCompletion, SessionState, SessionStateMachine, SessionType};
use flowstate_rs::simulator::{MetricsSimulator, SimulatedDevice};
use flowstate_rs::transport::Transport;
use flowstate_rs::types::{now_ms, ControlCommand, DeviceStatus};

/// Printed as JSON when the session ends.
#[derive(Serialize)]
struct SessionReport {
    completion: SessionCompletion,
    summary: SessionSummary,
    downsampled_buckets: usize,
    memory: MemoryStats,
    telemetry: TelemetryStats,
    entrainment: EntrainmentStats,
    last_status: Option<DeviceStatus>,
}

async fn send(control: &ControlHandler, command: ControlCommand) {
    if let Err(e) = control.send(command.clone()).await {
        error!("Control {command:?} failed: {e}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=flowstate_rs=debug cargo run -- --simulate
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ── Configuration ─────────────────────────────────────────────────────────
    let args: Vec<String> = std::env::args().collect();
    let simulate = args.iter().any(|a| a == "--simulate");
    let config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a file path")?;
            AppConfig::load(path)?
        }
        None => AppConfig::default(),
    };

    // ── Connect ───────────────────────────────────────────────────────────────
    let simulated = simulate.then(|| SimulatedDevice::new(config.simulator.clone()));
    let link: Arc<dyn Transport> = match &simulated {
        Some(device) => {
            info!("Using the built-in headset simulator.");
            Arc::new(device.clone())
        }
        None => {
            info!("Connecting to FlowState headset …");
            let ble = BleTransport::connect_first(&config.ble).await?;
            info!("✅  Connected to: {}", ble.name());
            Arc::new(ble)
        }
    };

    // ── Stream handlers ───────────────────────────────────────────────────────
    let mut telemetry = TelemetryHandler::new(Arc::clone(&link), TELEMETRY_CHARACTERISTIC)
        .on_error(|e| warn!("Telemetry: {e}"));
    let mut status = StatusHandler::new(Arc::clone(&link), STATUS_CHARACTERISTIC, config.status_mode)
        .on_status(|s| {
            if s.error {
                warn!("Device error code {}", s.error_code);
            }
        });
    let mut control = ControlHandler::new(Arc::clone(&link), CONTROL_CHARACTERISTIC);
    telemetry.start().await?;
    status.start().await?;
    control.start().await?;
    if let Some(device) = &simulated {
        device.start_streaming();
    }

    // ── Session ───────────────────────────────────────────────────────────────
    let session = SessionStateMachine::with_tick_period(Duration::from_millis(config.tick_period_ms));
    session.set_config(config.session.clone())?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<SessionCompletion>();
    session.add_state_listener(|change| {
        info!("Session {:?} → {:?}", change.from, change.to);
    });
    session.add_timer_listener(|t| {
        if t.elapsed_seconds % 30 == 0 {
            match t.remaining_seconds {
                Some(left) => info!("Session {} s elapsed, {left} s left", t.elapsed_seconds),
                None => info!("Session {} s elapsed", t.elapsed_seconds),
            }
        }
    });
    session.add_completion_listener(move |done| {
        let _ = done_tx.send(done.clone());
    });

    let session_type = config.session.session_type;
    if session_type != SessionType::Calibration {
        send(&control, ControlCommand::SetFrequency(config.session.target_frequency_hz)).await;
        send(&control, ControlCommand::SetVolume(config.session.target_volume)).await;
    }
    if session_type == SessionType::OpenLoop {
        send(&control, ControlCommand::StartEntrainment).await;
    }
    session.start()?;

    info!("Session started. Type a command + Enter:");
    info!("  p / r  – pause / resume");
    info!("  q      – stop the session");
    if simulated.is_some() {
        info!("  low / normal / high / auto – force the simulated theta state");
    }

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread and relayed to the async loop.
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

    // ── Main loop ─────────────────────────────────────────────────────────────
    // Signal processing is not part of this crate; derived metrics come from
    // the metrics simulator in both modes.
    let mut metrics = MetricsSimulator::new(now_ms());
    let mut aggregator = BoundedAggregator::new(config.aggregator.clone());
    let mut controller = EntrainmentController::new(config.closed_loop.clone());
    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.metrics_interval_ms.max(10)));

    let completion = loop {
        tokio::select! {
            Some(done) = done_rx.recv() => break Some(done),
            _ = ticker.tick() => {
                if session.state() != SessionState::Running {
                    continue;
                }
                let point = metrics.next_point(now_ms());
                aggregator.add_data_point(point);
                if session_type == SessionType::ClosedLoop && !point.is_artifact {
                    if let Some(cmd) = controller.update(point.z_score, point.timestamp_ms) {
                        info!(
                            "Closed loop: {cmd:?} (z={:.2}, {:?})",
                            point.z_score,
                            controller.config().classify(point.z_score)
                        );
                        send(&control, cmd).await;
                    }
                }
            }
            Some(line) = line_rx.recv() => {
                let result = match line.as_str() {
                    "" => continue,
                    "p" => session.pause().map(|_| ()),
                    "r" => session.resume().map(|_| ()),
                    "q" => session.stop().map(|_| ()),
                    "low" | "normal" | "high" | "auto" => {
                        let state = match line.as_str() {
                            "low" => Some(ThetaState::Low),
                            "normal" => Some(ThetaState::Normal),
                            "high" => Some(ThetaState::High),
                            _ => None,
                        };
                        metrics.set_state(state);
                        if let Some(device) = &simulated {
                            device.set_theta_state(state);
                        }
                        info!("Simulated theta state: {state:?}");
                        Ok(())
                    }
                    other => {
                        warn!("Unknown command '{other}'");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    warn!("{e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping session.");
                if let Err(e) = session.stop() {
                    warn!("{e}");
                    break None;
                }
            }
        }
    };

    // ── Wrap up ───────────────────────────────────────────────────────────────
    if let Some(cmd) = controller.force_stop(now_ms()) {
        send(&control, cmd).await;
    }
    if session_type == SessionType::OpenLoop {
        send(&control, ControlCommand::StopEntrainment).await;
    }
    aggregator.flush();
    session.destroy();

    telemetry.stop().await;
    status.stop().await;
    control.stop().await;
    if let Some(device) = &simulated {
        device.stop_streaming();
    }

    if let Some(completion) = completion {
        let report = SessionReport {
            completion,
            summary: aggregator.get_session_summary(),
            downsampled_buckets: aggregator.get_downsampled_data().len(),
            memory: aggregator.get_memory_stats(),
            telemetry: telemetry.stats(),
            entrainment: controller.stats(),
            last_status: status.latest(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    info!("Session finished – exiting.");
    Ok(())
}
