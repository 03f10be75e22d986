mod config;
mod connection;
mod consumer;
mod device;

use anyhow::Context;
use config::BridgeSettings;
use connection::ConnectionManager;
use consumer::{CarrierScanner, CyclicOutputWriter, DigitalInputPoller};
use device::SimulatedReader;
use rfid_shared::limits::DIGITAL_INPUT_PINS;
use rfid_shared::{Carrier, NodeEvent, TagField};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let settings = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => {
            info!("Loading settings from {}", path.display());
            BridgeSettings::load(&path).await?
        }
        None => {
            info!("No settings file given, using built-in defaults");
            BridgeSettings::default()
        }
    };

    // Every setting is validated before the first connect attempt
    let connection_config = settings
        .connection
        .to_config()
        .context("invalid connection settings")?;
    let mut input_configs = Vec::new();
    for input in &settings.digital_inputs {
        let config = input
            .to_config()
            .with_context(|| format!("invalid digital input '{}'", input.name))?;
        input_configs.push((input.name.clone(), config));
    }
    let mut scanner_configs = Vec::new();
    for scanner in &settings.scanners {
        let config = scanner
            .to_config()
            .with_context(|| format!("invalid scanner '{}'", scanner.name))?;
        scanner_configs.push((scanner.name.clone(), config));
    }

    let output_length = connection_config.io_link.output_length;
    info!("RFID bridge starting: reader at {}", connection_config.endpoint);

    let reader = SimulatedReader::new();
    let manager = ConnectionManager::new(connection_config, Arc::new(reader.clone()))?;
    manager.subscribe(|change| {
        match (&change.connection, &change.error) {
            (Some(connection), _) => info!("[MAIN] Reader connected ({})", connection.id()),
            (None, Some(error)) if change.connecting => {
                info!("[MAIN] Reconnecting after: {}", error)
            }
            (None, Some(error)) => warn!("[MAIN] Reader disconnected: {}", error),
            (None, None) => info!("[MAIN] Connecting to reader"),
        }
        Ok(())
    });

    let mut pollers = Vec::new();
    for (name, config) in input_configs {
        let poller = DigitalInputPoller::spawn(config, &manager, event_logger(name))?;
        pollers.push(poller);
    }

    let mut writers = Vec::new();
    for output in &settings.cyclic_outputs {
        let sink = event_logger(output.name.clone());
        let writer = CyclicOutputWriter::spawn(output.to_config(), &manager, sink)?;
        writers.push(Arc::new(writer));
    }

    let mut scanners = Vec::new();
    for (name, config) in scanner_configs {
        let scanner = CarrierScanner::spawn(config, &manager, event_logger(name))?;
        scanners.push(Arc::new(scanner));
    }

    debug!("{} subscribers attached", manager.subscriber_count());
    manager.start();

    let simulation = tokio::spawn(drive_simulation(
        reader.clone(),
        writers.clone(),
        scanners.clone(),
        output_length,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("Shutting down");
    simulation.abort();
    if let Some(connection) = manager.state().connection() {
        info!("Releasing reader connection {}", connection.id());
    }

    for poller in &pollers {
        poller.close().await;
    }
    for writer in &writers {
        writer.close().await;
    }
    for scanner in &scanners {
        scanner.close().await;
    }
    manager.close().await;

    info!("RFID bridge stopped");
    Ok(())
}

/// Spawn a task that logs every event of one consumer
fn event_logger(name: String) -> consumer::EventSink {
    let (sink, mut events) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                NodeEvent::Value(value) => info!("[{}] payload: {}", name, value),
                NodeEvent::Carriers(carriers) => {
                    let tags: Vec<String> = carriers
                        .iter()
                        .map(|carrier| carrier.identity(TagField::EpcBinary))
                        .collect();
                    info!("[{}] carriers: [{}]", name, tags.join(", "));
                }
                NodeEvent::Error(e) => error!("[{}] {}", name, e),
                NodeEvent::Warning(notice) => warn!("[{}] {}", name, notice),
                NodeEvent::Status(status) => debug!("[{}] status: {}", name, status),
            }
        }
    });
    sink
}

/// Exercise the simulated reader: toggle inputs, present tags and write counters
async fn drive_simulation(
    reader: SimulatedReader,
    writers: Vec<Arc<CyclicOutputWriter>>,
    scanners: Vec<Arc<CarrierScanner>>,
    output_length: usize,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut step: u64 = 0;

    loop {
        ticker.tick().await;
        step += 1;

        for pin in DIGITAL_INPUT_PINS {
            reader.set_input(pin, step % 4 < 2);
        }

        let tag = Carrier::new(
            vec![0x30, 0x08, 0x33, (step % 5) as u8],
            vec![0xE2, 0x80, 0x11, (step % 256) as u8],
        );
        reader.emit_scan(vec![tag.clone()]);

        let mut payload = vec![0u8; output_length];
        payload[0] = (step % 256) as u8;
        for writer in &writers {
            writer.input(payload.clone());
        }

        // Continuous scanners start on `true`, detect scanners trigger on anything
        if step == 3 {
            for scanner in &scanners {
                scanner.input(&serde_json::Value::Bool(true));
            }
        } else if step % 5 == 0 {
            reader.push_detect_result(Ok(vec![tag]));
            for scanner in &scanners {
                scanner.input(&serde_json::json!({ "step": step }));
            }
        }
    }
}
