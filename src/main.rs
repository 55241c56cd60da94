use fitsense::app::{parse_command, FitSense, Message};
use fitsense::btle::BtleTransport;
use fitsense::config::Config;
use fitsense::connection::{ConnectionCommand, ConnectionManager, SensorUpdate};
use fitsense::error::ConnectionError;
use fitsense::health::HealthAggregator;
use fitsense::health_store::InMemoryHealthStore;
use fitsense::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;

const HELP: &str = "Commands: scan, stop, connect <n|id>, disconnect, permissions, \
auth, health, record, periodic <on|off>, quit";

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load().unwrap_or_else(|e| {
        log::warn!("{}; using default settings", e);
        Config::default()
    });

    // Updates flow from the connection thread to the terminal front-end
    let (sender, receiver) = crossbeam_channel::unbounded::<SensorUpdate>();

    let transport: Arc<dyn Transport> = Arc::new(BtleTransport::new());
    let (manager, command_sender) = ConnectionManager::new(
        transport,
        config.device_settings(),
        config.priority_device_id.clone(),
        sender,
    );

    // Spawn a thread to handle connection requests
    let connection_thread = std::thread::spawn(move || {
        manager.run();
    });

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("{}", ConnectionError::RuntimeCreation(e.to_string()));
            let _ = command_sender.send(ConnectionCommand::Shutdown);
            return;
        }
    };
    runtime.block_on(run_terminal(config, receiver, command_sender));

    if connection_thread.join().is_err() {
        log::error!("Connection thread panicked");
    }
}

async fn run_terminal(
    config: Config,
    receiver: crossbeam_channel::Receiver<SensorUpdate>,
    command_sender: UnboundedSender<ConnectionCommand>,
) {
    let store = Arc::new(InMemoryHealthStore::new());
    let health = HealthAggregator::new(store, config.health_settings());
    let mut app = FitSense::new(
        receiver,
        command_sender,
        health,
        config.scan_timeout(),
        config.enable_autoconnect,
    );

    let mut startup = vec![Message::RequestHealthAuthorization];
    if config.health.seed_synthetic_activity {
        startup.push(Message::RecordActivity);
    }
    startup.push(Message::RefreshHealth);
    if config.health.periodic_refresh {
        startup.push(Message::PeriodicHealth(true));
    }
    startup.extend([Message::RequestPermissions, Message::ScanDevices]);
    for message in startup {
        app.update(message).await;
    }

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(100));

    loop {
        let message = tokio::select! {
            _ = ticker.tick() => Message::Tick,
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_command(&line, &app.available_devices) {
                    Some(message) => message,
                    None => {
                        println!("{}", HELP);
                        continue;
                    }
                },
                Ok(None) => Message::Quit,
                Err(e) => {
                    log::error!("Failed to read input: {}", e);
                    Message::Quit
                }
            },
            _ = tokio::signal::ctrl_c() => Message::Quit,
        };

        if !app.update(message).await {
            break;
        }
        if app.take_dirty() {
            print!("{}", app.view());
        }
    }
}
