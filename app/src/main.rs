use edge_readings::{Service, ServiceConfig};
use std::path::PathBuf;
use tracing::info;

fn main() {
    edge_readings::logging::init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServiceConfig::load(&PathBuf::from(path)).expect("failed to load configuration"),
        None => ServiceConfig::default(),
    };

    let service = Service::start(&config).expect("failed to start service");
    info!("edge readings service running, press Ctrl-C to stop");

    let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
    let signal_flag = running.clone();
    ctrlc::set_handler(move || signal_flag.store(false, std::sync::atomic::Ordering::SeqCst))
        .expect("failed to install Ctrl-C handler");

    while running.load(std::sync::atomic::Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    info!("shutdown requested");
    service.shutdown().expect("failed to shut down cleanly");
}
