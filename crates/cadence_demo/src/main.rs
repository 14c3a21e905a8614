mod app;

use tracing::{error, info};

fn main() {
    app::bootstrap::init_tracing();
    info!("=== Cadence Demo Startup ===");

    let config = match app::bootstrap::load_config() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "config_load_failed");
            std::process::exit(1);
        }
    };

    match app::run(config) {
        Ok(summary) => info!(
            iterations = summary.iterations,
            frames_presented = summary.frames_presented,
            "demo_finished"
        ),
        Err(err) => {
            error!(error = %err, "startup_failed");
            std::process::exit(1);
        }
    }
}
