use hub_remote::controller::{Controller, ControllerConfig, Transport};
use hub_remote::domain::commands::{CommandMap, KeyBindings};
use hub_remote::domain::settings::SettingsService;
use hub_remote::infrastructure::logging;
use hub_remote::infrastructure::simulator::SimulatedHub;
use hub_remote::presentation::RemoteApp;
use std::sync::Arc;
use tracing::{info, warn};

fn main() -> anyhow::Result<()> {
    let simulate = std::env::args().skip(1).any(|arg| arg == "--simulate");

    let settings_service = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting hub remote");
    if !settings_service.path().exists() {
        if let Err(e) = settings_service.save() {
            warn!("Could not write default settings: {}", e);
        }
    }

    let settings = settings_service.get();
    let config = settings.controller_config()?;
    let commands = Arc::new(CommandMap::standard());

    #[cfg(windows)]
    if !simulate {
        use hub_remote::infrastructure::bluetooth::PybricksTransport;
        if settings.program_path.is_none() {
            warn!(
                "No program_path in {}; the hub needs a compiled .mpy, uploads will be refused",
                settings_service.path().display()
            );
        }
        return run(PybricksTransport, config, commands);
    }

    #[cfg(not(windows))]
    if !simulate {
        warn!("No BLE backend on this platform, using the simulated hub");
    }

    let hub = SimulatedHub::new(settings.hub_name.clone(), commands.clone());
    run(hub, config, commands)
}

fn run<T: Transport>(
    transport: T,
    config: ControllerConfig,
    commands: Arc<CommandMap>,
) -> anyhow::Result<()> {
    let (controller, events) = Controller::spawn(transport, config, commands)?;
    let app = RemoteApp::new(controller, events, KeyBindings::standard());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(app.run())
}
