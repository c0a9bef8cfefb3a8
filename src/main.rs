type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use sockunit::signals::{self, Signal};
use sockunit::{ControllerEvent, RequestOutcome, SocketState, SocketUnit, TokioManager, UnitManager};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    info!("sockunitd starting");

    let cli = Cli::parse();
    let config = cli::build_config(cli)?;
    let identity = config.identity.clone();

    let mut unit = SocketUnit::new(config)?;
    let mut manager = TokioManager::new();

    let mut sig_monitor = signals::Monitor::new();
    let sig_rx = sig_monitor.monitor()?;

    unit.start(&mut manager)?;

    run_main_loop(&mut unit, &mut manager, sig_rx).await?;

    info!(unit = %identity, "sockunitd exiting");
    Ok(())
}

/// Drives the unit's FSM until it settles in `dead`/`failed` after a stop
/// request, dispatching whichever of the manager's watched events or the
/// process's own terminal signal arrives first — the same two-source
/// `select!` shape the teacher's `run_main_loop` used for child-exit vs.
/// signal, generalized to the manager's single `next_event` future.
async fn run_main_loop(
    unit: &mut SocketUnit,
    manager: &mut TokioManager,
    mut sig_rx: mpsc::UnboundedReceiver<Signal>,
) -> Result<()> {
    let mut shutting_down = false;

    loop {
        if shutting_down && matches!(unit.state(), SocketState::Dead | SocketState::Failed) {
            return Ok(());
        }

        tokio::select! {
            event = manager.next_event() => {
                dispatch_event(unit, manager, event)?;
            }
            signal = sig_rx.recv() => {
                match signal {
                    Some(signal) => {
                        info!(unit = unit.identity(), ?signal, "received signal");
                        if !shutting_down {
                            shutting_down = true;
                            match unit.stop(manager) {
                                Ok(RequestOutcome::Applied) => {}
                                Ok(_) => return Ok(()),
                                Err(e) => {
                                    warn!(unit = unit.identity(), error = %e, "stop request failed");
                                    return Err(e.into());
                                }
                            }
                        }
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

fn dispatch_event(unit: &mut SocketUnit, manager: &mut dyn UnitManager, event: ControllerEvent) -> Result<()> {
    unit.dispatch(event, manager).map_err(Into::into)
}
