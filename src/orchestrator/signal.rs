use crate::engine::StopSignal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::info;

/// Turn the first SIGUSR1 into a stop request. Installed before any batch runs
/// so the signal never falls through to the default (terminate) action.
pub(crate) fn spawn_stop_listener(stop: StopSignal) -> std::io::Result<JoinHandle<()>> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    Ok(tokio::spawn(async move {
        if usr1.recv().await.is_some() {
            info!("got stop signal");
            stop.request();
        }
    }))
}
