use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use crate::worker::Signal;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// On either signal a `Signal::Stop` is delivered to the worker loop,
/// which exits without aborting an in-flight job pipeline.
pub fn install_shutdown_handler(signals: mpsc::Sender<Signal>) {
    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping worker");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping worker");
            }
        }

        let _ = signals.send(Signal::Stop).await;
    });
}
