/// Signal handling: Ctrl-C and SIGTERM interrupt the running execution.
///
/// The first signal is a manual interrupt. It competes with the watchdog
/// for the execution's latch, so a signal arriving after a timeout already
/// fired changes nothing. A second signal kills the job without waiting out
/// the interrupt grace period.
use crate::job::Execution;
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;

fn listen(kind: SignalKind, name: &str) -> Option<Signal> {
    match signal(kind) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(signal = name, error = %e, "failed to install signal handler");
            None
        }
    }
}

async fn recv(signal: &mut Option<Signal>) -> Option<()> {
    match signal {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

/// Listen for the lifetime of one execution. Handlers are registered before
/// this returns. Abort the returned handle once the execution ends.
pub fn install(execution: Arc<Execution>) -> JoinHandle<()> {
    let mut interrupt = listen(SignalKind::interrupt(), "SIGINT");
    let mut terminate = listen(SignalKind::terminate(), "SIGTERM");

    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            tokio::select! {
                Some(_) = recv(&mut interrupt) => tracing::info!("received Ctrl-C"),
                Some(_) = recv(&mut terminate) => tracing::info!("received SIGTERM"),
                else => return,
            }
            received += 1;

            if received == 1 {
                if !execution.interrupt_manually() {
                    tracing::debug!("execution already settled, ignoring signal");
                }
            } else {
                tracing::warn!("second signal, killing the job now");
                execution.force_kill();
                return;
            }
        }
    })
}
