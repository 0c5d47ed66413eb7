use std::future::Future;
use tracing::{info, warn};

/// Install the termination handlers and return a future that resolves on the
/// first SIGINT or SIGTERM.
///
/// Handlers are installed by this call, not when the future is first polled,
/// so call it once before entering the main loop. Must run inside a tokio
/// runtime.
#[cfg(unix)]
pub fn shutdown_signal() -> impl Future<Output = ()> {
    use tokio::signal::unix::{signal, Signal, SignalKind};

    fn install(kind: SignalKind, name: &'static str) -> Option<Signal> {
        match signal(kind) {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!("Cannot install {} handler: {}", name, e);
                None
            }
        }
    }

    async fn wait(stream: Option<Signal>) {
        match stream {
            Some(mut stream) => {
                if stream.recv().await.is_none() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }

    let interrupt = install(SignalKind::interrupt(), "SIGINT");
    let terminate = install(SignalKind::terminate(), "SIGTERM");

    async move {
        tokio::select! {
            () = wait(interrupt) => info!("Received SIGINT"),
            () = wait(terminate) => info!("Received SIGTERM"),
        }
    }
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl-C");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn raise(signal: libc::c_int) {
        // SAFETY: raise only delivers a signal to this process
        assert_eq!(unsafe { libc::raise(signal) }, 0);
    }

    #[tokio::test]
    async fn test_resolves_on_sigterm() {
        let shutdown = shutdown_signal();
        raise(libc::SIGTERM);
        tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .expect("SIGTERM did not resolve the shutdown future");
    }

    #[tokio::test]
    async fn test_resolves_on_sigint() {
        let shutdown = shutdown_signal();
        raise(libc::SIGINT);
        tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .expect("SIGINT did not resolve the shutdown future");
    }
}
