//! Process lifetime: run the engine until it finishes or the user interrupts it.
use std::{process::ExitCode, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use volley::Engine;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    /// Stopped by a signal and shut down within the interrupt timeout.
    Interrupted,
    Failed,
    /// Pools did not stop within the interrupt timeout.
    Timeout,
    /// SIGTERM, or a second signal while shutting down.
    Aborted,
}

impl Outcome {
    pub fn code(self) -> u8 {
        match self {
            Outcome::Finished | Outcome::Interrupted => 0,
            Outcome::Failed | Outcome::Aborted => 1,
            Outcome::Timeout => 2,
        }
    }
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        ExitCode::from(outcome.code())
    }
}

/// Classifies an engine result. Cancellation following a signal is a clean exit.
pub fn classify(res: &volley::Result<()>, interrupted: bool) -> Outcome {
    match res {
        Ok(()) => Outcome::Finished,
        Err(err) if interrupted && err.is_cancelled() => Outcome::Interrupted,
        Err(_) => Outcome::Failed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT or Ctrl-C: stop gracefully.
    Interrupt,
    /// SIGTERM: stop now.
    Terminate,
}

/// Termination signals: SIGINT and SIGTERM on unix, Ctrl-C elsewhere.
pub struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    pub fn new() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    pub async fn recv(&mut self) -> Signal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => Signal::Interrupt,
                _ = self.terminate.recv() => Signal::Terminate,
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            Signal::Interrupt
        }
    }
}

/// Runs `engine` until it finishes. An interrupt cancels it and gives the
/// pools `interrupt_timeout` to stop; SIGTERM or a second signal aborts.
pub async fn run_until_signal(
    engine: Arc<Engine>,
    cancel: CancellationToken,
    mut signals: Signals,
    interrupt_timeout: Duration,
) -> Outcome {
    let mut run = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move { engine.run(cancel).await }
    });

    let res = tokio::select! {
        joined = &mut run => joined.map_err(volley::Error::from).and_then(|res| res),
        signal = signals.recv() => {
            cancel.cancel();
            if signal == Signal::Terminate {
                tracing::error!("Got SIGTERM, aborting");
                return Outcome::Aborted;
            }
            tracing::info!("Interrupted, stopping pools...");
            tokio::select! {
                joined = tokio::time::timeout(interrupt_timeout, &mut run) => match joined {
                    Ok(joined) => joined.map_err(volley::Error::from).and_then(|res| res),
                    Err(_) => {
                        tracing::error!("Pools did not stop within {interrupt_timeout:?}");
                        return Outcome::Timeout;
                    }
                },
                signal = signals.recv() => {
                    tracing::error!(?signal, "Got a second signal, aborting");
                    return Outcome::Aborted;
                }
            }
        }
    };

    if let Err(err) = &res {
        if !err.is_cancelled() {
            tracing::error!("Engine failed: {err}");
        }
    }
    classify(&res, cancel.is_cancelled())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(Outcome::Finished.code(), 0);
        assert_eq!(Outcome::Interrupted.code(), 0);
        assert_eq!(Outcome::Failed.code(), 1);
        assert_eq!(Outcome::Aborted.code(), 1);
        assert_eq!(Outcome::Timeout.code(), 2);
    }

    #[test]
    fn cancellation_is_clean_only_after_a_signal() {
        let cancelled: volley::Result<()> = Err(volley::Error::Cancelled);
        assert_eq!(classify(&cancelled, true), Outcome::Interrupted);
        assert_eq!(classify(&cancelled, false), Outcome::Failed);
        assert_eq!(classify(&Ok(()), false), Outcome::Finished);
        assert_eq!(classify(&Err(volley::Error::EmptyStartup), true), Outcome::Failed);
    }

    #[tokio::test]
    async fn finished_engine_without_signal() {
        let engine = Arc::new(Engine::builder().pools(vec![]).build());
        let outcome = run_until_signal(
            engine,
            CancellationToken::new(),
            Signals::new().unwrap(),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(outcome, Outcome::Finished);
    }
}
