//! Operator interrupt source.
//!
//! A keyboard interrupt is the only way to end a running project as a
//! success. Once [`CtrlC`] is installed, SIGINT no longer kills the agent; it
//! raises a flag that the supervisor and session controller poll.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info};

/// Abstraction over the operator's stop signal.
pub trait Interrupt {
    /// Return whether an interrupt arrived since the last call, clearing it.
    fn take(&self) -> bool;
}

impl<T: Interrupt + ?Sized> Interrupt for &T {
    fn take(&self) -> bool {
        (**self).take()
    }
}

/// Interrupt source that never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterrupt;

impl Interrupt for NoInterrupt {
    fn take(&self) -> bool {
        false
    }
}

/// SIGINT listener backed by a tokio signal stream on a dedicated thread.
#[derive(Debug, Clone)]
pub struct CtrlC {
    flag: Arc<AtomicBool>,
}

impl CtrlC {
    /// Register the SIGINT handler. Returns once the handler is active.
    pub fn install() -> Result<Self> {
        let flag = Arc::new(AtomicBool::new(false));
        let thread_flag = Arc::clone(&flag);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        thread::Builder::new()
            .name("codeloop-sigint".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err).context("build signal runtime"));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let mut stream = match signal(SignalKind::interrupt()) {
                        Ok(stream) => stream,
                        Err(err) => {
                            let _ = ready_tx.send(Err(err).context("register SIGINT handler"));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    while stream.recv().await.is_some() {
                        info!("interrupt received");
                        thread_flag.store(true, Ordering::SeqCst);
                    }
                });
            })
            .context("spawn signal thread")?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("signal thread exited before registering"))??;
        debug!("SIGINT handler installed");
        Ok(Self { flag })
    }
}

impl Interrupt for CtrlC {
    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}
