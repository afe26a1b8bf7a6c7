//! Restart handshake.
//!
//! [`Lineage`] is the supervisor's view of the current child. It is only
//! ever touched by the [`Dispatcher`] task, which feeds it one [`Event`] at
//! a time and carries out the [`Action`] it returns. Everyone else observes
//! the `restarting` flag through a watch channel.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::log::{gated_debug, Verbosity};
use crate::sys;

/// Inputs to the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    /// An OS signal delivered to the supervisor.
    Signal(i32),
    /// Restart requested from inside the supervisor, after an upgrade.
    Restart,
    /// A child process was started.
    Forked { pid: u32, generation: u64 },
    /// A child process was reaped.
    Exited { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Ask the child to wind down; kill it if it does not answer in time.
    RequestRestart { pid: u32, signal: i32 },
    /// A replacement child exists; the pending restart succeeded.
    ResolveRestart { elapsed: Duration },
    /// The child of `generation` let go of its listeners.
    ReleaseDescriptors { generation: u64 },
    Proxy { pid: u32, signal: i32 },
    Exit(i32),
    Skip(&'static str),
    Discard { signal: i32 },
    Nothing,
}

#[derive(Debug, Clone, Copy)]
struct LiveChild {
    pid: u32,
    generation: u64,
}

/// Single-writer restart state.
#[derive(Debug)]
pub(crate) struct Lineage {
    restart_signal: i32,
    child: Option<LiveChild>,
    restarting: bool,
    awaiting_ack: bool,
    signalled_at: Option<Instant>,
}

impl Lineage {
    pub(crate) fn new(restart_signal: i32) -> Self {
        Self {
            restart_signal,
            child: None,
            restarting: false,
            awaiting_ack: false,
            signalled_at: None,
        }
    }

    pub(crate) fn restarting(&self) -> bool {
        self.restarting
    }

    pub(crate) fn handle(&mut self, event: Event) -> Action {
        match event {
            Event::Restart => self.trigger_restart(),
            Event::Signal(signal) if signal == self.restart_signal => self.trigger_restart(),
            Event::Signal(signal) if signal == sys::ACK_SIGNAL && self.awaiting_ack => {
                self.awaiting_ack = false;
                match self.child {
                    Some(child) => Action::ReleaseDescriptors {
                        generation: child.generation,
                    },
                    None => Action::Nothing,
                }
            }
            Event::Signal(signal) => match self.child {
                Some(child) => Action::Proxy {
                    pid: child.pid,
                    signal,
                },
                None if signal == sys::INTERRUPT_SIGNAL => Action::Exit(1),
                None => Action::Discard { signal },
            },
            Event::Forked { pid, generation } => {
                self.child = Some(LiveChild { pid, generation });
                if !self.restarting {
                    return Action::Nothing;
                }
                self.restarting = false;
                self.awaiting_ack = false;
                let elapsed = self
                    .signalled_at
                    .take()
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                Action::ResolveRestart { elapsed }
            }
            // Only the current child; retired generations were replaced already.
            Event::Exited { pid } => {
                if self.child.is_some_and(|child| child.pid == pid) {
                    self.child = None;
                }
                Action::Nothing
            }
        }
    }

    fn trigger_restart(&mut self) -> Action {
        if self.restarting {
            return Action::Skip("already graceful restarting");
        }
        let Some(child) = self.child else {
            return Action::Skip("no child process");
        };
        self.restarting = true;
        self.awaiting_ack = true;
        self.signalled_at = Some(Instant::now());
        Action::RequestRestart {
            pid: child.pid,
            signal: self.restart_signal,
        }
    }
}

/// Task that owns the [`Lineage`].
pub(crate) struct Dispatcher {
    lineage: Lineage,
    events: mpsc::UnboundedReceiver<Event>,
    restarting: watch::Sender<bool>,
    released: mpsc::UnboundedSender<u64>,
    pending: Option<oneshot::Sender<()>>,
    terminate_timeout: Duration,
    verbosity: Verbosity,
}

impl Dispatcher {
    pub(crate) fn new(
        restart_signal: i32,
        terminate_timeout: Duration,
        verbosity: Verbosity,
        events: mpsc::UnboundedReceiver<Event>,
        restarting: watch::Sender<bool>,
        released: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            lineage: Lineage::new(restart_signal),
            events,
            restarting,
            released,
            pending: None,
            terminate_timeout,
            verbosity,
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            let action = self.lineage.handle(event);
            self.restarting.send_replace(self.lineage.restarting());
            self.perform(action);
        }
    }

    fn perform(&mut self, action: Action) {
        let verbosity = self.verbosity;
        match action {
            Action::RequestRestart { pid, signal } => {
                gated_debug!(verbosity, pid, "Graceful restart triggered");
                send_or_exit(verbosity, pid, signal);
                let (done, resolved) = oneshot::channel();
                self.pending = Some(done);
                tokio::spawn(
                    escalate(pid, resolved, self.terminate_timeout, verbosity).in_current_span(),
                );
            }
            Action::ResolveRestart { elapsed } => {
                if let Some(done) = self.pending.take() {
                    let _ = done.send(());
                }
                gated_debug!(verbosity, elapsed_ms = elapsed.as_millis() as u64, "Restart resolved");
            }
            Action::ReleaseDescriptors { generation } => {
                gated_debug!(verbosity, generation, "Signaled, sockets ready");
                let _ = self.released.send(generation);
            }
            Action::Proxy { pid, signal } => {
                gated_debug!(verbosity, pid, signal = %sys::signal_name(signal), "Proxy signal");
                match sys::send_signal(pid, signal) {
                    Ok(()) => {}
                    // Exited but not reaped yet; the fork loop reports its status.
                    Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {
                        gated_debug!(verbosity, pid, "Signal not delivered, child already gone");
                    }
                    Err(err) => {
                        gated_debug!(verbosity, pid, error = %err, "Signal failed, assuming child process died unexpectedly");
                        std::process::exit(1);
                    }
                }
            }
            Action::Exit(code) => {
                gated_debug!(verbosity, "Interrupt with no child");
                std::process::exit(code);
            }
            Action::Skip(reason) => {
                gated_debug!(verbosity, reason, "Restart skipped");
            }
            Action::Discard { signal } => {
                gated_debug!(verbosity, signal = %sys::signal_name(signal), "Signal discarded, no child process");
            }
            Action::Nothing => {}
        }
    }
}

/// Ask nicely, then force.
async fn escalate(pid: u32, resolved: oneshot::Receiver<()>, timeout: Duration, verbosity: Verbosity) {
    tokio::select! {
        result = resolved => {
            if result.is_ok() {
                gated_debug!(verbosity, pid, "Restart success");
            }
        }
        _ = tokio::time::sleep(timeout) => {
            gated_debug!(verbosity, pid, timeout_secs = timeout.as_secs(), "Graceful timeout, forcing exit");
            if let Err(err) = sys::force_kill(pid) {
                gated_debug!(verbosity, pid, error = %err, "Force kill failed");
            }
        }
    }
}

fn send_or_exit(verbosity: Verbosity, pid: u32, signal: i32) {
    if let Err(err) = sys::send_signal(pid, signal) {
        gated_debug!(verbosity, pid, error = %err, "Signal failed, assuming child process died unexpectedly");
        std::process::exit(1);
    }
}
