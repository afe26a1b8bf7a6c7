//! Supervisor process.
//!
//! Binds the listening sockets once, forks children that inherit them,
//! forwards signals, runs the update pipeline and replaces children when
//! the binary changes. The supervisor never runs the program itself.

mod handshake;
mod sockets;

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{info_span, Instrument};

use crate::binary::{BinaryRecord, BinaryStore};
use crate::config::Settings;
use crate::env::ChildEnv;
use crate::error::Error;
use crate::fetcher::Fetcher;
use crate::log::{gated_debug, gated_warn};
use crate::pipeline::UpdatePipeline;
use crate::sys;

pub(crate) use handshake::Event;
use handshake::Dispatcher;
use sockets::SocketSet;

pub(crate) struct Supervisor {
    settings: Settings,
    fetcher: Option<Box<dyn Fetcher>>,
}

impl Supervisor {
    pub(crate) fn new(settings: Settings, fetcher: Option<Box<dyn Fetcher>>) -> Self {
        Self { settings, fetcher }
    }

    /// Supervise until the child exits on its own. Returns the exit code
    /// the supervisor should exit with.
    pub(crate) async fn run(self) -> Result<i32, Error> {
        self.start().instrument(info_span!("supervisor")).await
    }

    async fn start(mut self) -> Result<i32, Error> {
        let settings = self.settings;
        let verbosity = settings.verbosity;
        gated_debug!(verbosity, "Run");

        let mut store = BinaryStore::identify().await?;
        if let Some(dir) = &settings.staging_dir {
            store = store.with_staging_dir(dir);
        }

        if let Some(fetcher) = self.fetcher.as_mut() {
            if let Err(err) = fetcher.init().await {
                gated_warn!(verbosity, error = %err, "Fetcher init failed, fetcher disabled");
                self.fetcher = None;
            }
        }
        if self.fetcher.is_some() {
            store.check_replaceable()?;
        }

        let sockets = SocketSet::bind(&settings.addresses)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (restarting_tx, restarting_rx) = watch::channel(false);
        let (released_tx, released_rx) = mpsc::unbounded_channel();
        forward_signals(&settings, &events_tx)?;
        let dispatcher = Dispatcher::new(
            settings.restart_signal,
            settings.terminate_timeout,
            verbosity,
            events_rx,
            restarting_tx,
            released_tx,
        );
        tokio::spawn(dispatcher.run().in_current_span());

        let (record_tx, record_rx) = watch::channel(store.record().clone());
        if let Some(fetcher) = self.fetcher.take() {
            let mut pipeline = UpdatePipeline::new(
                fetcher,
                store,
                settings.clone(),
                record_tx,
                restarting_rx.clone(),
                events_tx.clone(),
            );
            pipeline.run_cycle().await;
            tokio::spawn(pipeline.run().in_current_span());
        }

        ForkLoop {
            settings,
            sockets,
            record: record_rx,
            events: events_tx,
            released: released_rx,
            restarting: restarting_rx,
            generation: 0,
        }
        .run()
        .await
    }
}

/// Forward every handled signal to the dispatcher.
fn forward_signals(settings: &Settings, events: &mpsc::UnboundedSender<Event>) -> Result<(), Error> {
    let mut signals = sys::FORWARDED_SIGNALS.to_vec();
    if !signals.contains(&settings.restart_signal) {
        signals.push(settings.restart_signal);
    }

    for signo in signals {
        let mut stream = signal(SignalKind::from_raw(signo)).map_err(|source| Error::Signal {
            signal: sys::signal_name(signo),
            source,
        })?;
        let events = events.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if events.send(Event::Signal(signo)).is_err() {
                    break;
                }
            }
        });
    }
    Ok(())
}

struct ForkLoop {
    settings: Settings,
    sockets: SocketSet,
    record: watch::Receiver<BinaryRecord>,
    events: mpsc::UnboundedSender<Event>,
    released: mpsc::UnboundedReceiver<u64>,
    restarting: watch::Receiver<bool>,
    generation: u64,
}

impl ForkLoop {
    async fn run(mut self) -> Result<i32, Error> {
        let verbosity = self.settings.verbosity;
        loop {
            self.generation += 1;
            let generation = self.generation;
            let mut child = self.spawn(generation)?;
            let pid = child
                .id()
                .ok_or_else(|| Error::Spawn(std::io::Error::other("child exited before reporting its pid")))?;
            let _ = self.events.send(Event::Forked { pid, generation });

            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = released(&mut self.released, generation) => None,
            };

            match exited {
                Some(status) => {
                    let _ = self.events.send(Event::Exited { pid });
                    let code = exit_code(status);
                    gated_debug!(verbosity, generation, code, "Program exited");
                    if self.settings.no_restart || !*self.restarting.borrow() {
                        return Ok(code);
                    }
                }
                // The old child keeps draining on its own; reap it whenever
                // it gets there.
                None => {
                    tokio::spawn(
                        async move {
                            let code = exit_code(child.wait().await);
                            gated_debug!(verbosity, generation, code, "Previous program exited");
                        }
                        .in_current_span(),
                    );
                }
            }
        }
    }

    fn spawn(&self, generation: u64) -> Result<Child, Error> {
        let record = self.record.borrow().clone();
        let identity = ChildEnv {
            generation,
            num_fds: self.sockets.len(),
            bin_id: record.id(),
            bin_path: Some(record.path.clone()),
        };
        gated_debug!(
            self.settings.verbosity,
            generation,
            path = %record.path.display(),
            "Starting program"
        );

        let mut args = std::env::args_os();
        let mut command = Command::new(&record.path);
        if let Some(arg0) = args.next() {
            command.arg0(arg0);
        }
        command.args(args).envs(identity.vars());

        let fds = self.sockets.raw_fds();
        // SAFETY: the hook only calls dup2, which is async-signal-safe, and
        // does not allocate.
        unsafe {
            command.pre_exec(move || sys::install_inherited(&fds));
        }
        command.spawn().map_err(Error::Spawn)
    }
}

/// Resolve once the child of `generation` has released its listeners.
async fn released(released: &mut mpsc::UnboundedReceiver<u64>, generation: u64) {
    while let Some(acked) = released.recv().await {
        if acked == generation {
            return;
        }
    }
    std::future::pending::<()>().await
}

fn exit_code(status: std::io::Result<ExitStatus>) -> i32 {
    match status {
        Ok(status) => status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or(1),
        Err(_) => 1,
    }
}
