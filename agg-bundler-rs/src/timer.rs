use std::{future::Future, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::{sleep_until, Instant},
};
use tracing::trace;

enum Command {
    NotifyActive,
    Clear,
    Trigger,
}

/// Debounced submission trigger. Three states: idle (no deadline),
/// active (deadline armed at first activity plus the max delay), and a
/// transient trigger that fires immediately. Fires at most once per
/// deadline or trigger; firings are delivered on a capacity-one channel
/// so the consumer never runs the callback concurrently with itself.
#[derive(Clone)]
pub struct SubmissionTimer {
    commands: mpsc::UnboundedSender<Command>,
}

impl SubmissionTimer {
    /// Returns the handle and the task future driving the state machine;
    /// the caller spawns the future into its task pool.
    pub fn new(
        max_delay: Duration,
        fire: mpsc::Sender<()>,
        mut stopping: watch::Receiver<bool>,
    ) -> (Self, impl Future<Output = ()> + Send) {
        let (commands, mut receiver) = mpsc::unbounded_channel();
        let task = async move {
            let mut armed_at: Option<Instant> = None;
            loop {
                let deadline = armed_at.map(|instant| instant + max_delay);
                tokio::select! {
                    command = receiver.recv() => match command {
                        Some(Command::NotifyActive) => {
                            armed_at.get_or_insert_with(Instant::now);
                        }
                        Some(Command::Clear) => armed_at = None,
                        Some(Command::Trigger) => {
                            trace!("triggering submission");
                            let _ = fire.try_send(());
                            armed_at = None;
                        }
                        None => break,
                    },
                    _ = stopping.changed() => break,
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        trace!("submission deadline reached");
                        let _ = fire.try_send(());
                        armed_at = None;
                    }
                }
            }
        };
        (Self { commands }, task)
    }

    /// Record activity; arms the deadline if the timer was idle. Repeat
    /// calls do not push the deadline back.
    pub fn notify_active(&self) {
        let _ = self.commands.send(Command::NotifyActive);
    }

    /// Return to idle, forgetting any armed deadline.
    pub fn clear(&self) {
        let _ = self.commands.send(Command::Clear);
    }

    /// Fire immediately, regardless of the deadline.
    pub fn trigger(&self) {
        let _ = self.commands.send(Command::Trigger);
    }
}
