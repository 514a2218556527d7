//! Per-session worker thread
//!
//! Takes one command at a time from the slot, runs it through error
//! recovery with the I/O lock held, then hands it back through its
//! completion. A panic inside the transport is contained here and turns
//! into an Error status rather than a dead session.

use crate::channel::{CommandChannel, Queued};
use crate::protocols::{Link, Protocol};
use crate::recovery;
use crate::session::{IoContext, Shared};
use protocol::{Command, CommandStatus};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

pub(crate) fn spawn(shared: Arc<Shared>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("usb-storage-{}", shared.key))
        .spawn(move || run(shared))
}

fn run(shared: Arc<Shared>) {
    info!(session = %shared.key, "Worker started");
    let channel = CommandChannel::new(&shared.machine);

    while let Some(Queued {
        mut command,
        completion,
    }) = channel.take(|| {
        shared.backend.rearm();
        shared.flags.timed_out.store(false, Ordering::SeqCst);
    }) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute(&shared, &mut command)));
        if let Err(payload) = outcome {
            error!(
                session = %shared.key,
                panic = panic_message(payload.as_ref()),
                "Worker panicked while executing command"
            );
            command.status = CommandStatus::Error;
            command.sense.clear();
        }

        if shared.machine.complete() && command.status != CommandStatus::Aborted {
            debug!(status = ?command.status, "Command finished while aborting");
            command.status = CommandStatus::Aborted;
            command.sense.clear();
        }

        debug!(
            session = %shared.key,
            status = ?command.status,
            residue = command.residue,
            "Command complete"
        );
        completion.complete(command);
    }

    info!(session = %shared.key, "Worker stopped");
}

fn execute(shared: &Shared, command: &mut Command) {
    let mut io = shared.lock_io();
    let IoContext { protocol, link } = &mut *io;

    recovery::run(protocol, link, command);

    if link.take_timed_out() {
        shared.flags.timed_out.store(true, Ordering::SeqCst);
    }
    if link.take_reset_required() {
        run_reset_recovery(shared, protocol, link);
    }
}

/// Bring the device back in sync before the next command
fn run_reset_recovery(shared: &Shared, protocol: &mut Protocol, link: &mut Link) {
    warn!(session = %shared.key, "Running reset recovery");
    let err = match protocol.reset(link) {
        Ok(()) => return,
        Err(err) => err,
    };

    let interfaces = shared.backend.active_interfaces();
    if interfaces > 1 {
        warn!(%err, interfaces, "Reset recovery failed, port reset not possible");
        return;
    }
    warn!(%err, "Reset recovery failed, resetting port");
    if let Err(err) = shared.backend.reset_port() {
        error!(%err, "Port reset failed");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
