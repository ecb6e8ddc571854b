//! The procedure run loop.

use super::{Completion, Context, Outcome, Procedure};
use crate::database::Shared;
use crate::error::{CoreError, CoreResult};
use crate::types::SessionId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

/// Runs a procedure to completion on the calling thread.
///
/// The run holds a read permit on the commit lock throughout, so the
/// checkpoint's pause phase waits for it. Redo and failure both roll the
/// attempt back; a redo beyond `max_redo` attempts is a failure.
pub(crate) fn execute(
    shared: &Shared,
    procedure: &mut dyn Procedure,
    session: Option<SessionId>,
) -> CoreResult<Completion> {
    if shared.exiting.load(Ordering::Acquire) {
        park_forever(procedure.name());
    }

    let _permit = shared.commit_lock.read();
    // Registered only once the permit is held, so a checkpoint pause does
    // not count toward the procedure timeout.
    let registration = shared.registry.register(procedure.name(), session);
    let handle = registration.handle();
    let mut ctx = Context::new(&shared.pool, handle, shared.config.max_locks_per_procedure);
    let max_redo = shared.config.max_redo;

    let mut attempts = 0u32;
    let failure = loop {
        attempts += 1;
        let outcome = catch_unwind(AssertUnwindSafe(|| procedure.process(&mut ctx)))
            .unwrap_or_else(|payload| Err(CoreError::panicked(handle.name(), payload.as_ref())));

        match outcome {
            Ok(Outcome::Done) => {
                let report = ctx.commit();
                shared.stats.record_commit(report.failed_callbacks);
                debug!(procedure = handle.name(), attempts, published = report.published, "procedure committed");
                return Ok(Completion::Committed { attempts });
            }
            Ok(Outcome::Abort) => {
                ctx.rollback();
                shared.stats.record_abort();
                debug!(procedure = handle.name(), attempts, "procedure aborted");
                return Ok(Completion::Aborted { attempts });
            }
            Ok(Outcome::Redo) => {
                ctx.rollback();
                shared.stats.record_redo();
                if attempts >= max_redo {
                    break CoreError::RedoExhausted {
                        procedure: handle.name().to_string(),
                        attempts,
                    };
                }
            }
            Err(e) => break e,
        }
    };

    ctx.rollback();
    drop(ctx);
    shared.stats.record_failure(failure.is_interrupted());

    let handled = catch_unwind(AssertUnwindSafe(|| procedure.on_error(&failure))).unwrap_or(false);
    if !handled {
        let handler = shared.error_handler.read();
        (*handler)(handle.name(), &failure);
    }
    Err(failure)
}

/// Blocks a procedure submitted after shutdown began.
fn park_forever(name: &str) -> ! {
    warn!(procedure = name, "database is shutting down; procedure parked");
    loop {
        std::thread::park();
    }
}
