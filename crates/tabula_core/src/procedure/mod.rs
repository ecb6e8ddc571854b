//! Procedures: transactional units of application logic.

mod context;
pub(crate) mod registry;
pub(crate) mod runner;
pub(crate) mod watchdog;

pub use context::Context;
pub use registry::RunningProcedure;

use crate::error::{CoreError, CoreResult};

/// What a procedure attempt asks the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Commit every change.
    Done,
    /// Roll back and run the procedure again.
    Redo,
    /// Roll back without reporting an error.
    Abort,
}

/// How a procedure run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Changes were committed.
    Committed {
        /// Attempts used, including the committing one.
        attempts: u32,
    },
    /// The procedure aborted; nothing changed.
    Aborted {
        /// Attempts used, including the aborting one.
        attempts: u32,
    },
}

impl Completion {
    /// Returns `true` for [`Completion::Committed`].
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }

    /// Attempts the run took.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Committed { attempts } | Self::Aborted { attempts } => *attempts,
        }
    }
}

/// One transactional unit of application logic.
///
/// `process` runs with a fresh [`Context`] per attempt. It must take every
/// lock it needs with a single `lock*` call before touching records. Any
/// error, panic or [`Outcome::Redo`] rolls back all changes of the attempt.
///
/// # Example
///
/// ```rust,ignore
/// struct Deposit { account: u64, amount: i64 }
///
/// impl Procedure for Deposit {
///     fn process(&mut self, ctx: &mut Context<'_>) -> CoreResult<Outcome> {
///         ctx.lock(ACCOUNTS.lock_id(&self.account))?;
///         let acc = ACCOUNTS.get_for_update(ctx, &self.account)?.unwrap();
///         acc.update(ctx, |a| a.balance += self.amount)?;
///         Ok(Outcome::Done)
///     }
/// }
/// ```
pub trait Procedure: Send {
    /// Runs one attempt.
    ///
    /// # Errors
    ///
    /// Any error fails the procedure after rollback.
    fn process(&mut self, ctx: &mut Context<'_>) -> CoreResult<Outcome>;

    /// Called after a failed run has been rolled back.
    ///
    /// Returns `true` if the error was handled; otherwise the database's
    /// default error handler runs.
    fn on_error(&mut self, error: &CoreError) -> bool {
        let _ = error;
        false
    }

    /// Name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<P: Procedure + ?Sized> Procedure for &mut P {
    fn process(&mut self, ctx: &mut Context<'_>) -> CoreResult<Outcome> {
        (**self).process(ctx)
    }

    fn on_error(&mut self, error: &CoreError) -> bool {
        (**self).on_error(error)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<P: Procedure + ?Sized> Procedure for Box<P> {
    fn process(&mut self, ctx: &mut Context<'_>) -> CoreResult<Outcome> {
        (**self).process(ctx)
    }

    fn on_error(&mut self, error: &CoreError) -> bool {
        (**self).on_error(error)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// A procedure built from a closure. See [`procedure_fn`].
pub struct FnProcedure<F> {
    name: String,
    body: F,
}

/// Wraps a closure as a named [`Procedure`].
///
/// ```rust,ignore
/// db.execute(procedure_fn("touch", |ctx| {
///     ctx.lock(table.lock_id(&1))?;
///     table.put(ctx, 1, "x".to_string())?;
///     Ok(Outcome::Done)
/// }))?;
/// ```
pub fn procedure_fn<F>(name: impl Into<String>, body: F) -> FnProcedure<F>
where
    F: FnMut(&mut Context<'_>) -> CoreResult<Outcome> + Send,
{
    FnProcedure {
        name: name.into(),
        body,
    }
}

impl<F> Procedure for FnProcedure<F>
where
    F: FnMut(&mut Context<'_>) -> CoreResult<Outcome> + Send,
{
    fn process(&mut self, ctx: &mut Context<'_>) -> CoreResult<Outcome> {
        (self.body)(ctx)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<F> std::fmt::Debug for FnProcedure<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProcedure").field("name", &self.name).finish()
    }
}

/// Handler for procedure failures that `on_error` left unhandled.
pub type ErrorHandler = Box<dyn Fn(&str, &CoreError) + Send + Sync>;

pub(crate) fn default_error_handler() -> ErrorHandler {
    Box::new(|procedure, error| {
        tracing::error!(procedure, error = %error, "procedure failed");
    })
}
