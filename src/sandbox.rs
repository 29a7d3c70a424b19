//! The boundary between the engine and third-party task code.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use crate::error::{FailureKind, TaskError, TaskFailure};
use crate::task::{TaskContext, TaskDescriptor};

thread_local! {
    /// Location and backtrace of the last panic on this thread.
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Chains a hook that remembers where a panic happened, then defers to the
/// hook which was installed before.
fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let mut detail = match info.location() {
                Some(location) => format!("panicked at {location}"),
                None => String::from("panicked at an unknown location"),
            };

            let backtrace = Backtrace::capture();
            if backtrace.status() == BacktraceStatus::Captured {
                detail.push_str(&format!("\nstack backtrace:\n{backtrace}"));
            }

            let _ = LAST_PANIC.try_with(|slot| *slot.borrow_mut() = Some(detail));
            previous(info);
        }));
    });
}

/// A caught panic.
pub(crate) struct Panic {
    pub message: String,
    /// Where it happened, with a backtrace when `RUST_BACKTRACE` is set.
    pub detail: String,
}

/// Runs `f`, turning a panic into a [`Panic`].
pub(crate) fn catch<R>(f: impl FnOnce() -> R) -> Result<R, Panic> {
    install_hook();
    LAST_PANIC.with(|slot| slot.borrow_mut().take());

    // We use AssertUnwindSafe because nothing touched by `f` is used again
    // after a panic, the caller only reports it.
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            String::from("unknown payload")
        };

        let detail = LAST_PANIC
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(|| String::from("panicked at an unknown location"));

        Panic { message, detail }
    })
}

/// Runs a task and classifies how it failed, if it did.
///
/// Panics are caught and reported as unexpected failures, so a broken task
/// cannot take the whole build down with it.
pub fn invoke(descriptor: &TaskDescriptor, context: &TaskContext<'_>) -> Result<(), TaskFailure> {
    match catch(|| descriptor.task().run(context)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(classify(descriptor, error)),
        Err(panic) => Err(TaskFailure::unexpected(
            descriptor,
            format!("Task panicked: {}", panic.message),
            format!(
                "task '{}' in phase {} {}",
                descriptor.name(),
                descriptor.phase(),
                panic.detail
            ),
        )),
    }
}

fn classify(descriptor: &TaskDescriptor, error: anyhow::Error) -> TaskFailure {
    let kind = error
        .chain()
        .find_map(|cause| {
            if let Some(error) = cause.downcast_ref::<TaskError>() {
                Some(match error {
                    TaskError::UserInput(_) => FailureKind::UserInput,
                    TaskError::Action(_) => FailureKind::Action,
                })
            } else if cause.is::<std::io::Error>() {
                Some(FailureKind::Action)
            } else {
                None
            }
        })
        .unwrap_or(FailureKind::Unexpected);

    let detail = (!kind.is_expected()).then(|| format!("{error:?}"));

    TaskFailure {
        task: descriptor.name().to_string(),
        phase: descriptor.phase().clone(),
        kind,
        message: format!("{error:#}"),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use camino::Utf8Path;

    use super::*;
    use crate::change::Detection;
    use crate::{Extension, Registry, TaskDeclaration};

    fn run<F>(callback: F) -> Result<(), TaskFailure>
    where
        F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let registry =
            Registry::load([Extension::new("test").task_fn(TaskDeclaration::new("t"), callback)])
                .unwrap();
        let descriptor = registry.get("t").unwrap();
        let context = TaskContext::new(
            &[],
            Utf8Path::new("."),
            Detection::default(),
            tracing::Span::none(),
        );
        invoke(descriptor, &context)
    }

    #[test]
    fn test_success() {
        assert!(run(|_| Ok(())).is_ok());
    }

    #[test]
    fn test_user_input_error() {
        let failure = run(|_| Err(TaskError::user_input("no input files found").into())).unwrap_err();
        assert_eq!(failure.kind, FailureKind::UserInput);
        assert_eq!(failure.message, "no input files found");
        assert!(failure.detail.is_none());
        assert_eq!(failure.task, "t");
    }

    #[test]
    fn test_action_error_behind_context() {
        let failure = run(|_| {
            Err(TaskError::action("permission denied")).context("cannot create output directory")
        })
        .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Action);
        assert_eq!(
            failure.message,
            "cannot create output directory: permission denied"
        );
    }

    #[test]
    fn test_io_error_is_expected() {
        let failure = run(|_| {
            std::fs::read("/definitely/not/here")?;
            Ok(())
        })
        .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Action);
        assert!(failure.detail.is_none());
    }

    #[test]
    fn test_other_error_is_unexpected() {
        let failure = run(|_| anyhow::bail!("index out of range")).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Unexpected);
        assert!(failure.detail.unwrap().contains("index out of range"));
    }

    #[test]
    fn test_panic_is_unexpected() {
        let failure = run(|_| panic!("oops")).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Unexpected);
        assert_eq!(failure.message, "Task panicked: oops");

        let detail = failure.detail.unwrap();
        assert!(detail.starts_with("task 't' in phase build(500) panicked at src/sandbox.rs:"));
    }
}
