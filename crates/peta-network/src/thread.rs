//! Thread-pinned execution.
//!
//! Namespace-scoped kernel state (`setns`, `unshare`) belongs to an OS
//! thread, while tokio tasks may move between workers at every await. Work
//! that must observe one namespace from start to finish runs through
//! [`run_pinned`] on a thread of its own.

use std::future::Future;
use std::io;

/// Run `make()` to completion on a dedicated OS thread with its own
/// single-threaded runtime and return its output.
///
/// `make` is called on the new thread, so the future itself need not be
/// `Send`; the thread can enter a namespace before building it.
///
/// # Errors
///
/// Returns an error if the thread or runtime cannot be created, or if the
/// work panicked.
pub async fn run_pinned<F, Fut, T>(name: &str, make: F) -> io::Result<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = T>,
    T: Send + 'static,
{
    let (tx, rx) = tokio::sync::oneshot::channel();

    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let result = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map(|rt| rt.block_on(make()));
            let _ = tx.send(result);
        })?;

    rx.await
        .map_err(|_| io::Error::other("pinned thread panicked"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_on_its_own_thread() {
        let outer = std::thread::current().id();
        let (id, name) = run_pinned("peta-pinned", || async {
            tokio::task::yield_now().await;
            let current = std::thread::current();
            (current.id(), current.name().map(str::to_string))
        })
        .await
        .unwrap();

        assert_ne!(id, outer);
        assert_eq!(name.as_deref(), Some("peta-pinned"));
    }

    #[tokio::test]
    async fn panic_becomes_error() {
        let err = run_pinned("peta-panics", || async {
            panic!("boom");
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "pinned thread panicked");
    }

    #[tokio::test]
    async fn carries_fallible_results() {
        let out: io::Result<Result<u32, String>> =
            run_pinned("peta-result", || async { Err("nope".to_string()) }).await;
        assert_eq!(out.unwrap(), Err("nope".to_string()));
    }
}
