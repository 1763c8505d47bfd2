use std::future::Future;
use std::thread;

use once_cell::sync::Lazy;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};

static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("strait-io")
        .enable_all()
        .build()
        .expect("tokio runtime")
});

pub(crate) fn spawn_on_global<F>(future: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    RUNTIME.spawn(future)
}

/// Drives `future` to completion from synchronous code.
///
/// Callers are session workers, relay threads or user threads. When invoked
/// from inside a multi-thread runtime the wait is moved off the async
/// scheduler so the I/O threads never park. A current-thread runtime cannot
/// give up its only thread, so the wait happens on a scoped OS thread.
pub(crate) fn block_on<F>(future: F) -> F::Output
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
            thread::scope(|scope| match scope.spawn(|| RUNTIME.block_on(future)).join() {
                Ok(output) => output,
                Err(panic) => std::panic::resume_unwind(panic),
            })
        }
        Ok(handle) => tokio::task::block_in_place(|| handle.block_on(future)),
        Err(_) => RUNTIME.block_on(future),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn seven() -> u32 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        7
    }

    #[test]
    fn waits_outside_any_runtime() {
        assert_eq!(block_on(seven()), 7);
    }

    #[tokio::test]
    async fn waits_inside_a_current_thread_runtime() {
        assert_eq!(block_on(seven()), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waits_inside_a_multi_thread_runtime() {
        assert_eq!(block_on(seven()), 7);
    }
}
