use std::{future::Future, time::Duration};

/// Spawns a task on the current thread's executor.
///
/// Natively this is [`tokio::task::spawn_local`], so callers must be running inside a
/// [`tokio::task::LocalSet`].
pub(crate) fn spawn_local<F>(fut: F)
where
    F: Future<Output = ()> + 'static,
{
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "wasm32")] {
            wasm_bindgen_futures::spawn_local(fut);
        } else {
            // Detached, cancellation goes through the futures' own abort handles.
            drop(tokio::task::spawn_local(fut));
        }
    }
}

pub(crate) async fn sleep(duration: Duration) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "wasm32")] {
            gloo_timers::future::sleep(duration).await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Whether entries live in a server-like environment, where nothing is ever collected by default.
pub(crate) const fn is_server() -> bool {
    cfg!(feature = "ssr")
}
