use std::future::Future;

use tokio::runtime::Handle;

/// Spawns a background task that nobody awaits.
///
/// Inside a tokio runtime the task is handed to that runtime; otherwise it is
/// driven to completion on a short-lived helper thread.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => {
            std::thread::spawn(move || futures::executor::block_on(future));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_without_ambient_runtime() {
        let (tx, rx) = mpsc::channel();
        spawn_detached(async move {
            tx.send(7).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[tokio::test]
    async fn uses_current_runtime() {
        let (tx, rx) = async_channel::bounded(1);
        spawn_detached(async move {
            tx.send(1).await.unwrap();
        });
        assert_eq!(rx.recv().await.unwrap(), 1);
    }
}
