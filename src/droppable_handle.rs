use std::time::Duration;

use tokio::{
    task::{JoinError, JoinHandle},
    time::timeout,
};

#[derive(Debug)]
// Join handle that aborts when it's dropped.
pub(crate) struct DroppableHandle<T>(pub(crate) JoinHandle<T>);

impl<T> DroppableHandle<T> {
    // Wait for the task to wind down on its own. If it doesn't within the grace
    // period, abort it and wait for the abort to be observed.
    pub(crate) async fn join(mut self, grace: Duration) -> Result<T, JoinError> {
        match timeout(grace, &mut self.0).await {
            Ok(result) => result,
            Err(_) => {
                self.0.abort();
                (&mut self.0).await
            }
        }
    }
}

impl<T> Drop for DroppableHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
