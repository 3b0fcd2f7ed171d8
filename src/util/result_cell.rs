use tokio::sync::watch;

/// A value that is assigned at most once and can be awaited by any number of tasks. The first
///  assignment wins, later attempts are rejected - this is what makes call resolution
///  'exactly once' no matter how many results, errors and cancellations race for it.
#[derive(Debug)]
pub struct ResultCell<T: Clone> {
    sender: watch::Sender<Option<T>>,
}

impl<T: Clone> ResultCell<T> {
    pub fn new() -> ResultCell<T> {
        let (sender, _) = watch::channel(None);
        ResultCell { sender }
    }

    /// returns `true` if and only if this invocation assigned the value
    pub fn try_set(&self, value: T) -> bool {
        let mut value = Some(value);
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = value.take();
            true
        })
    }

    pub fn get(&self) -> Option<T> {
        self.sender.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.sender.borrow().is_some()
    }

    pub async fn wait(&self) -> T {
        let mut receiver = self.sender.subscribe();
        loop {
            if let Some(value) = receiver.borrow_and_update().as_ref() {
                return value.clone();
            }
            if receiver.changed().await.is_err() {
                // the sender is owned by `self`, so this can not happen while we are borrowed
                std::future::pending::<()>().await;
            }
        }
    }
}

impl<T: Clone> Default for ResultCell<T> {
    fn default() -> Self {
        ResultCell::new()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_first_assignment_wins() {
        let cell = ResultCell::new();
        assert!(!cell.is_set());
        assert!(cell.try_set(1));
        assert!(!cell.try_set(2));
        assert_eq!(cell.get(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_later_assignment() {
        let cell = Arc::new(ResultCell::new());

        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        cell.try_set("a");
        assert_eq!(waiter.await.unwrap(), "a");
        assert_eq!(cell.wait().await, "a");
    }
}
