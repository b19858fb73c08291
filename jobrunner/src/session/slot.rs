use tokio::sync::watch;

#[derive(Clone, Debug)]
enum SlotState<T> {
    Empty,
    Filled(T),
    Closed,
}

/// A value that is set at most once and can be awaited by any number of tasks.
pub struct Slot<T> {
    state: watch::Sender<SlotState<T>>,
}

impl<T: Clone> Slot<T> {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SlotState::Empty);
        Self { state }
    }

    /// Hands the value back if the slot was already filled or closed.
    pub fn fill(&self, value: T) -> Result<(), T> {
        let mut value = Some(value);
        self.state.send_if_modified(|state| {
            if matches!(state, SlotState::Empty) {
                if let Some(v) = value.take() {
                    *state = SlotState::Filled(v);
                    return true;
                }
            }
            false
        });
        match value {
            None => Ok(()),
            Some(v) => Err(v),
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(*self.state.borrow(), SlotState::Filled(_))
    }

    /// Wake every waiter of a slot that will never be filled.
    pub fn close(&self) {
        self.state.send_if_modified(|state| {
            if matches!(state, SlotState::Empty) {
                *state = SlotState::Closed;
                return true;
            }
            false
        });
    }

    /// `None` if the slot was closed before being filled.
    pub async fn wait(&self) -> Option<T> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, SlotState::Empty))
            .await
            .ok()?;
        match &*state {
            SlotState::Filled(value) => Some(value.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn second_fill_is_refused() {
        let slot = Slot::new();
        assert_eq!(slot.fill(1), Ok(()));
        assert_eq!(slot.fill(2), Err(2));
        assert_eq!(slot.wait().await, Some(1));
    }

    #[tokio::test]
    async fn waiters_wake_on_fill() {
        let slot = Arc::new(Slot::new());
        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.wait().await })
        };
        tokio::task::yield_now().await;
        slot.fill("ready").unwrap();
        assert_eq!(waiter.await.unwrap(), Some("ready"));
    }

    #[tokio::test]
    async fn close_releases_waiters_but_not_values() {
        let closed: Slot<u8> = Slot::new();
        closed.close();
        assert_eq!(closed.wait().await, None);
        assert_eq!(closed.fill(1), Err(1));

        let filled = Slot::new();
        filled.fill(7).unwrap();
        filled.close();
        assert_eq!(filled.wait().await, Some(7));
    }
}
