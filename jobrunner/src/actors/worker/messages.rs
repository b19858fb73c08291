use super::{Collected, Result};
use tokio::sync::oneshot;

pub enum WorkerMessage {
    Stop {
        response: oneshot::Sender<Result<()>>,
    },
    Wait {
        response: oneshot::Sender<Collected>,
    },
}
