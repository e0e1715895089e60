use crate::models::Message;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A message passed the send barrier; fan-out may proceed.
    MessageSent(Message),
    /// A message was retracted; conversation snippets may need rewriting.
    MessageRecalled(Message),
}

pub struct EventBus {
    pub sender: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn publish(&self, event: CoreEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }
}
