// Single-process event bus: a bounded fan-out queue with asynchronous
// delivery. Handlers run serially per event; a failing handler is logged
// and does not affect the others. Events published before `start` buffer
// in the queue; after `stop` they are dropped with a warning.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{debug, warn};

use super::{EventBus, EventHandler, RepositoryEvent};
use crate::error::Result;

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub struct MemoryEventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    sender: mpsc::Sender<RepositoryEvent>,
    receiver: Mutex<Option<mpsc::Receiver<RepositoryEvent>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        let (shutdown, _) = watch::channel(false);
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            sender,
            receiver: Mutex::new(Some(receiver)),
            shutdown,
            task: Mutex::new(None),
        }
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: RepositoryEvent) -> Result<()> {
        if let Err(e) = self.sender.send(event).await {
            warn!("event dropped, dispatch loop not running: {e}");
        }
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        debug!("registered event handler: {}", handler.name());
        self.handlers.write().await.push(handler);
    }

    async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let Some(receiver) = self.receiver.lock().await.take() else {
            return Ok(());
        };

        let handlers = Arc::clone(&self.handlers);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut events = ReceiverStream::new(receiver);
            loop {
                tokio::select! {
                    maybe_event = events.next() => {
                        let Some(event) = maybe_event else { break };
                        let handlers = handlers.read().await.clone();
                        for handler in handlers {
                            if let Err(e) = handler.handle(&event).await {
                                warn!(
                                    handler = handler.name(),
                                    event_id = %event.event_id,
                                    "event handler failed: {e:#}"
                                );
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}
