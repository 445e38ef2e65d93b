use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use log::{error, info};
use tokio::task::JoinError;

use crate::dispatch::{DispatchQueue, QueueId};
use crate::mail_source::MessageSource;
use crate::settings::QueueConfig;

/// Queues that did not shut down cleanly.
#[derive(Debug)]
pub struct StopFailures(pub Vec<(QueueId, JoinError)>);

impl fmt::Display for StopFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} queue(s) failed to stop:", self.0.len())?;
        for (id, err) in &self.0 {
            write!(f, " {} ({})", id, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for StopFailures {}

/// Owns every dispatch queue. A queue is created and started the first
/// time its id is asked for.
pub struct QueueRegistry {
    source: Arc<dyn MessageSource>,
    config: QueueConfig,
    queues: Mutex<HashMap<QueueId, Arc<DispatchQueue>>>,
}

impl QueueRegistry {
    pub fn new(source: Arc<dyn MessageSource>, config: QueueConfig) -> Self {
        QueueRegistry { source, config, queues: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_create(&self, id: &QueueId) -> Arc<DispatchQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = queues.get(id) {
            return Arc::clone(queue);
        }

        let queue = DispatchQueue::new(id.clone(), Arc::clone(&self.source), self.config.clone());
        queue.start();
        queues.insert(id.clone(), Arc::clone(&queue));
        info!("Created queue {}", id);
        queue
    }

    pub fn get(&self, id: &QueueId) -> Option<Arc<DispatchQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops and forgets every queue.
    pub async fn stop(&self) -> Result<(), StopFailures> {
        let queues: Vec<_> = self.queues.lock().unwrap_or_else(PoisonError::into_inner).drain().collect();

        let mut failures = Vec::new();
        for (id, queue) in queues {
            if let Err(err) = queue.stop().await {
                error!("Queue {} failed to stop: {}", id, err);
                failures.push((id, err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StopFailures(failures))
        }
    }
}
