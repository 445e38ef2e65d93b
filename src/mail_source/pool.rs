use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;

/// An object that can be handed out repeatedly. `reinitialize` runs on
/// every checkout; nothing from a previous use may be relied upon.
pub trait Reusable: Send {
    fn reinitialize(&mut self) -> Result<()>;
}

/// Checkout/return pool of reusable objects. At most `max_idle` objects are
/// kept between uses; extra ones are dropped on return.
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    create: Box<dyn Fn() -> T + Send + Sync>,
    max_idle: usize,
}

impl<T: Reusable> Pool<T> {
    pub fn new(max_idle: usize, create: impl Fn() -> T + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Pool { idle: Mutex::new(Vec::new()), create: Box::new(create), max_idle })
    }

    pub fn acquire(self: &Arc<Self>) -> Result<Pooled<T>> {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let mut item = idle.unwrap_or_else(|| (self.create)());
        item.reinitialize()?;
        Ok(Pooled { pool: Arc::clone(self), item: Some(item) })
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release(&self, item: T) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }
}

/// A checked-out object; goes back to its pool when dropped.
pub struct Pooled<T: Reusable> {
    pool: Arc<Pool<T>>,
    item: Option<T>,
}

impl<T: Reusable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item is present until drop")
    }
}

impl<T: Reusable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item is present until drop")
    }
}

impl<T: Reusable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.release(item);
        }
    }
}
