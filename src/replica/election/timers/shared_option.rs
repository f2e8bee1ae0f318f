use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Default)]
pub(super) struct SharedOption<T> {
    data: Arc<Mutex<Option<T>>>,
}

impl<T> SharedOption<T> {
    pub(super) fn new() -> Self {
        SharedOption {
            data: Arc::new(Mutex::new(None)),
        }
    }

    pub(super) fn replace(&self, new_data: T) {
        self.lock().replace(new_data);
    }

    pub(super) fn take(&self) -> Option<T> {
        self.lock().take()
    }

    pub(super) fn is_some(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
