//! Restore-on-drop reservation guards
//!
//! A scheduler acquisition inside a lifecycle operation is held in a
//! [`Reservation`] until the operation commits. Any early exit — an error
//! return or a future cancellation point — drops the guard and the ids go
//! back to their pool, so no path out of the controller can leak slots.

use berth_sched::RestorePool;
use std::sync::Arc;

/// Ids reserved from one scheduler, restored on drop unless committed
pub struct Reservation {
    pool: Arc<dyn RestorePool>,
    ids: Vec<String>,
    armed: bool,
}

impl Reservation {
    pub fn new(pool: Arc<dyn RestorePool>, ids: Vec<String>) -> Self {
        Self {
            pool,
            ids,
            armed: true,
        }
    }

    /// The reserved ids
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Keep the reservation: the operation committed
    pub fn commit(mut self) -> Vec<String> {
        self.armed = false;
        std::mem::take(&mut self.ids)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed && !self.ids.is_empty() {
            self.pool.restore_ids(&self.ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingPool {
        restored: Mutex<Vec<String>>,
    }

    impl RestorePool for RecordingPool {
        fn restore_ids(&self, ids: &[String]) {
            self.restored.lock().extend(ids.iter().cloned());
        }
    }

    #[test]
    fn test_drop_restores() {
        let pool = Arc::new(RecordingPool::default());
        {
            let _reservation = Reservation::new(
                pool.clone(),
                vec!["GPU-0".to_string(), "GPU-1".to_string()],
            );
        }
        assert_eq!(*pool.restored.lock(), ["GPU-0", "GPU-1"]);
    }

    #[test]
    fn test_commit_disarms() {
        let pool = Arc::new(RecordingPool::default());
        let reservation = Reservation::new(pool.clone(), vec!["GPU-0".to_string()]);
        let ids = reservation.commit();
        assert_eq!(ids, ["GPU-0"]);
        assert!(pool.restored.lock().is_empty());
    }
}
