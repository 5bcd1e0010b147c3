//! Borrow pools for draw and batch records
//!
//! A [`Pool`] owns a fixed population of records. [`Pool::borrow`] hands out a
//! [`Loan`] and blocks when the pool is empty — pool exhaustion is
//! back-pressure, not an error. Dropping the loan returns the record.

use std::sync::{Arc, Condvar, Mutex};

struct PoolInner<T> {
    items: Mutex<Vec<T>>,
    returned: Condvar,
}

/// Fixed-population object pool with blocking borrow
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Pool<T> {
    /// Creates a pool of `capacity` records produced by `factory`
    pub fn new(capacity: usize, factory: impl FnMut() -> T) -> Self {
        assert!(capacity > 0, "pool capacity must be non-zero");
        let mut factory = factory;
        let items = (0..capacity).map(|_| factory()).collect();
        Self {
            inner: Arc::new(PoolInner {
                items: Mutex::new(items),
                returned: Condvar::new(),
            }),
        }
    }

    /// Borrows a record, blocking while the pool is empty
    pub fn borrow(&self) -> Loan<T> {
        let mut items = self.inner.items.lock().unwrap();
        loop {
            if let Some(item) = items.pop() {
                return Loan {
                    item: Some(item),
                    pool: Arc::clone(&self.inner),
                };
            }
            items = self.inner.returned.wait(items).unwrap();
        }
    }

    /// Number of records currently available
    pub fn available(&self) -> usize {
        self.inner.items.lock().unwrap().len()
    }
}

/// Unique handle to a pooled record; returns it to the pool on drop
pub struct Loan<T> {
    item: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> std::ops::Deref for Loan<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().unwrap()
    }
}

impl<T> std::ops::DerefMut for Loan<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap()
    }
}

impl<T> Drop for Loan<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.items.lock().unwrap().push(item);
            self.pool.returned.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_loan_returns_on_drop() {
        let pool = Pool::new(2, || 0u32);
        assert_eq!(pool.available(), 2);
        {
            let mut loan = pool.borrow();
            *loan = 7;
            assert_eq!(pool.available(), 1);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_borrow_blocks_until_return() {
        let pool = Pool::new(1, Vec::<u8>::new);
        let held = pool.borrow();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let loan = pool.borrow();
                loan.len()
            })
        };

        std::thread::sleep(Duration::from_millis(5));
        drop(held);
        assert_eq!(waiter.join().unwrap(), 0);
    }
}
