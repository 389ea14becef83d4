//! §4.2 — counting semaphore, owner-tracked mutex with priority donation,
//! and condition variable. Grounded on `original_source/threads/synch.c`'s
//! shapes; waiter lists are plain `Vec<ThreadId>` per §9 REDESIGN FLAGS
//! (arena + integer handles instead of an intrusive list).

pub mod condvar;
pub mod lock;
pub mod semaphore;

pub use condvar::CondVar;
pub use lock::Lock;
pub use semaphore::Semaphore;
