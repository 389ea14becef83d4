//! §4.5 `wait`/`exit`. The parent/child handoff never blocks while holding
//! the `ChildStatus` mutex — the same deadlock-avoidance rule
//! `sync::condvar` applies: drop the guard, then call `scheduler::block`.

use alloc::sync::Arc;
use spin::Mutex;

use crate::process::ChildStatus;
use crate::thread::{scheduler, ThreadId};

/// §4.5 `wait`: returns -1 immediately if `pid` never was (or no longer
/// is) a waitable child of the caller; otherwise blocks until the child
/// exits, then consumes its record and returns its exit status. A process
/// may wait on each of its children at most once.
pub fn wait(pid: ThreadId) -> i32 {
    let current = scheduler::current_id();
    let record = scheduler::with_thread(current, |t| {
        t.user.as_ref().and_then(|u| u.children.iter().find(|c| c.lock().child_id == pid).cloned())
    })
    .flatten();
    let Some(record) = record else { return -1 };

    {
        let status = record.lock();
        if status.waited || status.fork_failed {
            return -1;
        }
    }

    loop {
        let mut status = record.lock();
        if status.has_exited {
            break;
        }
        status.waiting_parent = Some(current);
        drop(status);
        scheduler::block();
    }

    let mut status = record.lock();
    status.waited = true;
    let exit_status = status.exit_status;
    drop(status);

    scheduler::with_thread_mut(current, |t| {
        if let Some(u) = t.user.as_mut() {
            u.children.retain(|c| !Arc::ptr_eq(c, &record));
        }
    });
    exit_status
}

/// §4.5/§10 item 2: records the exit status, restores write access and
/// closes the executable, closes every open fd, prints `"<name>: exit(
/// <status>)"`, signals a waiting parent (if any) by direct `ThreadId`
/// wakeup, and terminates the calling thread. Never returns.
pub fn exit(status: i32) -> ! {
    let current = scheduler::current_id();
    let name = scheduler::with_thread(current, |t| t.name.clone()).unwrap_or_default();

    scheduler::with_thread_mut(current, |t| {
        if let Some(u) = t.user.as_mut() {
            u.exit_status = status;
            if let Some(exe) = u.executable.take() {
                crate::process::fs::with(|fs| {
                    fs.allow_write(exe);
                    fs.close(exe);
                });
            }
            for handle in u.fd_table.all_open() {
                crate::process::fs::with(|fs| fs.close(handle));
            }
        }
    });

    crate::log_info!("{}: exit({})", name, status);

    let child_info = scheduler::with_thread(current, |t| t.user.as_ref().and_then(|u| u.child_info.clone())).flatten();
    if let Some(info) = child_info {
        let waiter = {
            let mut s = info.lock();
            s.has_exited = true;
            s.exit_status = status;
            s.waiting_parent.take()
        };
        if let Some(parent) = waiter {
            scheduler::unblock(parent);
        }
    }

    scheduler::exit_current();
    unreachable!("exit_current never returns")
}

fn fail_child(info: &Arc<Mutex<ChildStatus>>) {
    let waiter = {
        let mut s = info.lock();
        s.fork_failed = true;
        s.waiting_parent.take()
    };
    if let Some(parent) = waiter {
        scheduler::unblock(parent);
    }
}

pub(crate) use fail_child as mark_fork_failed;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootConfig;
    use crate::hal::MemAddressSpace;
    use crate::process::ProcessImage;

    extern "C" fn noop_entry(_aux: usize) -> ! {
        loop {}
    }

    #[test]
    fn wait_on_unknown_child_returns_minus_one() {
        let _g = scheduler::test_reset();
        scheduler::init(BootConfig::default());
        let parent = scheduler::create("parent", 20, noop_entry, 0).unwrap();
        scheduler::with_thread_mut(parent, |t| t.user = Some(ProcessImage::new(alloc::boxed::Box::new(MemAddressSpace::new()))));
        assert_eq!(wait(ThreadId(999)), -1);
    }

    #[test]
    fn wait_on_already_exited_child_returns_status_immediately() {
        let _g = scheduler::test_reset();
        scheduler::init(BootConfig::default());
        let parent = scheduler::create("parent", 20, noop_entry, 0).unwrap();
        let child = scheduler::create("child", 20, noop_entry, 0).unwrap();
        let record = Arc::new(Mutex::new(ChildStatus::new(child)));
        {
            let mut s = record.lock();
            s.has_exited = true;
            s.exit_status = 7;
        }
        scheduler::with_thread_mut(parent, |t| {
            let mut img = ProcessImage::new(alloc::boxed::Box::new(MemAddressSpace::new()));
            img.children.push(record.clone());
            t.user = Some(img);
        });
        assert_eq!(wait(child), 7);
        let still_there = scheduler::with_thread(parent, |t| t.user.as_ref().unwrap().children.len()).unwrap();
        assert_eq!(still_there, 0);
    }

    #[test]
    fn double_wait_on_same_child_returns_minus_one() {
        let _g = scheduler::test_reset();
        scheduler::init(BootConfig::default());
        let parent = scheduler::create("parent", 20, noop_entry, 0).unwrap();
        let child = scheduler::create("child", 20, noop_entry, 0).unwrap();
        let record = Arc::new(Mutex::new(ChildStatus::new(child)));
        {
            let mut s = record.lock();
            s.has_exited = true;
        }
        scheduler::with_thread_mut(parent, |t| {
            let mut img = ProcessImage::new(alloc::boxed::Box::new(MemAddressSpace::new()));
            img.children.push(record.clone());
            t.user = Some(img);
        });
        wait(child);
        record.lock().waited = true;
        assert_eq!(wait(child), -1);
    }
}
