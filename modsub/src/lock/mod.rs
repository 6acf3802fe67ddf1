//! Reader/writer lock built from one pthread mutex and one condition
//! variable, usable within a process or across processes.
//!
//! The cross-process form is embedded at a fixed offset inside a shared
//! segment: any process mapping the segment contends on the same primitive.
//! Readers only hold the mutex long enough to bump the reader counter, so a
//! read critical section runs without the mutex held and the protected
//! bytes must tolerate concurrent readers. Writers keep the mutex for the
//! whole critical section and wait on the condition variable until the
//! reader counter drains.
//!
//! Acquisition is always bounded: the caller supplies a timeout that is
//! converted to an absolute deadline up front, and a timed-out acquisition
//! leaves the lock state untouched.

use std::cell::UnsafeCell;
use std::io;
use std::mem::{self, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::ptr;

use crate::errors::{Error, Result};

/// Default timeout for registry and segment lock acquisition where no
/// caller-supplied timeout is threaded through.
pub const EVENT_LOOP_TIMEOUT_MS: u32 = 1000;

/// Bounded mutex re-take while releasing a read lock.
const READ_RELEASE_TIMEOUT_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// Absolute `CLOCK_REALTIME` deadline `add_ms` milliseconds from now.
fn abs_timespec(add_ms: u32) -> libc::timespec {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // cannot fail for CLOCK_REALTIME with a valid timespec
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };

    let add_ms = i64::from(add_ms) + i64::from(ts.tv_nsec) / 1_000_000;
    ts.tv_nsec %= 1_000_000;
    ts.tv_nsec += ((add_ms % 1000) * 1_000_000) as libc::c_long;
    ts.tv_sec += (add_ms / 1000) as libc::time_t;
    ts
}

fn os_err(ret: libc::c_int) -> Error {
    Error::Io(io::Error::from_raw_os_error(ret))
}

fn lock_err(ret: libc::c_int, what: &'static str) -> Error {
    if ret == libc::ETIMEDOUT {
        Error::LockTimeout(what)
    } else {
        os_err(ret)
    }
}

/// The raw lock: mutex, condition variable, reader counter. `#[repr(C)]`
/// so it can live at a fixed offset inside a shared segment header.
///
/// The memory must not move once [`RawRwLock::init`] has run; in-process
/// users go through the boxed [`RwLock`] wrapper, shared users allocate it
/// inside a mapping.
#[repr(C)]
pub struct RawRwLock {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
    readers: UnsafeCell<u32>,
}

unsafe impl Send for RawRwLock {}
unsafe impl Sync for RawRwLock {}

impl RawRwLock {
    /// All-zero state, what a freshly truncated segment provides. Unusable
    /// until [`RawRwLock::init`] runs.
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }

    /// Initialize in place. With `shared`, both primitives are configured
    /// `PTHREAD_PROCESS_SHARED`. Alignment of the lock's memory is a
    /// precondition; a misaligned address is an internal error.
    pub fn init(&self, shared: bool) -> Result<()> {
        if (self.mutex.get() as usize) % mem::align_of::<libc::pthread_mutex_t>() != 0
            || (self.cond.get() as usize) % mem::align_of::<libc::pthread_cond_t>() != 0
        {
            return Err(Error::Internal("rwlock address not aligned".into()));
        }

        unsafe {
            if shared {
                let mut mattr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
                let ret = libc::pthread_mutexattr_init(mattr.as_mut_ptr());
                if ret != 0 {
                    return Err(os_err(ret));
                }
                let mut ret = libc::pthread_mutexattr_setpshared(
                    mattr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                );
                if ret == 0 {
                    ret = libc::pthread_mutex_init(self.mutex.get(), mattr.as_ptr());
                }
                libc::pthread_mutexattr_destroy(mattr.as_mut_ptr());
                if ret != 0 {
                    return Err(os_err(ret));
                }

                let mut cattr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
                let ret = libc::pthread_condattr_init(cattr.as_mut_ptr());
                if ret != 0 {
                    libc::pthread_mutex_destroy(self.mutex.get());
                    return Err(os_err(ret));
                }
                let mut ret = libc::pthread_condattr_setpshared(
                    cattr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                );
                if ret == 0 {
                    ret = libc::pthread_cond_init(self.cond.get(), cattr.as_ptr());
                }
                libc::pthread_condattr_destroy(cattr.as_mut_ptr());
                if ret != 0 {
                    libc::pthread_mutex_destroy(self.mutex.get());
                    return Err(os_err(ret));
                }
            } else {
                let ret = libc::pthread_mutex_init(self.mutex.get(), ptr::null());
                if ret != 0 {
                    return Err(os_err(ret));
                }
                let ret = libc::pthread_cond_init(self.cond.get(), ptr::null());
                if ret != 0 {
                    libc::pthread_mutex_destroy(self.mutex.get());
                    return Err(os_err(ret));
                }
            }
            *self.readers.get() = 0;
        }
        Ok(())
    }

    /// Acquire in `mode` before `timeout_ms` elapses. A reader increments
    /// the counter and drops the mutex immediately; a writer keeps the
    /// mutex held for its whole critical section. A timed-out acquisition
    /// returns [`Error::LockTimeout`] and leaves the lock unchanged.
    pub fn acquire(&self, timeout_ms: u32, mode: LockMode) -> Result<()> {
        assert!(timeout_ms > 0);
        let ts = abs_timespec(timeout_ms);

        let ret = unsafe { libc::pthread_mutex_timedlock(self.mutex.get(), &ts) };
        if ret != 0 {
            return Err(lock_err(ret, "lock mutex"));
        }

        match mode {
            LockMode::Write => unsafe {
                let mut ret = 0;
                while ret == 0 && *self.readers.get() != 0 {
                    ret = libc::pthread_cond_timedwait(self.cond.get(), self.mutex.get(), &ts);
                }
                if ret != 0 {
                    libc::pthread_mutex_unlock(self.mutex.get());
                    return Err(lock_err(ret, "reader drain condition"));
                }
            },
            LockMode::Read => unsafe {
                *self.readers.get() += 1;
                libc::pthread_mutex_unlock(self.mutex.get());
            },
        }
        Ok(())
    }

    /// Release a lock taken in `mode`, broadcasting the condition when the
    /// reader count reaches zero.
    ///
    /// # Panics
    ///
    /// Releasing a write lock while readers are outstanding is a defect in
    /// this crate, never a consequence of external input, and panics.
    pub fn release(&self, mode: LockMode) {
        unsafe {
            if mode == LockMode::Read {
                let ts = abs_timespec(READ_RELEASE_TIMEOUT_MS);
                let ret = libc::pthread_mutex_timedlock(self.mutex.get(), &ts);
                if ret != 0 {
                    tracing::warn!(
                        "read release could not take the mutex ({})",
                        io::Error::from_raw_os_error(ret)
                    );
                }
                let readers = self.readers.get();
                if *readers == 0 {
                    tracing::error!("read release with no readers recorded");
                } else {
                    *readers -= 1;
                }
            }

            assert!(mode == LockMode::Read || *self.readers.get() == 0);

            if *self.readers.get() == 0 {
                libc::pthread_cond_broadcast(self.cond.get());
            }
            libc::pthread_mutex_unlock(self.mutex.get());
        }
    }

    /// Destroy both primitives. Destroying a held lock is a defect in the
    /// caller.
    pub fn destroy(&self) {
        unsafe {
            libc::pthread_mutex_destroy(self.mutex.get());
            libc::pthread_cond_destroy(self.cond.get());
        }
    }
}

/// Process-local face of [`RawRwLock`] with RAII guards. Construction
/// boxes the lock so the pthread primitives never move.
pub struct RwLock<T> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub fn new(data: T) -> Result<Box<Self>> {
        let lock = Box::new(RwLock {
            raw: RawRwLock::zeroed(),
            data: UnsafeCell::new(data),
        });
        lock.raw.init(false)?;
        Ok(lock)
    }

    pub fn read(&self, timeout_ms: u32) -> Result<RwLockReadGuard<'_, T>> {
        self.raw.acquire(timeout_ms, LockMode::Read)?;
        Ok(RwLockReadGuard { lock: self })
    }

    pub fn write(&self, timeout_ms: u32) -> Result<RwLockWriteGuard<'_, T>> {
        self.raw.acquire(timeout_ms, LockMode::Write)?;
        Ok(RwLockWriteGuard { lock: self })
    }
}

impl<T> Drop for RwLock<T> {
    fn drop(&mut self) {
        self.raw.destroy();
    }
}

pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release(LockMode::Read);
    }
}

pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release(LockMode::Write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn concurrent_readers_do_not_block() {
        let lock = RwLock::new(5u32).unwrap();
        let r1 = lock.read(100).unwrap();
        let r2 = lock.read(100).unwrap();
        assert_eq!(*r1, 5);
        assert_eq!(*r2, 5);
        drop(r1);
        drop(r2);
    }

    #[test]
    fn writer_times_out_while_reader_held() {
        let lock = RwLock::new(0u32).unwrap();
        let r = lock.read(100).unwrap();
        thread::scope(|s| {
            s.spawn(|| match lock.write(50) {
                Err(Error::LockTimeout(_)) => {}
                other => panic!("expected timeout, got {:?}", other.map(|_| ())),
            });
        });
        drop(r);

        // the read release left the lock usable
        let mut w = lock.write(100).unwrap();
        *w = 9;
        drop(w);
        assert_eq!(*lock.read(100).unwrap(), 9);
    }

    #[test]
    fn writer_proceeds_once_readers_release() {
        let lock = RwLock::new(0u32).unwrap();
        let r = lock.read(100).unwrap();
        thread::scope(|s| {
            let writer = s.spawn(|| {
                let mut w = lock.write(2000).unwrap();
                *w = 7;
            });
            thread::sleep(Duration::from_millis(50));
            drop(r);
            writer.join().unwrap();
        });
        assert_eq!(*lock.read(100).unwrap(), 7);
    }

    #[test]
    fn writer_excludes_other_writers() {
        let lock = RwLock::new(0u32).unwrap();
        let w = lock.write(100).unwrap();
        thread::scope(|s| {
            s.spawn(|| match lock.write(50) {
                Err(Error::LockTimeout(_)) => {}
                other => panic!("expected timeout, got {:?}", other.map(|_| ())),
            });
        });
        drop(w);
    }
}
