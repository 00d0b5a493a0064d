use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, error};

use crate::base::bus::RegisterBus;
use crate::error::RepairResult;

/// Register holding the owner token of the cross-process wrapper mutex.
pub const HW_MUTEX_REG: &str = "HBM_WRAPPER_MUTEX";
const HW_MUTEX_FREE: u32 = 0;
const HW_MUTEX_SPIN: Duration = Duration::from_micros(50);

/// Exclusive access to a site's wrapper registers for the lifetime of the
/// guard. Dropping the guard releases the hardware mutex (if one was taken)
/// and then the in-process lock.
pub struct AccessGuard<'a> {
    hw: Option<HwMutexHold>,
    _local: MutexGuard<'a, ()>,
}

impl<'a> AccessGuard<'a> {
    pub fn local(local: MutexGuard<'a, ()>) -> Self {
        Self { hw: None, _local: local }
    }

    pub fn with_hw(local: MutexGuard<'a, ()>, hw: HwMutexHold) -> Self {
        Self { hw: Some(hw), _local: local }
    }

    pub fn holds_hw_mutex(&self) -> bool {
        self.hw.is_some()
    }
}

/// Held cross-process hardware mutex; released on drop.
pub struct HwMutexHold {
    bus: Arc<dyn RegisterBus>,
    token: u32,
}

impl Drop for HwMutexHold {
    fn drop(&mut self) {
        if let Err(err) = self.bus.write32(HW_MUTEX_REG, 0, HW_MUTEX_FREE) {
            error!("failed to release wrapper mutex (token {:#x}): {}", self.token, err);
        } else {
            debug!("released wrapper mutex (token {:#x})", self.token);
        }
    }
}

/// Token identifying this process to the hardware mutex.
pub fn owner_token() -> u32 {
    std::process::id().max(1)
}

/// Block until the hardware mutex register holds our token. No timeout: the
/// wrapper bank is a single-writer resource and the caller waits its turn.
pub fn acquire_hw_mutex(bus: Arc<dyn RegisterBus>, token: u32) -> RepairResult<HwMutexHold> {
    loop {
        let owner = bus.read32(HW_MUTEX_REG, 0)?;
        if owner == HW_MUTEX_FREE {
            bus.write32(HW_MUTEX_REG, 0, token)?;
            if bus.read32(HW_MUTEX_REG, 0)? == token {
                debug!("acquired wrapper mutex (token {:#x})", token);
                return Ok(HwMutexHold { bus, token });
            }
        } else if owner == token {
            return Ok(HwMutexHold { bus, token });
        }
        thread::sleep(HW_MUTEX_SPIN);
    }
}

/// In-process single-writer lock shared by every transport instance.
pub fn lock_local(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    // a panic while holding the lock leaves no protected data behind
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
