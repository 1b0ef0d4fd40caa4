//! Bounded data-port pool shared by all session workers.
//!
//! The only shared mutable state in the server. A slot is held through an
//! RAII lease so it is returned on every exit path, including panics and
//! aborted handshakes.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

pub struct PortPool {
    base_port: u16,
    slots: Mutex<Vec<bool>>,
}

impl PortPool {
    pub fn new(base_port: u16, num_ports: usize) -> Arc<PortPool> {
        Arc::new(PortPool {
            base_port,
            slots: Mutex::new(vec![false; num_ports]),
        })
    }

    /// Claim the first free slot.
    pub fn acquire(self: &Arc<PortPool>) -> Result<PortLease> {
        let mut slots = self.slots.lock().unwrap();
        match slots.iter().position(|used| !used) {
            Some(slot) => {
                slots[slot] = true;
                Ok(PortLease {
                    pool: Arc::clone(self),
                    slot,
                })
            }
            None => Err(Error::NoFreePort),
        }
    }

    /// True if any session currently holds this slot (test hook).
    pub fn is_used(&self, slot: usize) -> bool {
        self.slots.lock().unwrap()[slot]
    }
}

/// Exclusive hold on one data port, released on drop.
pub struct PortLease {
    pool: Arc<PortPool>,
    slot: usize,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.pool.base_port + self.slot as u16
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.slots.lock().unwrap()[self.slot] = false;
    }
}
