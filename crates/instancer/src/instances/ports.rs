// SPDX-FileCopyrightText: 2025 Aaron Dewes <aaron@nirvati.org>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    #[error("No free port left in range {min}-{max}")]
    PoolExhausted { min: u16, max: u16 },
}

#[derive(Debug)]
struct PortPool {
    min: u16,
    max: u16,
    cursor: u16,
    in_use: BTreeSet<u16>,
}

/// Hands out host ports from an inclusive range. A port stays taken until
/// it is released, even if the range is changed in between.
#[derive(Debug)]
pub struct PortAllocator {
    pool: Mutex<PortPool>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            pool: Mutex::new(PortPool {
                min,
                max,
                cursor: min,
                in_use: BTreeSet::new(),
            }),
        }
    }

    pub fn set_range(&self, min: u16, max: u16) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if (pool.min, pool.max) == (min, max) {
            return;
        }
        tracing::info!("Port range changed to {}-{}", min, max);
        pool.min = min;
        pool.max = max;
        pool.cursor = min;
    }

    pub fn range(&self) -> (u16, u16) {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        (pool.min, pool.max)
    }

    /// Round-robins through the range so a just-released port is not handed
    /// out again right away.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        let (min, max) = (pool.min, pool.max);
        if min > max {
            return Err(PortError::PoolExhausted { min, max });
        }
        let span = u32::from(max) - u32::from(min) + 1;
        let start = u32::from(pool.cursor.clamp(min, max)) - u32::from(min);
        for step in 0..span {
            let offset = (start + step) % span;
            // offset < span, so this always fits back into u16
            let port = (u32::from(min) + offset) as u16;
            if pool.in_use.insert(port) {
                pool.cursor = if port == max { min } else { port + 1 };
                return Ok(port);
            }
        }
        Err(PortError::PoolExhausted { min, max })
    }

    pub fn release(&self, port: u16) -> bool {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use
            .remove(&port)
    }

    pub fn in_use(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use
            .len()
    }
}
