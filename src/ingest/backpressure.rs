//! Per-agent in-flight accounting.
//!
//! Each accepted request holds a permit for the events it is still
//! publishing. Dropping the permit returns the capacity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct InFlightLimiter {
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
    retry_after: Duration,
}

/// Capacity held for one request.
#[derive(Debug)]
pub struct InFlightPermit {
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
    agent_id: String,
    count: usize,
}

impl InFlightLimiter {
    pub fn new(retry_after: Duration) -> Self {
        Self {
            in_flight: Arc::default(),
            retry_after,
        }
    }

    /// Reserve `count` events for `agent_id` under `cap`.
    pub fn try_acquire(&self, agent_id: &str, count: usize, cap: usize) -> Result<InFlightPermit> {
        let mut in_flight = self.in_flight.lock();
        let current = in_flight.get(agent_id).copied().unwrap_or(0);
        if current + count > cap {
            return Err(Error::ResourceExhausted {
                message: format!(
                    "agent {} has {} events in flight, cap {}",
                    agent_id, current, cap
                ),
                retry_after: self.retry_after,
            });
        }
        in_flight.insert(agent_id.to_string(), current + count);
        Ok(InFlightPermit {
            in_flight: self.in_flight.clone(),
            agent_id: agent_id.to_string(),
            count,
        })
    }

    pub fn in_flight(&self, agent_id: &str) -> usize {
        self.in_flight.lock().get(agent_id).copied().unwrap_or(0)
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        if let Some(current) = in_flight.get_mut(&self.agent_id) {
            *current = current.saturating_sub(self.count);
            if *current == 0 {
                in_flight.remove(&self.agent_id);
            }
        }
    }
}
