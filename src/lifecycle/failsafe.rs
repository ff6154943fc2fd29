//! Traffic failsafe.
//!
//! Whenever the VM is not known to be serving traffic, the failsafe removes
//! the diversion route so the host is left with no unprotected egress path
//! rather than a leaking one.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::network::NetworkAdapter;

pub struct FailSafe {
    adapter: Arc<dyn NetworkAdapter>,
    active: Mutex<bool>,
}

impl FailSafe {
    pub fn new(adapter: Arc<dyn NetworkAdapter>) -> Self {
        Self {
            adapter,
            active: Mutex::new(false),
        }
    }

    /// Engage the failsafe, tearing down the diversion route. Idempotent.
    pub async fn activate(&self) {
        let mut active = self.active.lock().await;
        if *active {
            return;
        }

        error!("failsafe: ACTIVATING - blocking all network traffic");
        if let Err(e) = self.adapter.teardown_routing().await {
            error!("failsafe: teardown routing: {:#}", e);
        }
        *active = true;
    }

    /// Disengage the failsafe. Idempotent. Routing restoration is the
    /// RestoreNetwork state's job, not ours.
    pub async fn deactivate(&self) {
        let mut active = self.active.lock().await;
        if !*active {
            return;
        }

        info!("failsafe: deactivating");
        *active = false;
    }

    /// Whether the failsafe is currently engaged.
    pub async fn is_active(&self) -> bool {
        *self.active.lock().await
    }
}
