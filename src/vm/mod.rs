pub mod args;
pub mod instance;
pub mod qmp;
pub mod statedisk;

pub use instance::QemuInstance;
pub use qmp::{QmpClient, QmpError};

use std::time::Duration;

use anyhow::Result;

/// Contract between the lifecycle engine and the hypervisor process.
///
/// The engine only ever talks to this trait; the QEMU implementation lives
/// in `instance`, and tests substitute stubs.
#[async_trait::async_trait]
pub trait Hypervisor: Send + Sync {
    /// Launch the hypervisor process.
    async fn start(&self) -> Result<()>;

    /// Whether the child process is currently alive.
    fn is_running(&self) -> bool;

    /// Block until the child exits; returns its exit code (-1 when killed
    /// by a signal). Returns immediately if it already exited.
    async fn wait_exit(&self) -> i32;

    /// Graceful shutdown: management-protocol powerdown bounded by
    /// `timeout`, then forced kill.
    async fn stop(&self, timeout: Duration) -> Result<()>;

    /// Forcibly terminate the child.
    async fn kill(&self) -> Result<()>;
}
