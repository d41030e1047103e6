pub mod adaptive;
pub mod health;
pub mod pool;
pub mod queue;

pub use adaptive::{AdaptiveController, FpsMeter, LoadProbe, SchedulingLatencyProbe};
pub use health::{HealthMonitor, HealthSnapshot, HealthStatus, SharedHealth};
pub use pool::{BufferPool, PooledBuffer};
pub use queue::{FrameQueue, QueueStats};
