//! 核心层：中继错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::RelayError;
pub use shutdown::{CleanupReport, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
