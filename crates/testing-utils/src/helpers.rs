//! Test helper utilities

use std::sync::Arc;

use taskgate_core::{CapabilityCatalog, ManualClock};

/// 测试常用的能力目录：compute / storage / gpu
pub fn test_catalog() -> CapabilityCatalog {
    CapabilityCatalog::new(["compute", "storage", "gpu"])
}

/// 从当前时间开始的手动时钟
pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::starting_now())
}
