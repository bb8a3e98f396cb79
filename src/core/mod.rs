//! 核心数据与基础设施
//!
//! 包含数据模型、事件端口和扫描互斥守卫

pub mod events;
pub mod models;
pub mod scan_gate;
