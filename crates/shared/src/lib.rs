//! 共享库
//!
//! 包含服务共用的配置加载、错误处理、可观测性初始化和 JSON 文件持久化等基础设施代码。

pub mod config;
pub mod error;
pub mod observability;
pub mod persistence;
