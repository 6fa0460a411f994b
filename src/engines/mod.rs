//! 传输引擎实现
//!
//! - `http`: 基于 reqwest 的流式 HTTP 引擎，支持断点续传
//! - `simulated`: 定时器驱动的模拟引擎，开发与测试用
//! - `retry`: 引擎内部的瞬态错误重试策略

pub mod http;
pub mod retry;
pub mod simulated;

pub use http::HttpTransferEngine;
pub use retry::RetryStrategy;
pub use simulated::SimulatedTransferEngine;
