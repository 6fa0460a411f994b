//! Utils: 日志actor和输入校验等辅助模块

pub mod logger;
pub mod validator;
