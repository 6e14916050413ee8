//! Standup - 站会周期调度与承诺生命周期引擎
//!
//! 模块划分：
//! - **admin**: 管理操作（频道、时间、时区、窗口、手动触发、跳过）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **console**: 终端控制台（本地入站消息与管理命令）
//! - **core**: 时钟、错误分类、优雅关闭
//! - **correlator**: 回复关联（窗口判定、抽取、写承诺、跟进回复）
//! - **cycle**: 站会周期、承诺与跟进的数据模型
//! - **extraction**: 承诺抽取（模式匹配 / 模型 + 超时降级）
//! - **gateway**: 聊天平台消息协议与 Spoke 出站端口
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **repository**: 周期存储（SQLite）
//! - **scheduler**: 电平触发的 tick：关窗口、跟进、站会提问

pub mod admin;
pub mod config;
pub mod console;
pub mod core;
pub mod correlator;
pub mod cycle;
pub mod extraction;
pub mod gateway;
pub mod llm;
pub mod observability;
pub mod repository;
pub mod scheduler;

pub use admin::AdminService;
pub use correlator::{ResponseCorrelator, Routed};
pub use repository::{CycleRepository, SqliteRepository};
pub use scheduler::{Scheduler, TickReport};
