//! 轮毂式网关：核心（Hub）只认识统一的消息格式，聊天平台作为 Spoke 接入
//!
//! - **message**：出站意图 `PostMessage` 与入站事件 `InboundMessage`
//! - **spoke**：`ChatSpoke` 出站端口，以及终端 / 记录型实现

mod message;
mod spoke;

pub use message::{InboundMessage, PostMessage};
pub use spoke::{ChatSpoke, ConsoleSpoke, DeliveryError, RecordingSpoke};
