//! 记忆层：对话轮次、实体表与指代消解、持久化

pub mod conversation;
pub mod entity;
pub mod persistence;

pub use conversation::{
    ConversationMemory, ConversationTurn, MemoryStats, Message, ReferenceResolution, Role, Speaker,
};
pub use entity::{Entity, EntityCategory, EntityTable, ReferenceTarget};
pub use persistence::ConversationPersistence;
