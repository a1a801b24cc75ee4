pub mod error;
pub mod ids;
pub mod result;
pub mod schema;
pub mod tools;
pub mod wire;

pub use error::{ToolError, ToolErrorKind};
pub use ids::{RunId, ToolCallId};
pub use result::ToolResult;
pub use schema::{ToolCall, ToolSchema, ToolSpec};
pub use wire::{ToolReply, ToolRequest};
