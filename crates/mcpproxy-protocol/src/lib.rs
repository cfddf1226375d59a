//! Wire-level MCP types and the unified error taxonomy shared by every
//! other crate in this workspace.

mod error;
mod jsonrpc;
mod tool;

pub use error::{Error, ErrorContext, ErrorKind, Result};
pub use jsonrpc::{JsonRpcId, JsonRpcRequest, JsonRpcResponse, ToolCallParams, ToolCallResult};
pub use tool::{split_qualified_name, ToolAnnotations, ToolDescriptor};
