//! 工具层：schema 声明、注册表、分发器与内置工具

pub mod call;
pub mod dispatcher;
pub mod echo;
pub mod http;
pub mod nutrition;
pub mod registry;
pub mod schema;

pub use call::{ToolCall, ToolError, ToolResult, ToolStatus};
pub use dispatcher::ToolDispatcher;
pub use echo::EchoTool;
pub use http::HttpTool;
pub use nutrition::{NutrientLookupTool, ProfileLookupTool};
pub use registry::{Tool, ToolRegistry};
pub use schema::{FieldSpec, FieldType, InputSchema, ToolSchema};
