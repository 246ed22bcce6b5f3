pub mod builtin;
pub mod dispatcher;
pub mod registry;
pub mod table;

pub use dispatcher::ToolDispatcher;
pub use registry::ToolRegistry;
pub use table::ToolRequestTable;
