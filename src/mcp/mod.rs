// Model Context Protocol server over stdio

pub mod protocol;
pub mod server;

pub use server::McpServer;
