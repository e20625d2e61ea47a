//! Typed per-topic endpoints over the shared session.

pub mod controller_command;
pub mod read_topic;
pub mod remote_command;
pub mod write_topic;

pub use controller_command::{CommandExecutor, CommandHandler};
pub use read_topic::{ReadTopic, TypedSample};
pub use remote_command::RemoteCommand;
pub use write_topic::WriteTopic;
