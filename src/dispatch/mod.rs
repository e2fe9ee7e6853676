pub mod command;
pub mod dispatcher;
pub mod error;
pub mod selector;
pub mod store;

pub use command::{Command, CommandStatus};
pub use dispatcher::CommandDispatcher;
pub use error::DispatchError;
pub use selector::pick_agent;
pub use store::CommandStore;
