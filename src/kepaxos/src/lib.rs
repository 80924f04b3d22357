pub mod ballot;
pub mod callbacks;
mod command;
pub mod engine;
pub mod message;

pub use ballot::{ballot_replica, ballot_value, make_ballot};
pub use callbacks::EngineCallbacks;
pub use command::CommandStatus;
pub use engine::KePaxosEngine;
pub use message::{MessageType, WireMessage};
