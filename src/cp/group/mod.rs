mod command;
mod dedup;
mod session;
mod state_machine;

pub(crate) use command::GroupCommand;
pub(crate) use command::GroupResponse;
pub(crate) use command::RequestId;
pub(crate) use command::Value;
pub(crate) use state_machine::decode_response;
pub(crate) use state_machine::GroupStateMachine;
