//! Asynchronous message channel between the coordinator and source agents

mod protocol;
mod router;

pub use protocol::{
    AgentCommand, AgentFrame, AgentReply, AgentRequest, AgentUpstream, DuckAdvice, MediaReport,
    SourceId, Volume,
};
pub use router::{AgentEndpoint, ChannelError, Envelope, SourceRouter};
