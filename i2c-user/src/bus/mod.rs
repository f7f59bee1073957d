//! The virtual bus core: messages, protocol states and the per-session
//! handoff engine that passes transactions from requesters to the
//! external agent.

pub mod functionality;
pub mod msg;
pub mod session;
pub mod state;

pub use functionality::Functionality;
pub use msg::{Message, MsgFlags, MsgHeader, Transaction, MAX_ADDR, MAX_MSG_LEN};
pub use session::Session;
pub use state::State;
