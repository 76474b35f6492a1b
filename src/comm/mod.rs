//! Peer link state machine (`entity`), the servicing thread that drives it
//! (`fsm`), the request/response mailbox (`transport`), and link lifecycle
//! management (`link_manager`).

pub mod entity;
pub mod fsm;
pub mod link_manager;
pub mod transport;

pub use entity::{CommEntity, FsmState};
pub use fsm::Driver;
pub use link_manager::LinkManager;
pub use transport::Mailbox;
