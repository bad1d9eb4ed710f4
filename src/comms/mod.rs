pub mod channel;
pub mod envelope;

pub use channel::{MessageHandler, ProcessCommunication, SubscriptionId};
pub use envelope::{Envelope, Inbound, LineBuffer, MessageKind};
