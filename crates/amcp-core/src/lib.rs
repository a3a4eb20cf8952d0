pub mod bus;
pub mod id;

pub use bus::{EventBus, EventPriority, HandlerId};
