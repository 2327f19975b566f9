mod channel;
pub use channel::{channel, Channel};

mod task;
pub use task::JoinMap;
