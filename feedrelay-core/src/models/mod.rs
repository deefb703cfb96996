pub mod id;
pub mod resource;

pub use id::{ResourceId, SessionId};
pub use resource::{ResourceRequest, ResourceSnapshot, ResourceUpdate};
