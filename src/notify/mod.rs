pub mod registry;
pub mod session;

pub use registry::{DeliveryError, NotificationRegistry, NotificationSink, PublishReport, Subscription};
pub use session::{NotificationSource, SessionEvent, SessionState, StreamingSession};
