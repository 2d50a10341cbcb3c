//! Domain model (ids, messages, statuses, delivery jobs, error kinds).

pub mod errors;
pub mod ids;
pub mod job;
pub mod message;
pub mod status;

pub use errors::ErrorKind;
pub use ids::{JobId, MessageId, ParseIdError};
pub use job::DeliveryJob;
pub use message::{ANONYMOUS_SENDER, NewMessage, ScheduledMessage};
pub use status::{MessageStatus, ParseStatusError, StatusCounts};
