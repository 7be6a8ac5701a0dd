//! Question correlation: ask a user something and await their next matching reply.
//!
//! A question registers a slot keyed by (chat, user, kind). The manager's `intercept`
//! runs before command routing and hands matching updates to the waiting handler;
//! everything else passes through. A limiter caps how many questions run at once.

mod error;
mod limiter;
mod manager;
mod registry;
mod session;

pub use error::{AnswerError, QuestionError, SessionError};
pub use limiter::{AdmissionPolicy, ConcurrencyLimiter, SessionPermit, DEFAULT_MAX_CONCURRENT};
pub use manager::{Interception, Manager, ManagerOptions};
pub use registry::{Answers, Delivery, PendingRegistry, SlotHandle, DEFAULT_SHARDS};
pub use session::{SessionId, SessionOutcome};
