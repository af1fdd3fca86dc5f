//! Global Virtual Time.
//!
//! GVT is a lower bound on the receive time of every event any thread may
//! still process. Once it passes an event, that event can never be rolled
//! back to, so its buffer may be reclaimed.

mod manager;
mod message;

pub use manager::{GvtLink, GvtManager, ROOT_RANK};
pub use message::{GvtHeader, GvtMessage, GvtMsgKind, GVT_HEADER_SIZE};
