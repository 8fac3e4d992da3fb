//! Human-in-the-loop approvals.
//!
//! ```text
//! requested ──► approved | rejected            (quorum reached)
//!     │
//!     └──► timeout ──► auto_approved | auto_rejected | failed
//!                 └──► escalated ──► (same as requested, once)
//! ```

mod tracker;
mod types;

pub use tracker::ApprovalTracker;
pub use types::{
    ApprovalRequest, ApprovalResponse, ApprovalSpec, ApprovalStatus, ApprovalType, Decision,
    StatusTransition, TimeoutAction,
};
