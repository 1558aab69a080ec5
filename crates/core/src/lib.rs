//! Domain layer for the school fee ledger: fees, payments, submission rules,
//! the verification state machine and the typed change model shared by the
//! server and its clients.

pub mod change;
pub mod types;
pub mod validation;
pub mod workflow;

pub use change::{
    ChangeEvent, ChangeKind, ChangeScope, FeeStatusFilter, PaymentFilter, QueryKey, Topic,
    RESYNC_EVENT,
};
pub use types::{
    DashboardStatus, Fee, FeeDetail, FeeId, FeeStatus, Payment, PaymentId, PaymentMethod,
    PaymentStatus, Student, StudentId, UnknownVariant,
};
pub use validation::{
    check_submission, validate_receipt_file, NewPayment, SubmissionError, MAX_AMOUNT_SCALE,
    MAX_PAYMENT_UNITS, MAX_RECEIPT_BYTES,
};
pub use workflow::{TransitionError, VerificationDecision, VerificationRequest};
