//! Client side of the fee ledger: a typed REST client that validates forms
//! before sending them, and an explicit query cache driven by change events.

pub mod api;
pub mod cache;

pub use api::{ApiClient, ClientError, PaymentForm, Problem, ReceiptFile, UploadedReceipt};
pub use cache::{CachedQuery, FeedMessage, LedgerSession, QueryCache};
