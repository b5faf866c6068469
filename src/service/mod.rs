pub mod artifacts;
pub mod folio;
pub mod invoicing;
pub mod rate_limit;
pub mod spreadsheet;

pub use artifacts::{ArtifactError, ArtifactKind, ArtifactStore};
pub use folio::{AllocationError, SequenceAllocator};
pub use invoicing::{InvoiceOrchestrator, InvoiceRequest, ReconcileSummary};
pub use rate_limit::{InMemoryRateLimiter, RateDecision, RateLimitStore};
pub use spreadsheet::{SpreadsheetInput, SpreadsheetValidator, ValidationReport};
