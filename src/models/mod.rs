pub mod invoice;
pub mod outcome;
pub mod payload;
pub mod series;

pub use invoice::{
    ArtifactPaths, InvoiceDetail, InvoiceFilter, InvoiceLineItem, InvoiceRecord, InvoiceStatus,
    NewInvoice, SubmissionUpdate,
};
pub use outcome::{FailureKind, ProcessOutcome};
pub use payload::{CfdiItem, CfdiPayload, DocumentTotals, GlobalInformation, Receiver, TaxEntry};
pub use series::{SeriesDefinition, SeriesSummary};
