//! A DICOM association client
//! for finding series on a PACS, retrieving them and storing new ones.
//!
//! The [`SeriesEnquirer`] owns one association with the PACS
//! and drives every exchange synchronously:
//!
//! - C-ECHO through [`ping_pacs`](SeriesEnquirer::ping_pacs);
//! - C-FIND through the `find_series_by_*` family,
//!   which all request the same return keys (see [`query`]);
//! - C-GET and C-MOVE through the `pull_*` methods,
//!   C-GET sub-operations being written to the working directory
//!   by a [`SeriesWriter`];
//! - C-STORE through [`push_series`](SeriesEnquirer::push_series).
//!
//! Objects sent by a C-MOVE arrive on a separate association,
//! which [`SeriesRetriever`] can accept.
//!
//! The lower level pieces are public as well:
//! presentation context proposals in [`context`],
//! DIMSE commands in [`dimse`]
//! and the [`AssociationDriver`] with its [`AssociationHandler`] seam.

pub mod config;
pub mod context;
pub mod dimse;
pub mod driver;
pub mod enquirer;
pub mod error;
pub mod filter;
pub mod query;
pub mod retriever;
pub mod writer;

pub use config::{PacsConfiguration, RetrieveMethod};
pub use driver::{AssociationDriver, AssociationHandler, IncomingStore, RetrieveResponse};
pub use enquirer::SeriesEnquirer;
pub use error::{Error, Result};
pub use filter::SeriesFilter;
pub use retriever::SeriesRetriever;
pub use writer::{ProgressCallback, SeriesWriter};
