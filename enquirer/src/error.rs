//! Error type of the enquirer.
use std::path::PathBuf;

use dicom_core::Tag;
use snafu::Snafu;

/// Boxed association error, as raised by the upper layer protocol.
pub type AssociationError = Box<dicom_ul::association::Error>;

#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The transport to the peer could not be set up
    #[snafu(display("Unable to set up the network: {message}"))]
    NetworkInitializationFailure { message: String },

    /// The peer rejected the association or negotiation failed
    #[snafu(display("Unable to negotiate association: {source}"))]
    NegotiateAssociationFailure { source: AssociationError },

    /// No usable presentation context was negotiated
    #[snafu(display("There is no presentation context for {operation}"))]
    PresentationContextMissing { operation: &'static str },

    /// A retrieve or store request did not succeed
    #[snafu(display("{message}"))]
    RequestFailure {
        message: String,
        series_uid: Option<String>,
        status: Option<u16>,
    },

    /// Not connected to a peer
    NotConnected,

    /// Could not exchange messages with the peer
    #[snafu(display("Association failure: {source}"))]
    Association { source: AssociationError },

    /// Could not stream data set fragments to the peer
    SendData { source: std::io::Error },

    /// Could not read data set fragments from the peer
    ReceiveData { source: std::io::Error },

    /// Could not encode DIMSE command
    WriteCommand { source: dicom_object::WriteError },

    /// Could not encode data set
    WriteDataset { source: dicom_object::WriteError },

    /// Could not decode DIMSE command
    ReadCommand { source: dicom_object::ReadError },

    /// Could not decode data set
    ReadDataset { source: dicom_object::ReadError },

    /// Missing or unreadable attribute
    #[snafu(display("Missing or unreadable attribute {tag}"))]
    MissingAttribute { tag: Tag },

    /// Unsupported transfer syntax
    #[snafu(display("Unsupported transfer syntax {uid}"))]
    UnsupportedTransferSyntax { uid: String },

    /// The peer sent something other than the expected message
    #[snafu(display("Unexpected PDU from peer: {description}"))]
    UnexpectedPdu { description: String },

    /// Could not create directory
    #[snafu(display("Could not create directory {}: {source}", path.display()))]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Could not open DICOM file
    #[snafu(display("Could not open DICOM file {}: {source}", path.display()))]
    OpenFile {
        path: PathBuf,
        source: dicom_object::ReadError,
    },

    /// Could not build file meta group
    BuildMeta { source: dicom_object::meta::Error },

    /// Could not write DICOM file
    #[snafu(display("Could not write DICOM file {}: {source}", path.display()))]
    WriteFile {
        path: PathBuf,
        source: dicom_object::WriteError,
    },

    /// Invalid configuration
    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfiguration { message: String },

    /// Could not listen for incoming associations
    Bind { source: std::io::Error },

    /// Could not accept incoming association
    Accept { source: AssociationError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The series instance UID of the request that failed, if any.
    pub fn series_uid(&self) -> Option<&str> {
        match self {
            Error::RequestFailure { series_uid, .. } => series_uid.as_deref(),
            _ => None,
        }
    }

    /// Whether this is a [`RequestFailure`](Error::RequestFailure).
    pub fn is_request_failure(&self) -> bool {
        matches!(self, Error::RequestFailure { .. })
    }
}
