//! Presentation contexts proposed by the enquirer
//! and resolution of the negotiated ones.

use dicom_dictionary_std::uids;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::pdu::{PresentationContextNegotiated, PresentationContextResultReason};

/// Transfer syntaxes proposed for every presentation context,
/// in order of proposal.
pub static TRANSFER_SYNTAXES: &[&str] = &[
    uids::IMPLICIT_VR_LITTLE_ENDIAN,
    uids::EXPLICIT_VR_LITTLE_ENDIAN,
    // retired, still served by some archives
    uids::EXPLICIT_VR_BIG_ENDIAN,
    // JPEG baseline (process 1)
    "1.2.840.10008.1.2.4.50",
    // JPEG extended (processes 2 & 4)
    "1.2.840.10008.1.2.4.51",
    // JPEG extended (processes 3 & 5)
    "1.2.840.10008.1.2.4.52",
    // JPEG spectral selection, non-hierarchical (processes 6 & 8)
    "1.2.840.10008.1.2.4.53",
    // JPEG spectral selection, non-hierarchical (processes 7 & 9)
    "1.2.840.10008.1.2.4.54",
    // JPEG full progression, non-hierarchical (processes 10 & 12)
    "1.2.840.10008.1.2.4.55",
    // JPEG full progression, non-hierarchical (processes 11 & 13)
    "1.2.840.10008.1.2.4.56",
    // JPEG lossless, non-hierarchical (process 14)
    "1.2.840.10008.1.2.4.57",
    // JPEG lossless, non-hierarchical (process 15)
    "1.2.840.10008.1.2.4.58",
    // JPEG extended, hierarchical (processes 16 & 18)
    "1.2.840.10008.1.2.4.59",
    // JPEG extended, hierarchical (processes 17 & 19)
    "1.2.840.10008.1.2.4.60",
    // JPEG spectral selection, hierarchical (processes 20 & 22)
    "1.2.840.10008.1.2.4.61",
    // JPEG spectral selection, hierarchical (processes 21 & 23)
    "1.2.840.10008.1.2.4.62",
    // JPEG full progression, hierarchical (processes 24 & 26)
    "1.2.840.10008.1.2.4.63",
    // JPEG full progression, hierarchical (processes 25 & 27)
    "1.2.840.10008.1.2.4.64",
    // JPEG lossless, hierarchical (process 28)
    "1.2.840.10008.1.2.4.65",
    // JPEG lossless, hierarchical (process 29)
    "1.2.840.10008.1.2.4.66",
    // JPEG lossless, first-order prediction (process 14, selection value 1)
    "1.2.840.10008.1.2.4.70",
    // JPEG-LS lossless
    "1.2.840.10008.1.2.4.80",
    // JPEG-LS lossy (near-lossless)
    "1.2.840.10008.1.2.4.81",
    // RLE lossless
    "1.2.840.10008.1.2.5",
    // Deflated Explicit VR Little Endian
    "1.2.840.10008.1.2.1.99",
    // JPEG 2000 (lossless only)
    "1.2.840.10008.1.2.4.90",
    // JPEG 2000
    "1.2.840.10008.1.2.4.91",
    // MPEG2 main profile @ main level
    "1.2.840.10008.1.2.4.100",
    // MPEG2 main profile @ high level
    "1.2.840.10008.1.2.4.101",
    // JPEG 2000 part 2 multi-component (lossless only)
    "1.2.840.10008.1.2.4.92",
    // JPEG 2000 part 2 multi-component
    "1.2.840.10008.1.2.4.93",
    // JPIP referenced
    "1.2.840.10008.1.2.4.94",
    // JPIP referenced deflate
    "1.2.840.10008.1.2.4.95",
    // RFC 2557 MIME encapsulation
    "1.2.840.10008.1.2.6.1",
    // XML encoding
    "1.2.840.10008.1.2.6.2",
];

/// Number of leading entries of [`TRANSFER_SYNTAXES`]
/// which are native and uncompressed.
const UNCOMPRESSED_COUNT: usize = 3;

/// Storage SOP classes proposed so that the peer
/// can push objects back during a C-GET.
pub static STORAGE_SOP_CLASSES: &[&str] = &[
    // Computed Radiography Image Storage
    "1.2.840.10008.5.1.4.1.1.1",
    // Digital X-Ray Image Storage (presentation, processing)
    "1.2.840.10008.5.1.4.1.1.1.1",
    "1.2.840.10008.5.1.4.1.1.1.1.1",
    // Digital Mammography X-Ray Image Storage (presentation, processing)
    "1.2.840.10008.5.1.4.1.1.1.2",
    "1.2.840.10008.5.1.4.1.1.1.2.1",
    // Digital Intra-Oral X-Ray Image Storage
    "1.2.840.10008.5.1.4.1.1.1.3",
    // CT Image Storage
    "1.2.840.10008.5.1.4.1.1.2",
    // Enhanced CT Image Storage
    "1.2.840.10008.5.1.4.1.1.2.1",
    // Ultrasound Multi-frame Image Storage
    "1.2.840.10008.5.1.4.1.1.3.1",
    // MR Image Storage
    "1.2.840.10008.5.1.4.1.1.4",
    // Enhanced MR Image Storage
    "1.2.840.10008.5.1.4.1.1.4.1",
    // MR Spectroscopy Storage
    "1.2.840.10008.5.1.4.1.1.4.2",
    // Enhanced MR Color Image Storage
    "1.2.840.10008.5.1.4.1.1.4.3",
    // Ultrasound Image Storage
    "1.2.840.10008.5.1.4.1.1.6.1",
    // Secondary Capture Image Storage
    "1.2.840.10008.5.1.4.1.1.7",
    // Multi-frame Secondary Capture Image Storage (single bit, grayscale byte/word, true color)
    "1.2.840.10008.5.1.4.1.1.7.1",
    "1.2.840.10008.5.1.4.1.1.7.2",
    "1.2.840.10008.5.1.4.1.1.7.3",
    "1.2.840.10008.5.1.4.1.1.7.4",
    // 12-lead ECG Waveform Storage
    "1.2.840.10008.5.1.4.1.1.9.1.1",
    // Grayscale Softcopy Presentation State Storage
    "1.2.840.10008.5.1.4.1.1.11.1",
    // X-Ray Angiographic Image Storage
    "1.2.840.10008.5.1.4.1.1.12.1",
    // X-Ray Radiofluoroscopic Image Storage
    "1.2.840.10008.5.1.4.1.1.12.2",
    // X-Ray 3D Angiographic Image Storage
    "1.2.840.10008.5.1.4.1.1.13.1.1",
    // Breast Tomosynthesis Image Storage
    "1.2.840.10008.5.1.4.1.1.13.1.3",
    // Nuclear Medicine Image Storage
    "1.2.840.10008.5.1.4.1.1.20",
    // Raw Data Storage
    "1.2.840.10008.5.1.4.1.1.66",
    // Spatial Registration Storage
    "1.2.840.10008.5.1.4.1.1.66.1",
    // Segmentation Storage
    "1.2.840.10008.5.1.4.1.1.66.4",
    // Surface Segmentation Storage
    "1.2.840.10008.5.1.4.1.1.66.5",
    // VL Endoscopic Image Storage
    "1.2.840.10008.5.1.4.1.1.77.1.1",
    // VL Photographic Image Storage
    "1.2.840.10008.5.1.4.1.1.77.1.4",
    // Basic Text SR Storage
    "1.2.840.10008.5.1.4.1.1.88.11",
    // Enhanced SR Storage
    "1.2.840.10008.5.1.4.1.1.88.22",
    // Comprehensive SR Storage
    "1.2.840.10008.5.1.4.1.1.88.33",
    // Encapsulated PDF Storage
    "1.2.840.10008.5.1.4.1.1.104.1",
    // Positron Emission Tomography Image Storage
    "1.2.840.10008.5.1.4.1.1.128",
    // RT Image Storage
    "1.2.840.10008.5.1.4.1.1.481.1",
    // RT Dose Storage
    "1.2.840.10008.5.1.4.1.1.481.2",
    // RT Structure Set Storage
    "1.2.840.10008.5.1.4.1.1.481.3",
    // RT Plan Storage
    "1.2.840.10008.5.1.4.1.1.481.5",
];

/// The role that the local node intends to take
/// in a proposed presentation context.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServiceRole {
    /// service class user
    Scu,
    /// service class provider,
    /// as for storage contexts receiving C-GET sub-operations
    Scp,
}

/// A presentation context proposal.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProposedContext {
    pub abstract_syntax: &'static str,
    pub transfer_syntaxes: Vec<&'static str>,
    pub role: ServiceRole,
}

/// Build the full set of presentation contexts to propose:
/// verification, study root FIND, MOVE and GET,
/// then the storage SOP classes in the SCP role.
///
/// With `uncompressed_only`,
/// only the native uncompressed transfer syntaxes are proposed.
pub fn proposed_contexts(uncompressed_only: bool) -> Vec<ProposedContext> {
    let transfer_syntaxes: Vec<&'static str> = if uncompressed_only {
        TRANSFER_SYNTAXES[..UNCOMPRESSED_COUNT].to_vec()
    } else {
        TRANSFER_SYNTAXES.to_vec()
    };

    let scu_classes = [
        uids::VERIFICATION,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
    ];

    scu_classes
        .iter()
        .map(|uid| (*uid, ServiceRole::Scu))
        .chain(STORAGE_SOP_CLASSES.iter().map(|uid| (*uid, ServiceRole::Scp)))
        .map(|(abstract_syntax, role)| ProposedContext {
            abstract_syntax,
            transfer_syntaxes: transfer_syntaxes.clone(),
            role,
        })
        .collect()
}

/// An accepted presentation context.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NegotiatedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

impl NegotiatedContext {
    pub fn new(
        id: u8,
        abstract_syntax: impl Into<String>,
        transfer_syntax: impl Into<String>,
    ) -> Self {
        NegotiatedContext {
            id,
            abstract_syntax: abstract_syntax.into(),
            transfer_syntax: transfer_syntax.into(),
        }
    }
}

/// Collect the accepted presentation contexts of an association,
/// with UID padding removed.
pub fn accepted_contexts(contexts: &[PresentationContextNegotiated]) -> Vec<NegotiatedContext> {
    contexts
        .iter()
        .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        .map(|pc| NegotiatedContext::new(pc.id, trim_uid(&pc.abstract_syntax), trim_uid(&pc.transfer_syntax)))
        .collect()
}

/// Remove trailing padding (null or space) from a UID.
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
}

/// Find the ID of the accepted context
/// for the given SOP class and transfer syntax,
/// or 0 if there is none.
pub fn find_presentation_context_id(
    contexts: &[NegotiatedContext],
    sop_class: &str,
    transfer_syntax: &str,
) -> u8 {
    let sop_class = trim_uid(sop_class);
    let transfer_syntax = trim_uid(transfer_syntax);
    contexts
        .iter()
        .find(|pc| pc.abstract_syntax == sop_class && pc.transfer_syntax == transfer_syntax)
        .map(|pc| pc.id)
        .unwrap_or(0)
}

/// Find an accepted context with an uncompressed transfer syntax
/// for the given SOP class,
/// preferring explicit VR little endian,
/// then explicit VR big endian,
/// then implicit VR little endian.
///
/// Returns 0 if none was negotiated.
pub fn find_uncompressed_pc(contexts: &[NegotiatedContext], sop_class: &str) -> u8 {
    [
        uids::EXPLICIT_VR_LITTLE_ENDIAN,
        uids::EXPLICIT_VR_BIG_ENDIAN,
        uids::IMPLICIT_VR_LITTLE_ENDIAN,
    ]
    .iter()
    .map(|ts| find_presentation_context_id(contexts, sop_class, ts))
    .find(|id| *id != 0)
    .unwrap_or(0)
}

/// Find the ID of any accepted context for the given SOP class,
/// whatever its transfer syntax.
///
/// Returns 0 if the SOP class was not negotiated at all.
pub fn find_any_presentation_context_id(contexts: &[NegotiatedContext], sop_class: &str) -> u8 {
    let sop_class = trim_uid(sop_class);
    contexts
        .iter()
        .find(|pc| pc.abstract_syntax == sop_class)
        .map(|pc| pc.id)
        .unwrap_or(0)
}

/// Whether data sets in this transfer syntax
/// can be re-encoded in another one without any codec.
///
/// Unknown transfer syntaxes are not.
pub fn is_codec_free(transfer_syntax: &str) -> bool {
    TransferSyntaxRegistry
        .get(trim_uid(transfer_syntax))
        .map(|ts| ts.is_codec_free())
        .unwrap_or(false)
}

/// Choose the context carrying a C-STORE of the given SOP class.
///
/// A context with the object's own transfer syntax wins.
/// Otherwise the object is re-encoded into an uncompressed context,
/// which is only possible when its transfer syntax is codec free
/// (in-memory data sets, without a transfer syntax, always are).
/// `fallback` is tried last, under the same condition.
///
/// Returns `None` when no accepted context can carry the object.
pub fn store_context<'a>(
    contexts: &'a [NegotiatedContext],
    sop_class: &str,
    transfer_syntax: Option<&str>,
    fallback: u8,
) -> Option<&'a NegotiatedContext> {
    let by_id = move |id: u8| contexts.iter().find(|pc| id != 0 && pc.id == id);
    if let Some(ts) = transfer_syntax {
        if let Some(pc) = by_id(find_presentation_context_id(contexts, sop_class, ts)) {
            return Some(pc);
        }
        if !is_codec_free(ts) {
            return None;
        }
    }
    by_id(find_uncompressed_pc(contexts, sop_class)).or_else(|| by_id(fallback))
}
