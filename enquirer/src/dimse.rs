//! DIMSE message plumbing:
//! command set builders, status interpretation
//! and the exchange of whole messages over an association.

use std::io::Write;
use std::net::TcpStream;

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use dicom_ul::{ClientAssociation, ServerAssociation};
use snafu::{OptionExt, ResultExt};

use crate::context::trim_uid;
use crate::error::{
    AssociationSnafu, ReadCommandSnafu, ReadDatasetSnafu, Result, SendDataSnafu,
    UnexpectedPduSnafu, UnsupportedTransferSyntaxSnafu, WriteCommandSnafu, WriteDatasetSnafu,
};

/// C-STORE-RQ
pub const C_STORE_RQ: u16 = 0x0001;
/// C-GET-RQ
pub const C_GET_RQ: u16 = 0x0010;
/// C-FIND-RQ
pub const C_FIND_RQ: u16 = 0x0020;
/// C-MOVE-RQ
pub const C_MOVE_RQ: u16 = 0x0021;
/// C-ECHO-RQ
pub const C_ECHO_RQ: u16 = 0x0030;
/// C-STORE-RSP
pub const C_STORE_RSP: u16 = 0x8001;
/// C-GET-RSP
pub const C_GET_RSP: u16 = 0x8010;
/// C-FIND-RSP
pub const C_FIND_RSP: u16 = 0x8020;
/// C-MOVE-RSP
pub const C_MOVE_RSP: u16 = 0x8021;
/// C-ECHO-RSP
pub const C_ECHO_RSP: u16 = 0x8030;

/// Command data set type value meaning that no data set follows
pub const NO_DATA_SET: u16 = 0x0101;

/// Status: success
pub const STATUS_SUCCESS: u16 = 0x0000;
/// Status: pending
pub const STATUS_PENDING: u16 = 0xFF00;
/// Status: pending, with optional keys unsupported
pub const STATUS_PENDING_WARNING: u16 = 0xFF01;
/// Status: refused, out of resources
pub const STATUS_OUT_OF_RESOURCES: u16 = 0xA700;
/// Status: error, cannot understand
pub const STATUS_CANNOT_UNDERSTAND: u16 = 0xC000;
/// Status: unrecognized operation
pub const STATUS_UNRECOGNIZED_OPERATION: u16 = 0x0211;

/// Broad class of a DIMSE status code.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StatusClass {
    Success,
    Pending,
    Warning,
    Cancel,
    Failure,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            STATUS_SUCCESS => StatusClass::Success,
            STATUS_PENDING | STATUS_PENDING_WARNING => StatusClass::Pending,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusClass::Warning,
            0xFE00 => StatusClass::Cancel,
            _ => StatusClass::Failure,
        }
    }

    /// Whether the operation went through, possibly with warnings.
    pub fn is_good(self) -> bool {
        matches!(
            self,
            StatusClass::Success | StatusClass::Pending | StatusClass::Warning
        )
    }
}

/// Human readable meaning of a status code
/// returned by a query/retrieve or storage SCP.
pub fn describe_status(status: u16) -> &'static str {
    match status {
        STATUS_SUCCESS => "Success",
        STATUS_PENDING | STATUS_PENDING_WARNING => "Pending",
        0xA701 => "Out of resources (number of matches)",
        0xA702 => "Out of resources (sub-operations)",
        0xA700..=0xA7FF => "Out of resources",
        0x0122 => "SOP class not supported",
        STATUS_UNRECOGNIZED_OPERATION => "Unrecognized operation",
        0xA801 => "Move destination unknown",
        0xA900 => "Identifier does not match SOP class",
        0xC000..=0xCFFF => "Unable to process",
        0xFE00 => "Sub-operations terminated due to cancel indication",
        0xB000 => "Sub-operations complete with one or more failures",
        0x0001 | 0x0107 | 0x0116 | 0xB001..=0xBFFF => "Warning",
        _ => "Unknown status code",
    }
}

fn command_header(
    sop_class_uid: &str,
    command_field: u16,
    message_id: u16,
) -> [DataElement<InMemDicomObject<StandardDataDictionary>>; 3] {
    [
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [command_field]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
    ]
}

fn medium_priority() -> DataElement<InMemDicomObject<StandardDataDictionary>> {
    DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000]))
}

fn data_set_type(value: u16) -> DataElement<InMemDicomObject<StandardDataDictionary>> {
    DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [value]))
}

/// C-ECHO-RQ command set
pub fn echo_req(message_id: u16) -> InMemDicomObject {
    let [class, field, id] = command_header(uids::VERIFICATION, C_ECHO_RQ, message_id);
    InMemDicomObject::command_from_element_iter([class, field, id, data_set_type(NO_DATA_SET)])
}

/// C-FIND-RQ command set
pub fn find_req(sop_class_uid: &str, message_id: u16) -> InMemDicomObject {
    let [class, field, id] = command_header(sop_class_uid, C_FIND_RQ, message_id);
    InMemDicomObject::command_from_element_iter([
        class,
        field,
        id,
        medium_priority(),
        data_set_type(0x0001),
    ])
}

/// C-MOVE-RQ command set
pub fn move_req(sop_class_uid: &str, move_destination: &str, message_id: u16) -> InMemDicomObject {
    let [class, field, id] = command_header(sop_class_uid, C_MOVE_RQ, message_id);
    InMemDicomObject::command_from_element_iter([
        class,
        field,
        id,
        medium_priority(),
        data_set_type(0x0001),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            PrimitiveValue::from(move_destination),
        ),
    ])
}

/// C-GET-RQ command set
pub fn get_req(sop_class_uid: &str, message_id: u16) -> InMemDicomObject {
    let [class, field, id] = command_header(sop_class_uid, C_GET_RQ, message_id);
    InMemDicomObject::command_from_element_iter([
        class,
        field,
        id,
        medium_priority(),
        data_set_type(0x0001),
    ])
}

/// C-STORE-RQ command set
pub fn store_req(sop_class_uid: &str, sop_instance_uid: &str, message_id: u16) -> InMemDicomObject {
    let [class, field, id] = command_header(sop_class_uid, C_STORE_RQ, message_id);
    InMemDicomObject::command_from_element_iter([
        class,
        field,
        id,
        medium_priority(),
        data_set_type(0x0000),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid),
        ),
    ])
}

/// C-STORE-RSP command set
pub fn store_rsp(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        data_set_type(NO_DATA_SET),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from(sop_instance_uid),
        ),
    ])
}

/// C-ECHO-RSP command set
pub fn echo_rsp(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(uids::VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        data_set_type(NO_DATA_SET),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [STATUS_SUCCESS])),
    ])
}

/// Response refusing a request command which this node does not serve.
///
/// The response command field is the request's with the high bit set.
pub fn unrecognized_rsp(request: &InMemDicomObject) -> InMemDicomObject {
    let field = command_field(request).unwrap_or_default() | 0x8000;
    let message_id = command_u16(request, tags::MESSAGE_ID).unwrap_or(0);
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(string_of(request, tags::AFFECTED_SOP_CLASS_UID)),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [field])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        data_set_type(NO_DATA_SET),
        DataElement::new(
            tags::STATUS,
            VR::US,
            dicom_value!(U16, [STATUS_UNRECOGNIZED_OPERATION]),
        ),
    ])
}

/// Read an unsigned short attribute of a command set.
pub fn command_u16(command: &InMemDicomObject, tag: dicom_core::Tag) -> Option<u16> {
    command.get(tag).and_then(|e| e.to_int::<u16>().ok())
}

/// Read a string attribute of a data set or command set,
/// without padding.
/// Missing or unreadable attributes yield an empty string.
pub fn string_of(obj: &InMemDicomObject, tag: dicom_core::Tag) -> String {
    obj.get(tag)
        .and_then(|e| e.to_str().ok())
        .map(|s| trim_uid(&s).to_string())
        .unwrap_or_default()
}

pub fn command_field(command: &InMemDicomObject) -> Option<u16> {
    command_u16(command, tags::COMMAND_FIELD)
}

pub fn status_of(command: &InMemDicomObject) -> Option<u16> {
    command_u16(command, tags::STATUS)
}

/// Whether the command announces a data set.
pub fn has_dataset(command: &InMemDicomObject) -> bool {
    command_u16(command, tags::COMMAND_DATA_SET_TYPE)
        .map(|v| v != NO_DATA_SET)
        .unwrap_or(false)
}

/// Encode a command set, always in implicit VR little endian.
pub fn encode_command(command: &InMemDicomObject) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .context(WriteCommandSnafu)?;
    Ok(data)
}

/// Decode a command set.
pub fn decode_command(data: &[u8]) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .context(ReadCommandSnafu)
}

/// Encode a data set with the transfer syntax of the given UID.
pub fn encode_dataset(obj: &InMemDicomObject, ts_uid: &str) -> Result<Vec<u8>> {
    let ts_uid = trim_uid(ts_uid);
    let ts = TransferSyntaxRegistry
        .get(ts_uid)
        .context(UnsupportedTransferSyntaxSnafu { uid: ts_uid })?;
    let mut data = Vec::with_capacity(1024);
    obj.write_dataset_with_ts(&mut data, ts)
        .context(WriteDatasetSnafu)?;
    Ok(data)
}

/// Decode a data set encoded with the transfer syntax of the given UID.
pub fn decode_dataset(data: &[u8], ts_uid: &str) -> Result<InMemDicomObject> {
    let ts_uid = trim_uid(ts_uid);
    let ts = TransferSyntaxRegistry
        .get(ts_uid)
        .context(UnsupportedTransferSyntaxSnafu { uid: ts_uid })?;
    InMemDicomObject::read_dataset_with_ts(data, ts).context(ReadDatasetSnafu)
}

/// One side of an association able to exchange PDUs.
pub trait PduChannel {
    fn send_pdu(&mut self, pdu: &Pdu) -> Result<()>;
    fn receive_pdu(&mut self) -> Result<Pdu>;
}

impl PduChannel for ClientAssociation<TcpStream> {
    fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        self.send(pdu).map_err(Box::from).context(AssociationSnafu)
    }

    fn receive_pdu(&mut self) -> Result<Pdu> {
        self.receive().map_err(Box::from).context(AssociationSnafu)
    }
}

impl PduChannel for ServerAssociation<TcpStream> {
    fn send_pdu(&mut self, pdu: &Pdu) -> Result<()> {
        self.send(pdu).map_err(Box::from).context(AssociationSnafu)
    }

    fn receive_pdu(&mut self) -> Result<Pdu> {
        self.receive().map_err(Box::from).context(AssociationSnafu)
    }
}

/// A complete DIMSE message.
#[derive(Debug)]
pub struct Message {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    /// encoded data set, if the command announced one
    pub data: Option<Vec<u8>>,
}

/// What the peer sent next.
#[derive(Debug)]
pub enum Incoming {
    Message(Message),
    ReleaseRequest,
    Abort,
}

/// Receive the next DIMSE message,
/// reassembling command and data set fragments
/// spread over any number of P-DATA PDUs.
pub fn receive_incoming<C>(channel: &mut C) -> Result<Incoming>
where
    C: PduChannel + ?Sized,
{
    let mut command_data = Vec::new();
    let mut command: Option<InMemDicomObject> = None;
    let mut dataset = Vec::new();

    loop {
        match channel.receive_pdu()? {
            Pdu::PData { data } => {
                for mut value in data {
                    match value.value_type {
                        PDataValueType::Command => {
                            command_data.append(&mut value.data);
                            if value.is_last {
                                let cmd = decode_command(&command_data)?;
                                if !has_dataset(&cmd) {
                                    return Ok(Incoming::Message(Message {
                                        presentation_context_id: value.presentation_context_id,
                                        command: cmd,
                                        data: None,
                                    }));
                                }
                                command = Some(cmd);
                            }
                        }
                        PDataValueType::Data => {
                            dataset.append(&mut value.data);
                            if value.is_last {
                                let command = command.take().context(UnexpectedPduSnafu {
                                    description: "data set without a preceding command",
                                })?;
                                return Ok(Incoming::Message(Message {
                                    presentation_context_id: value.presentation_context_id,
                                    command,
                                    data: Some(dataset),
                                }));
                            }
                        }
                    }
                }
            }
            Pdu::ReleaseRQ => return Ok(Incoming::ReleaseRequest),
            Pdu::AbortRQ { .. } => return Ok(Incoming::Abort),
            pdu => {
                return UnexpectedPduSnafu {
                    description: pdu.short_description().to_string(),
                }
                .fail()
            }
        }
    }
}

/// Receive the next DIMSE message,
/// treating release and abort requests as errors.
pub fn receive_message<C>(channel: &mut C) -> Result<Message>
where
    C: PduChannel + ?Sized,
{
    match receive_incoming(channel)? {
        Incoming::Message(message) => Ok(message),
        Incoming::ReleaseRequest => UnexpectedPduSnafu {
            description: "A-RELEASE-RQ",
        }
        .fail(),
        Incoming::Abort => UnexpectedPduSnafu {
            description: "A-ABORT",
        }
        .fail(),
    }
}

/// Send a command set with no data set.
pub fn send_command<C>(channel: &mut C, presentation_context_id: u8, command: &InMemDicomObject) -> Result<()>
where
    C: PduChannel + ?Sized,
{
    let data = encode_command(command)?;
    channel.send_pdu(&Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data,
        }],
    })
}

/// Send a command followed by its encoded data set.
///
/// Both go in a single P-DATA PDU when they fit the peer's maximum PDU
/// length, otherwise the data set is streamed in fragments.
pub fn send_message(
    scu: &mut ClientAssociation<TcpStream>,
    presentation_context_id: u8,
    command: &InMemDicomObject,
    dataset: Vec<u8>,
) -> Result<()> {
    let cmd_data = encode_command(command)?;
    let nbytes = cmd_data.len() + dataset.len();

    if nbytes < scu.acceptor_max_pdu_length().saturating_sub(100) as usize {
        let pdu = Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: cmd_data,
                },
                PDataValue {
                    presentation_context_id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: dataset,
                },
            ],
        };
        return scu.send_pdu(&pdu);
    }

    scu.send_pdu(&Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: cmd_data,
        }],
    })?;

    {
        let mut pdata = scu.send_pdata(presentation_context_id);
        pdata.write_all(&dataset).context(SendDataSnafu)?;
    }
    Ok(())
}
