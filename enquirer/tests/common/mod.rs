//! A scripted PACS for driving the enquirer over real associations.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_enquirer::context::trim_uid;
use dicom_enquirer::dimse::{
    self, command_field, command_u16, decode_dataset, encode_command, encode_dataset,
    receive_incoming, receive_message, send_command, string_of, Incoming, Message, PduChannel,
    C_ECHO_RQ, C_FIND_RQ, C_FIND_RSP, C_GET_RQ, C_GET_RSP, C_MOVE_RQ, C_MOVE_RSP, C_STORE_RQ,
    C_STORE_RSP, STATUS_CANNOT_UNDERSTAND, STATUS_PENDING, STATUS_SUCCESS,
};
use dicom_object::InMemDicomObject;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu, PresentationContextResultReason};
use dicom_ul::{ClientAssociationOptions, ServerAssociation, ServerAssociationOptions};

pub type Result<T, E = Box<dyn std::error::Error>> = std::result::Result<T, E>;

pub static PACS_AE_TITLE: &str = "MOCK-PACS";

const STATUS_MOVE_DESTINATION_UNKNOWN: u16 = 0xA801;

/// A series known to the mock PACS.
#[derive(Debug, Clone)]
pub struct Series {
    pub uid: String,
    pub patient_name: String,
    pub patient_id: String,
    pub modality: String,
    pub study_date: String,
    pub description: String,
    pub instances: Vec<String>,
}

impl Series {
    pub fn new(uid: &str, modality: &str, instance_count: usize) -> Self {
        Series {
            uid: uid.to_string(),
            patient_name: "DOE^JOHN".to_string(),
            patient_id: "PID-1".to_string(),
            modality: modality.to_string(),
            study_date: "20200315".to_string(),
            description: format!("{modality} series"),
            instances: (1..=instance_count)
                .map(|i| format!("{uid}.{i}"))
                .collect(),
        }
    }

    pub fn with_patient_name(mut self, name: &str) -> Self {
        self.patient_name = name.to_string();
        self
    }

    pub fn with_study_date(mut self, date: &str) -> Self {
        self.study_date = date.to_string();
        self
    }

    /// The object stored for the instance at `index`.
    pub fn instance(&self, index: usize) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::SOP_CLASS_UID,
                VR::UI,
                PrimitiveValue::from(uids::CT_IMAGE_STORAGE),
            ),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(self.instances[index].as_str()),
            ),
            DataElement::new(
                tags::PATIENT_NAME,
                VR::PN,
                PrimitiveValue::from(self.patient_name.as_str()),
            ),
            DataElement::new(
                tags::PATIENT_ID,
                VR::LO,
                PrimitiveValue::from(self.patient_id.as_str()),
            ),
            DataElement::new(
                tags::STUDY_DATE,
                VR::DA,
                PrimitiveValue::from(self.study_date.as_str()),
            ),
            DataElement::new(
                tags::MODALITY,
                VR::CS,
                PrimitiveValue::from(self.modality.as_str()),
            ),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(self.uid.as_str()),
            ),
            DataElement::new(
                tags::INSTANCE_NUMBER,
                VR::IS,
                PrimitiveValue::from((index + 1).to_string()),
            ),
        ])
    }

    fn find_response(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::QUERY_RETRIEVE_LEVEL,
                VR::CS,
                PrimitiveValue::from("SERIES"),
            ),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                PrimitiveValue::from(self.uid.as_str()),
            ),
            DataElement::new(
                tags::PATIENT_NAME,
                VR::PN,
                PrimitiveValue::from(self.patient_name.as_str()),
            ),
            DataElement::new(
                tags::PATIENT_ID,
                VR::LO,
                PrimitiveValue::from(self.patient_id.as_str()),
            ),
            DataElement::new(
                tags::MODALITY,
                VR::CS,
                PrimitiveValue::from(self.modality.as_str()),
            ),
            DataElement::new(
                tags::STUDY_DATE,
                VR::DA,
                PrimitiveValue::from(self.study_date.as_str()),
            ),
            DataElement::new(
                tags::SERIES_DESCRIPTION,
                VR::LO,
                PrimitiveValue::from(self.description.as_str()),
            ),
            DataElement::new(
                tags::NUMBER_OF_SERIES_RELATED_INSTANCES,
                VR::IS,
                PrimitiveValue::from(self.instances.len().to_string()),
            ),
        ])
    }

    fn field(&self, tag: Tag) -> Option<&str> {
        match tag {
            tags::SERIES_INSTANCE_UID => Some(&self.uid),
            tags::PATIENT_NAME => Some(&self.patient_name),
            tags::PATIENT_ID => Some(&self.patient_id),
            tags::MODALITY => Some(&self.modality),
            tags::STUDY_DATE => Some(&self.study_date),
            tags::SERIES_DESCRIPTION => Some(&self.description),
            _ => None,
        }
    }
}

/// What the mock PACS holds and how it misbehaves.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub series: Vec<Series>,
    /// series whose retrieval fails
    pub failing: Vec<String>,
    /// C-STORE status by SOP instance UID, success otherwise
    pub store_status: HashMap<String, u16>,
    /// C-MOVE destinations by AE title
    pub destinations: HashMap<String, SocketAddr>,
    /// accepted transfer syntaxes, explicit and implicit VR LE if empty
    pub transfer_syntaxes: Vec<String>,
}

impl Catalog {
    pub fn with_series(mut self, series: Series) -> Self {
        self.series.push(series);
        self
    }

    pub fn with_failing(mut self, series_uid: &str) -> Self {
        self.failing.push(series_uid.to_string());
        self
    }

    pub fn with_store_status(mut self, sop_instance_uid: &str, status: u16) -> Self {
        self.store_status.insert(sop_instance_uid.to_string(), status);
        self
    }

    pub fn with_destination(mut self, ae_title: &str, addr: SocketAddr) -> Self {
        self.destinations.insert(ae_title.to_string(), addr);
        self
    }

    pub fn with_transfer_syntaxes(mut self, transfer_syntaxes: &[&str]) -> Self {
        self.transfer_syntaxes = transfer_syntaxes.iter().map(|ts| ts.to_string()).collect();
        self
    }

    fn series(&self, uid: &str) -> Option<&Series> {
        self.series.iter().find(|s| s.uid == uid)
    }

    fn search(&self, identifier: &InMemDicomObject) -> Vec<InMemDicomObject> {
        if string_of(identifier, tags::QUERY_RETRIEVE_LEVEL) == "IMAGE" {
            let series_uid = string_of(identifier, tags::SERIES_INSTANCE_UID);
            let number: usize = string_of(identifier, tags::INSTANCE_NUMBER)
                .parse()
                .unwrap_or(0);
            return self
                .series(&series_uid)
                .filter(|_| number > 0)
                .and_then(|s| s.instances.get(number - 1))
                .map(|sop| {
                    InMemDicomObject::from_element_iter([
                        DataElement::new(
                            tags::SOP_INSTANCE_UID,
                            VR::UI,
                            PrimitiveValue::from(sop.as_str()),
                        ),
                        DataElement::new(
                            tags::INSTANCE_NUMBER,
                            VR::IS,
                            PrimitiveValue::from(number.to_string()),
                        ),
                    ])
                })
                .into_iter()
                .collect();
        }

        self.series
            .iter()
            .filter(|series| {
                identifier.iter().all(|e| {
                    let tag = e.header().tag;
                    let pattern = e.to_str().map(|v| trim_uid(&v).to_string()).unwrap_or_default();
                    match series.field(tag) {
                        Some(value) => matches(tag, &pattern, value),
                        None => true,
                    }
                })
            })
            .map(Series::find_response)
            .collect()
    }
}

fn matches(tag: Tag, pattern: &str, value: &str) -> bool {
    if tag == tags::STUDY_DATE {
        if let Some((from, to)) = pattern.split_once('-') {
            return from <= value && value <= to;
        }
    }
    let core = pattern.trim_matches('*');
    if core.is_empty() {
        true
    } else if pattern.starts_with('*') || pattern.ends_with('*') {
        value.contains(core)
    } else {
        value == core
    }
}

/// Everything the mock PACS was asked to do.
#[derive(Debug, Default)]
pub struct Journal {
    pub commands: Vec<u16>,
    /// abstract syntax of the context each command came on
    pub contexts: Vec<String>,
    pub identifiers: Vec<InMemDicomObject>,
    pub stored: Vec<String>,
    pub move_destinations: Vec<String>,
}

impl Journal {
    pub fn count(&self, command: u16) -> usize {
        self.commands.iter().filter(|c| **c == command).count()
    }

    /// Abstract syntaxes of the contexts used by a command, in order.
    pub fn contexts_of(&self, command: u16) -> Vec<String> {
        self.commands
            .iter()
            .zip(&self.contexts)
            .filter(|(c, _)| **c == command)
            .map(|(_, abstract_syntax)| abstract_syntax.clone())
            .collect()
    }
}

pub struct MockPacs {
    pub addr: SocketAddr,
    pub journal: Arc<Mutex<Journal>>,
}

impl MockPacs {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn count(&self, command: u16) -> usize {
        self.journal.lock().unwrap().count(command)
    }

    pub fn last_identifier(&self) -> Option<InMemDicomObject> {
        self.journal.lock().unwrap().identifiers.last().cloned()
    }

    pub fn stored(&self) -> Vec<String> {
        self.journal.lock().unwrap().stored.clone()
    }

    pub fn contexts_of(&self, command: u16) -> Vec<String> {
        self.journal.lock().unwrap().contexts_of(command)
    }
}

/// Run the mock PACS on a background thread,
/// serving one association at a time.
pub fn spawn_pacs(catalog: Catalog) -> Result<MockPacs> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let journal = Arc::new(Mutex::new(Journal::default()));

    let shared = Arc::clone(&journal);
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            if let Err(e) = serve(stream, &catalog, &shared) {
                eprintln!("[mock PACS] {e}");
            }
        }
    });

    Ok(MockPacs { addr, journal })
}

struct Context {
    id: u8,
    abstract_syntax: String,
    transfer_syntax: String,
}

fn serve(stream: TcpStream, catalog: &Catalog, journal: &Mutex<Journal>) -> Result<()> {
    let mut options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(PACS_AE_TITLE)
        .strict(false)
        .max_pdu_length(131_072)
        .with_abstract_syntax(uids::VERIFICATION)
        .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
        .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
        .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET)
        .with_abstract_syntax(uids::CT_IMAGE_STORAGE);
    if catalog.transfer_syntaxes.is_empty() {
        options = options
            .with_transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .with_transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN);
    }
    for ts in &catalog.transfer_syntaxes {
        options = options.with_transfer_syntax(ts.as_str());
    }
    let mut association = options.establish(stream)?;

    let contexts: Vec<Context> = association
        .presentation_contexts()
        .iter()
        .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        .map(|pc| Context {
            id: pc.id,
            abstract_syntax: trim_uid(&pc.abstract_syntax).to_string(),
            transfer_syntax: trim_uid(&pc.transfer_syntax).to_string(),
        })
        .collect();

    loop {
        let message = match receive_incoming(&mut association)? {
            Incoming::Message(message) => message,
            Incoming::ReleaseRequest => {
                association.send_pdu(&Pdu::ReleaseRP)?;
                return Ok(());
            }
            Incoming::Abort => return Ok(()),
        };
        let field = command_field(&message.command).unwrap_or_default();
        let context = contexts
            .iter()
            .find(|pc| pc.id == message.presentation_context_id);
        {
            let mut journal = journal.lock().unwrap();
            journal.commands.push(field);
            journal.contexts.push(
                context
                    .map(|pc| pc.abstract_syntax.clone())
                    .unwrap_or_default(),
            );
        }

        let ts = context
            .map(|pc| pc.transfer_syntax.clone())
            .unwrap_or_else(|| uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string());
        let pc_id = message.presentation_context_id;
        let message_id = command_u16(&message.command, tags::MESSAGE_ID).unwrap_or(0);

        match field {
            C_ECHO_RQ => send_command(&mut association, pc_id, &dimse::echo_rsp(message_id))?,
            C_STORE_RQ => {
                let sop_class = string_of(&message.command, tags::AFFECTED_SOP_CLASS_UID);
                let sop_instance = string_of(&message.command, tags::AFFECTED_SOP_INSTANCE_UID);
                journal.lock().unwrap().stored.push(sop_instance.clone());
                let status = catalog
                    .store_status
                    .get(&sop_instance)
                    .copied()
                    .unwrap_or(STATUS_SUCCESS);
                let rsp = dimse::store_rsp(message_id, &sop_class, &sop_instance, status);
                send_command(&mut association, pc_id, &rsp)?;
            }
            C_FIND_RQ | C_GET_RQ | C_MOVE_RQ => {
                let identifier = decode_dataset(message.data.as_deref().unwrap_or_default(), &ts)?;
                journal.lock().unwrap().identifiers.push(identifier.clone());
                match field {
                    C_FIND_RQ => {
                        for found in catalog.search(&identifier) {
                            let rsp = response(C_FIND_RSP, message_id, STATUS_PENDING, true, 0);
                            send_with_data(&mut association, pc_id, &rsp, encode_dataset(&found, &ts)?)?;
                        }
                        let rsp = response(C_FIND_RSP, message_id, STATUS_SUCCESS, false, 0);
                        send_command(&mut association, pc_id, &rsp)?;
                    }
                    C_GET_RQ => {
                        let status = match retrieval(catalog, &identifier) {
                            Some((series, indices)) => {
                                let storage = contexts
                                    .iter()
                                    .find(|pc| pc.abstract_syntax == uids::CT_IMAGE_STORAGE)
                                    .ok_or("CT storage was not negotiated")?;
                                let mut message_id = 1000;
                                for index in indices {
                                    message_id += 1;
                                    store_on(&mut association, storage, series, index, message_id)?;
                                }
                                STATUS_SUCCESS
                            }
                            None => STATUS_CANNOT_UNDERSTAND,
                        };
                        let rsp = response(C_GET_RSP, message_id, status, false, 0);
                        send_command(&mut association, pc_id, &rsp)?;
                    }
                    _ => {
                        let destination = string_of(&message.command, tags::MOVE_DESTINATION);
                        journal
                            .lock()
                            .unwrap()
                            .move_destinations
                            .push(destination.clone());
                        let status = match (
                            catalog.destinations.get(&destination),
                            retrieval(catalog, &identifier),
                        ) {
                            (None, _) => STATUS_MOVE_DESTINATION_UNKNOWN,
                            (Some(_), None) => STATUS_CANNOT_UNDERSTAND,
                            (Some(addr), Some((series, indices))) => {
                                let completed = forward(*addr, &destination, series, &indices)?;
                                let rsp =
                                    response(C_MOVE_RSP, message_id, STATUS_PENDING, false, completed);
                                send_command(&mut association, pc_id, &rsp)?;
                                STATUS_SUCCESS
                            }
                        };
                        let rsp = response(C_MOVE_RSP, message_id, status, false, 0);
                        send_command(&mut association, pc_id, &rsp)?;
                    }
                }
            }
            other => return Err(format!("unexpected command {other:04X}H").into()),
        }
    }
}

/// The series and instance indices a C-GET or C-MOVE identifier selects,
/// or `None` if the retrieval must fail.
fn retrieval<'a>(catalog: &'a Catalog, identifier: &InMemDicomObject) -> Option<(&'a Series, Vec<usize>)> {
    let series_uid = string_of(identifier, tags::SERIES_INSTANCE_UID);
    if catalog.failing.contains(&series_uid) {
        return None;
    }
    let series = catalog.series(&series_uid)?;
    let sop = string_of(identifier, tags::SOP_INSTANCE_UID);
    let indices = (0..series.instances.len())
        .filter(|i| sop.is_empty() || series.instances[*i] == sop)
        .collect();
    Some((series, indices))
}

fn response(field: u16, message_id: u16, status: u16, with_data: bool, completed: u16) -> InMemDicomObject {
    let mut rsp = InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [field])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [if with_data { 0x0001 } else { 0x0101 }]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ]);
    if completed > 0 {
        rsp.put(DataElement::new(
            tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [completed]),
        ));
    }
    rsp
}

fn send_with_data<C: PduChannel>(
    channel: &mut C,
    pc_id: u8,
    command: &InMemDicomObject,
    data: Vec<u8>,
) -> Result<()> {
    channel.send_pdu(&Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: encode_command(command)?,
            },
            PDataValue {
                presentation_context_id: pc_id,
                value_type: PDataValueType::Data,
                is_last: true,
                data,
            },
        ],
    })?;
    Ok(())
}

/// C-GET sub-operation: push one instance back on the same association.
fn store_on(
    association: &mut ServerAssociation<TcpStream>,
    storage: &Context,
    series: &Series,
    index: usize,
    message_id: u16,
) -> Result<()> {
    let obj = series.instance(index);
    let cmd = dimse::store_req(uids::CT_IMAGE_STORAGE, &series.instances[index], message_id);
    send_with_data(
        association,
        storage.id,
        &cmd,
        encode_dataset(&obj, &storage.transfer_syntax)?,
    )?;
    let Message { command, .. } = receive_message(association)?;
    if command_field(&command) != Some(C_STORE_RSP) {
        return Err("expected a C-STORE response".into());
    }
    Ok(())
}

/// C-MOVE sub-operations: open an association to the destination
/// and store the instances there.
fn forward(addr: SocketAddr, ae_title: &str, series: &Series, indices: &[usize]) -> Result<u16> {
    let mut scu = ClientAssociationOptions::new()
        .calling_ae_title(PACS_AE_TITLE)
        .called_ae_title(ae_title)
        .with_presentation_context(
            uids::CT_IMAGE_STORAGE,
            vec![uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN],
        )
        .establish(addr)?;
    let (pc_id, ts) = scu
        .presentation_contexts()
        .first()
        .map(|pc| (pc.id, trim_uid(&pc.transfer_syntax).to_string()))
        .ok_or("CT storage was not accepted by the move destination")?;

    let mut completed = 0;
    for (n, index) in indices.iter().enumerate() {
        let obj = series.instance(*index);
        let cmd = dimse::store_req(uids::CT_IMAGE_STORAGE, &series.instances[*index], n as u16 + 1);
        dimse::send_message(&mut scu, pc_id, &cmd, encode_dataset(&obj, &ts)?)?;
        let rsp = receive_message(&mut scu)?;
        if dimse::status_of(&rsp.command) == Some(STATUS_SUCCESS) {
            completed += 1;
        }
    }
    scu.release()?;
    Ok(completed)
}
