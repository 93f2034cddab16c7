//! Association driver:
//! runs DIMSE exchanges to completion over one client association,
//! handing C-MOVE responses and C-GET sub-operations
//! to an [`AssociationHandler`].

use std::net::{SocketAddr, TcpStream};

use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;
use dicom_ul::{ClientAssociation, ClientAssociationOptions};
use snafu::{OptionExt, ResultExt};
use tracing::{debug, info, warn};

use crate::config::PacsConfiguration;
use crate::context::{
    accepted_contexts, find_any_presentation_context_id, NegotiatedContext, ProposedContext,
};
use crate::dimse::{
    self, command_field, command_u16, decode_dataset, describe_status, encode_dataset,
    receive_message, send_command, send_message, status_of, string_of, Message, PduChannel,
    StatusClass, C_GET_RSP, C_MOVE_RSP, C_STORE_RQ, STATUS_CANNOT_UNDERSTAND,
};
use crate::error::{
    AssociationSnafu, MissingAttributeSnafu, NegotiateAssociationFailureSnafu,
    PresentationContextMissingSnafu, RequestFailureSnafu, Result, UnexpectedPduSnafu,
};

/// One response to a C-MOVE or C-GET request.
#[derive(Debug, Clone)]
pub struct RetrieveResponse {
    pub status: u16,
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
    /// identifier data set, if the response carried one
    pub identifier: Option<InMemDicomObject>,
}

impl RetrieveResponse {
    fn from_command(command: &InMemDicomObject, identifier: Option<InMemDicomObject>) -> Result<Self> {
        let status = status_of(command).context(MissingAttributeSnafu { tag: tags::STATUS })?;
        Ok(RetrieveResponse {
            status,
            remaining: command_u16(command, tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed: command_u16(command, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed: command_u16(command, tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning: command_u16(command, tags::NUMBER_OF_WARNING_SUBOPERATIONS),
            identifier,
        })
    }

    pub fn class(&self) -> StatusClass {
        StatusClass::of(self.status)
    }
}

/// An object pushed by the peer as a C-GET sub-operation.
#[derive(Debug)]
pub struct IncomingStore {
    pub presentation_context_id: u8,
    pub transfer_syntax: String,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub dataset: InMemDicomObject,
}

/// Reactions to the asynchronous parts of a retrieval.
pub trait AssociationHandler {
    /// Called for every C-MOVE-RSP.
    ///
    /// Returning an error stops the retrieval.
    /// By default, anything other than success or pending is an error.
    fn handle_move_response(&mut self, response: &RetrieveResponse) -> Result<()> {
        match response.class() {
            StatusClass::Success | StatusClass::Pending => Ok(()),
            _ => {
                warn!(
                    "C-MOVE response status {:04X}H: {}",
                    response.status,
                    describe_status(response.status)
                );
                RequestFailureSnafu {
                    message: "Unable to perform a C-MOVE operation.",
                    series_uid: None::<String>,
                    status: Some(response.status),
                }
                .fail()
            }
        }
    }

    /// Called for every C-STORE-RQ received during a C-GET.
    ///
    /// Returns the status of the C-STORE-RSP to send back.
    fn handle_incoming_store(&mut self, request: IncomingStore) -> u16;
}

/// Owner of an established client association.
pub struct AssociationDriver {
    association: ClientAssociation<TcpStream>,
    contexts: Vec<NegotiatedContext>,
    message_id: u16,
}

impl std::fmt::Debug for AssociationDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationDriver")
            .field("contexts", &self.contexts)
            .field("message_id", &self.message_id)
            .finish_non_exhaustive()
    }
}

impl AssociationDriver {
    /// Negotiate an association with the PACS at `addr`.
    pub fn establish(
        config: &PacsConfiguration,
        proposals: &[ProposedContext],
        addr: SocketAddr,
    ) -> Result<Self> {
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(config.local_ae_title.as_str())
            .called_ae_title(config.peer_ae_title.as_str())
            .max_pdu_length(config.max_pdu_length);

        for proposal in proposals {
            options = options.with_presentation_context(
                proposal.abstract_syntax,
                proposal.transfer_syntaxes.clone(),
            );
        }

        let association = options
            .establish(addr)
            .map_err(Box::from)
            .context(NegotiateAssociationFailureSnafu)?;

        let contexts = accepted_contexts(association.presentation_contexts());
        debug!(
            "{} of {} presentation contexts accepted",
            contexts.len(),
            proposals.len()
        );

        Ok(AssociationDriver {
            association,
            contexts,
            message_id: 0,
        })
    }

    /// The accepted presentation contexts.
    pub fn contexts(&self) -> &[NegotiatedContext] {
        &self.contexts
    }

    pub fn find_uncompressed_pc(&self, sop_class: &str) -> u8 {
        crate::context::find_uncompressed_pc(&self.contexts, sop_class)
    }

    fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1).max(1);
        self.message_id
    }

    /// Pick the context to send on.
    ///
    /// When `pc_id` is 0, any accepted context of `abstract_syntax`
    /// is used, whatever its transfer syntax.
    fn resolve(
        &self,
        pc_id: u8,
        abstract_syntax: &str,
        operation: &'static str,
    ) -> Result<NegotiatedContext> {
        let pc_id = match pc_id {
            0 => find_any_presentation_context_id(&self.contexts, abstract_syntax),
            id => id,
        };
        self.contexts
            .iter()
            .find(|pc| pc_id != 0 && pc.id == pc_id)
            .cloned()
            .context(PresentationContextMissingSnafu { operation })
    }

    fn transfer_syntax_of(&self, pc_id: u8) -> Option<&str> {
        self.contexts
            .iter()
            .find(|pc| pc.id == pc_id)
            .map(|pc| pc.transfer_syntax.as_str())
    }

    /// Send a C-ECHO request and return the response status.
    pub fn echo(&mut self) -> Result<u16> {
        let pc = self.resolve(0, uids::VERIFICATION, "Verification")?;
        let message_id = self.next_message_id();
        send_command(&mut self.association, pc.id, &dimse::echo_req(message_id))?;
        let rsp = receive_message(&mut self.association)?;
        status_of(&rsp.command).context(MissingAttributeSnafu { tag: tags::STATUS })
    }

    /// Send a C-FIND request and collect every matching identifier.
    ///
    /// A failed or cancelled query yields the matches received so far.
    pub fn find(&mut self, pc_id: u8, identifier: &InMemDicomObject) -> Result<Vec<InMemDicomObject>> {
        let pc = self.resolve(
            pc_id,
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            "Study Root FIND",
        )?;
        let message_id = self.next_message_id();
        let cmd = dimse::find_req(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND, message_id);
        let data = encode_dataset(identifier, &pc.transfer_syntax)?;
        send_message(&mut self.association, pc.id, &cmd, data)?;

        let mut matches = Vec::new();
        loop {
            let Message { command, data, .. } = receive_message(&mut self.association)?;
            let status = status_of(&command).context(MissingAttributeSnafu { tag: tags::STATUS })?;
            match StatusClass::of(status) {
                StatusClass::Pending => {
                    if let Some(data) = data {
                        matches.push(decode_dataset(&data, &pc.transfer_syntax)?);
                    }
                }
                StatusClass::Success => break,
                _ => {
                    warn!(
                        "C-FIND finished with status {:04X}H: {}",
                        status,
                        describe_status(status)
                    );
                    break;
                }
            }
        }
        debug!("C-FIND returned {} match(es)", matches.len());
        Ok(matches)
    }

    /// Send a C-MOVE request,
    /// passing every response to the handler until the final one.
    ///
    /// Returns the final status.
    pub fn move_request<H>(
        &mut self,
        pc_id: u8,
        destination: &str,
        identifier: &InMemDicomObject,
        handler: &mut H,
    ) -> Result<u16>
    where
        H: AssociationHandler + ?Sized,
    {
        let pc = self.resolve(
            pc_id,
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
            "Study Root MOVE",
        )?;
        let message_id = self.next_message_id();
        let cmd = dimse::move_req(
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
            destination,
            message_id,
        );
        let data = encode_dataset(identifier, &pc.transfer_syntax)?;
        send_message(&mut self.association, pc.id, &cmd, data)?;

        loop {
            let Message { command, data, .. } = receive_message(&mut self.association)?;
            if command_field(&command) != Some(C_MOVE_RSP) {
                return unexpected_command(&command);
            }
            let identifier = match data {
                Some(data) => Some(decode_dataset(&data, &pc.transfer_syntax)?),
                None => None,
            };
            let response = RetrieveResponse::from_command(&command, identifier)?;
            debug!(
                "C-MOVE response {:04X}H: {:?} remaining, {:?} completed, {:?} failed",
                response.status, response.remaining, response.completed, response.failed
            );
            handler.handle_move_response(&response)?;
            if response.class() != StatusClass::Pending {
                return Ok(response.status);
            }
        }
    }

    /// Send a C-GET request,
    /// serving the C-STORE sub-operations through the handler
    /// until the final C-GET response.
    ///
    /// Returns the final status.
    pub fn get_request<H>(
        &mut self,
        pc_id: u8,
        identifier: &InMemDicomObject,
        handler: &mut H,
    ) -> Result<u16>
    where
        H: AssociationHandler + ?Sized,
    {
        let pc = self.resolve(
            pc_id,
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
            "Study Root GET",
        )?;
        let message_id = self.next_message_id();
        let cmd = dimse::get_req(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET, message_id);
        let data = encode_dataset(identifier, &pc.transfer_syntax)?;
        send_message(&mut self.association, pc.id, &cmd, data)?;

        loop {
            let message = receive_message(&mut self.association)?;
            match command_field(&message.command) {
                Some(C_STORE_RQ) => self.serve_store(message, handler)?,
                Some(C_GET_RSP) => {
                    let response = RetrieveResponse::from_command(&message.command, None)?;
                    if response.class() == StatusClass::Pending {
                        debug!(
                            "C-GET pending: {:?} remaining, {:?} completed",
                            response.remaining, response.completed
                        );
                        continue;
                    }
                    return Ok(response.status);
                }
                _ => return unexpected_command(&message.command),
            }
        }
    }

    fn serve_store<H>(&mut self, message: Message, handler: &mut H) -> Result<()>
    where
        H: AssociationHandler + ?Sized,
    {
        let transfer_syntax = self
            .transfer_syntax_of(message.presentation_context_id)
            .unwrap_or(uids::IMPLICIT_VR_LITTLE_ENDIAN)
            .to_string();
        answer_store(&mut self.association, &transfer_syntax, message, handler)
    }

    /// Send a C-STORE request with an already encoded data set
    /// and return the response status.
    pub fn store_request(
        &mut self,
        pc_id: u8,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        dataset: Vec<u8>,
    ) -> Result<u16> {
        let pc = self.resolve(pc_id, sop_class_uid, "Storage")?;
        let message_id = self.next_message_id();
        let cmd = dimse::store_req(sop_class_uid, sop_instance_uid, message_id);
        info!("Send C-STORE request for {}", sop_instance_uid);
        send_message(&mut self.association, pc.id, &cmd, dataset)?;
        let rsp = receive_message(&mut self.association)?;
        status_of(&rsp.command).context(MissingAttributeSnafu { tag: tags::STATUS })
    }

    /// Gracefully release the association.
    pub fn release(self) -> Result<()> {
        self.association
            .release()
            .map_err(Box::from)
            .context(AssociationSnafu)
    }

    /// Abort the association.
    pub fn abort(self) -> Result<()> {
        self.association
            .abort()
            .map_err(Box::from)
            .context(AssociationSnafu)
    }
}

/// Hand an incoming C-STORE request to the handler
/// and send back the resulting C-STORE response.
pub(crate) fn answer_store<C, H>(
    channel: &mut C,
    transfer_syntax: &str,
    message: Message,
    handler: &mut H,
) -> Result<()>
where
    C: PduChannel + ?Sized,
    H: AssociationHandler + ?Sized,
{
    let Message {
        presentation_context_id,
        command,
        data,
    } = message;
    let message_id = command_u16(&command, tags::MESSAGE_ID).unwrap_or(0);
    let sop_class_uid = string_of(&command, tags::AFFECTED_SOP_CLASS_UID);
    let sop_instance_uid = string_of(&command, tags::AFFECTED_SOP_INSTANCE_UID);

    let status = match data.map(|data| decode_dataset(&data, transfer_syntax)) {
        Some(Ok(dataset)) => handler.handle_incoming_store(IncomingStore {
            presentation_context_id,
            transfer_syntax: transfer_syntax.to_string(),
            sop_class_uid: sop_class_uid.clone(),
            sop_instance_uid: sop_instance_uid.clone(),
            dataset,
        }),
        Some(Err(e)) => {
            warn!("Could not decode incoming object {}: {}", sop_instance_uid, e);
            STATUS_CANNOT_UNDERSTAND
        }
        None => {
            warn!("C-STORE request for {} without a data set", sop_instance_uid);
            STATUS_CANNOT_UNDERSTAND
        }
    };

    let rsp = dimse::store_rsp(message_id, &sop_class_uid, &sop_instance_uid, status);
    send_command(channel, presentation_context_id, &rsp)
}

fn unexpected_command<T>(command: &InMemDicomObject) -> Result<T> {
    UnexpectedPduSnafu {
        description: format!(
            "DIMSE command {:04X}H",
            command_field(command).unwrap_or_default()
        ),
    }
    .fail()
}
