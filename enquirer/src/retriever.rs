//! Storage SCP receiving the objects of a C-MOVE.
//!
//! A C-MOVE makes the PACS open its own association
//! towards the move destination AE.
//! [`SeriesRetriever`] plays that role,
//! writing objects in the same layout as C-GET retrievals.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;

use dicom_dictionary_std::{tags, uids};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::pdu::Pdu;
use dicom_ul::{ServerAssociation, ServerAssociationOptions};
use snafu::{Report, ResultExt};
use tracing::{debug, error, info, warn};

use crate::config::MAX_PDU_LENGTH;
use crate::context::{trim_uid, STORAGE_SOP_CLASSES};
use crate::dimse::{
    self, command_field, command_u16, receive_incoming, send_command, Incoming, PduChannel,
    C_ECHO_RQ, C_STORE_RQ,
};
use crate::driver::answer_store;
use crate::error::{AcceptSnafu, BindSnafu, Result};
use crate::writer::{ProgressCallback, SeriesWriter};

/// A blocking storage SCP writing into a working directory.
#[derive(Debug)]
pub struct SeriesRetriever {
    listener: TcpListener,
    ae_title: String,
    writer: SeriesWriter,
}

impl SeriesRetriever {
    /// Listen on `addr` as the AE `ae_title`.
    pub fn bind(
        ae_title: impl Into<String>,
        addr: impl ToSocketAddrs,
        working_directory: impl Into<PathBuf>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).context(BindSnafu)?;
        Ok(SeriesRetriever {
            listener,
            ae_title: ae_title.into(),
            writer: SeriesWriter::new(working_directory),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context(BindSnafu)
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.writer.set_progress(Some(progress));
        self
    }

    /// Number of objects stored so far.
    pub fn received(&self) -> usize {
        self.writer.instance_index()
    }

    /// Accept one association and serve it until it is released.
    pub fn serve_one(&mut self) -> Result<()> {
        let (stream, peer) = self.listener.accept().context(BindSnafu)?;
        debug!("Connection from {}", peer);
        self.serve_stream(stream)
    }

    /// Serve incoming associations one after the other, forever.
    pub fn serve(&mut self) -> Result<()> {
        info!(
            "{} listening on {}",
            self.ae_title,
            self.listener.local_addr().context(BindSnafu)?
        );
        loop {
            if let Err(e) = self.serve_one() {
                error!("{}", Report::from_error(e));
            }
        }
    }

    fn serve_stream(&mut self, stream: TcpStream) -> Result<()> {
        let mut options = ServerAssociationOptions::new()
            .accept_any()
            .ae_title(self.ae_title.as_str())
            .max_pdu_length(MAX_PDU_LENGTH)
            .strict(false)
            .promiscuous(true)
            .with_abstract_syntax(uids::VERIFICATION);
        for uid in STORAGE_SOP_CLASSES {
            options = options.with_abstract_syntax(*uid);
        }
        for ts in TransferSyntaxRegistry.iter() {
            if !ts.is_unsupported() {
                options = options.with_transfer_syntax(ts.uid());
            }
        }

        let mut association = options
            .establish(stream)
            .map_err(Box::from)
            .context(AcceptSnafu)?;
        info!("New association from {}", association.client_ae_title());

        loop {
            match receive_incoming(&mut association)? {
                Incoming::Message(message) => {
                    let pc_id = message.presentation_context_id;
                    match command_field(&message.command) {
                        Some(C_ECHO_RQ) => {
                            let message_id =
                                command_u16(&message.command, tags::MESSAGE_ID).unwrap_or(0);
                            send_command(&mut association, pc_id, &dimse::echo_rsp(message_id))?;
                        }
                        Some(C_STORE_RQ) => {
                            let ts = transfer_syntax_of(&association, pc_id);
                            answer_store(&mut association, &ts, message, &mut self.writer)?;
                        }
                        other => {
                            warn!("Refusing unsupported DIMSE command {:04X?}", other);
                            let rsp = dimse::unrecognized_rsp(&message.command);
                            send_command(&mut association, pc_id, &rsp)?;
                        }
                    }
                }
                Incoming::ReleaseRequest => {
                    association.send_pdu(&Pdu::ReleaseRP)?;
                    info!("Released association with {}", association.client_ae_title());
                    return Ok(());
                }
                Incoming::Abort => {
                    info!("Aborted association with {}", association.client_ae_title());
                    return Ok(());
                }
            }
        }
    }
}

fn transfer_syntax_of(association: &ServerAssociation<TcpStream>, pc_id: u8) -> String {
    association
        .presentation_contexts()
        .iter()
        .find(|pc| pc.id == pc_id)
        .map(|pc| trim_uid(&pc.transfer_syntax).to_string())
        .unwrap_or_else(|| uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string())
}
