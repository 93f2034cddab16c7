//! The series enquirer:
//! queries a PACS for series and pulls or pushes their instances
//! over a single association.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use dicom_dictionary_std::{tags, uids};
use dicom_object::{open_file, InMemDicomObject};
use snafu::{ensure, OptionExt, ResultExt};
use tracing::{debug, error, info, warn};

use crate::config::{PacsConfiguration, RetrieveMethod};
use crate::context::{proposed_contexts, store_context, ProposedContext};
use crate::dimse::{describe_status, encode_dataset, string_of, StatusClass};
use crate::driver::AssociationDriver;
use crate::error::{
    CreateDirectorySnafu, Error, InvalidConfigurationSnafu, MissingAttributeSnafu,
    NetworkInitializationFailureSnafu, NotConnectedSnafu, OpenFileSnafu,
    PresentationContextMissingSnafu, Result,
};
use crate::query;
use crate::writer::{ProgressCallback, SeriesWriter};

const FIND: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;
const MOVE: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE;
const GET: &str = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET;

/// A DICOM query/retrieve and storage client bound to one PACS.
///
/// Every operation blocks until the exchange with the PACS is over.
/// Progress callbacks run on the calling thread,
/// in the middle of the operation that triggered them.
///
/// ```no_run
/// # fn main() -> Result<(), dicom_enquirer::Error> {
/// use dicom_enquirer::SeriesEnquirer;
///
/// let mut enquirer = SeriesEnquirer::new();
/// enquirer.initialize("LOCAL-AE", "pacs.local", 104, "PACS", "", None)?;
/// enquirer.connect()?;
/// let series = enquirer.find_series_by_modality("CT")?;
/// println!("{} series found", series.len());
/// enquirer.disconnect();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SeriesEnquirer {
    config: PacsConfiguration,
    proposals: Vec<ProposedContext>,
    writer: SeriesWriter,
    driver: Option<AssociationDriver>,
}

impl Default for SeriesEnquirer {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesEnquirer {
    /// Create an enquirer which still needs to be initialized.
    pub fn new() -> Self {
        let config = PacsConfiguration::default();
        SeriesEnquirer {
            writer: SeriesWriter::new(config.working_directory.clone()),
            config,
            proposals: Vec::new(),
            driver: None,
        }
    }

    /// Set the identity of both nodes,
    /// create the working directory
    /// and prepare the presentation contexts to propose.
    ///
    /// No network activity takes place.
    pub fn initialize(
        &mut self,
        local_ae_title: &str,
        host: &str,
        port: u16,
        peer_ae_title: &str,
        move_ae_title: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let config = PacsConfiguration {
            local_ae_title: local_ae_title.to_string(),
            host: host.to_string(),
            port,
            peer_ae_title: peer_ae_title.to_string(),
            move_ae_title: move_ae_title.to_string(),
            ..self.config.clone()
        };
        self.initialize_with(&config, progress)
    }

    /// Same as [`initialize`](Self::initialize),
    /// taking every setting from a configuration.
    pub fn initialize_with(
        &mut self,
        config: &PacsConfiguration,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        config.validate()?;
        if self.driver.is_some() {
            self.disconnect();
        }

        let dir = &config.working_directory;
        std::fs::create_dir_all(dir).context(CreateDirectorySnafu { path: dir })?;

        self.config = config.clone();
        self.writer = SeriesWriter::new(dir.clone());
        self.writer.set_progress(progress);
        self.proposals = proposed_contexts(config.uncompressed_only);
        debug!(
            "{} presentation contexts prepared for {}",
            self.proposals.len(),
            config.peer_ae_title
        );
        Ok(())
    }

    pub fn configuration(&self) -> &PacsConfiguration {
        &self.config
    }

    /// Where objects received through C-GET are written.
    pub fn working_directory(&self) -> &Path {
        self.writer.working_directory()
    }

    /// Open the association with the PACS.
    pub fn connect(&mut self) -> Result<bool> {
        ensure!(
            !self.proposals.is_empty(),
            InvalidConfigurationSnafu {
                message: "the enquirer is not initialized"
            }
        );
        if self.driver.is_some() {
            debug!("Already connected to {}", self.config.peer_ae_title);
            return Ok(true);
        }

        let addr = self.resolve_peer()?;
        info!(
            "Connecting to {} ({}:{})",
            self.config.peer_ae_title, self.config.host, self.config.port
        );
        let driver = AssociationDriver::establish(&self.config, &self.proposals, addr)?;
        info!("Connected to {}", self.config.peer_ae_title);
        self.driver = Some(driver);
        Ok(true)
    }

    fn resolve_peer(&self) -> Result<SocketAddr> {
        let host = self.config.host.as_str();
        let port = self.config.port;
        (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                NetworkInitializationFailureSnafu {
                    message: format!("could not resolve {host}:{port}: {e}"),
                }
                .build()
            })?
            .next()
            .context(NetworkInitializationFailureSnafu {
                message: format!("no address found for {host}:{port}"),
            })
    }

    pub fn is_connected_to_pacs(&self) -> bool {
        self.driver.is_some()
    }

    /// Check that the PACS answers a C-ECHO request with success.
    pub fn ping_pacs(&mut self) -> bool {
        let Some(driver) = self.driver.as_mut() else {
            warn!("Cannot ping: not connected");
            return false;
        };
        match driver.echo() {
            Ok(status) if status == 0 => true,
            Ok(status) => {
                warn!(
                    "C-ECHO status {:04X}H: {}",
                    status,
                    describe_status(status)
                );
                false
            }
            Err(e) => {
                warn!("C-ECHO failed: {}", e);
                false
            }
        }
    }

    /// Release the association, if any.
    pub fn disconnect(&mut self) {
        if let Some(driver) = self.driver.take() {
            info!("Disconnecting from {}", self.config.peer_ae_title);
            if let Err(e) = driver.release() {
                warn!("Association release failed: {}", e);
            }
        }
    }

    /// Resolve an uncompressed presentation context for a SOP class,
    /// or 0 if there is none (or no association).
    pub fn find_uncompressed_pc(&self, sop_class: &str) -> u8 {
        self.driver
            .as_ref()
            .map(|driver| driver.find_uncompressed_pc(sop_class))
            .unwrap_or(0)
    }

    pub fn find_series_by_patient_name(&mut self, name: &str) -> Result<Vec<InMemDicomObject>> {
        self.send_find_request(&query::series_by_patient_name(name))
    }

    pub fn find_series_by_patient_uid(&mut self, patient_id: &str) -> Result<Vec<InMemDicomObject>> {
        self.send_find_request(&query::series_by_patient_id(patient_id))
    }

    pub fn find_series_by_patient_birth_date(
        &mut self,
        birth_date: &str,
    ) -> Result<Vec<InMemDicomObject>> {
        self.send_find_request(&query::series_by_patient_birth_date(birth_date))
    }

    /// Find series of studies performed between two dates (`YYYYMMDD`).
    pub fn find_series_by_date(&mut self, from: &str, to: &str) -> Result<Vec<InMemDicomObject>> {
        self.send_find_request(&query::series_by_date(from, to))
    }

    pub fn find_series_by_uid(&mut self, uid: &str) -> Result<Vec<InMemDicomObject>> {
        self.send_find_request(&query::series_by_uid(uid))
    }

    pub fn find_series_by_modality(&mut self, modality: &str) -> Result<Vec<InMemDicomObject>> {
        self.send_find_request(&query::series_by_modality(modality))
    }

    pub fn find_series_by_description(
        &mut self,
        description: &str,
    ) -> Result<Vec<InMemDicomObject>> {
        self.send_find_request(&query::series_by_description(description))
    }

    /// Send a study root C-FIND request with the given identifier.
    pub fn send_find_request(
        &mut self,
        identifier: &InMemDicomObject,
    ) -> Result<Vec<InMemDicomObject>> {
        let driver = self.driver.as_mut().context(NotConnectedSnafu)?;
        let pc_id = driver.find_uncompressed_pc(FIND);
        if pc_id == 0 {
            error!("There is no uncompressed presentation context for Study Root FIND");
            return PresentationContextMissingSnafu {
                operation: "Study Root FIND",
            }
            .fail();
        }
        info!("Send C-FIND request");
        debug!("Identifier: {:?}", identifier);
        driver.find(pc_id, identifier)
    }

    /// Look up the SOP instance UID of the instance with the given number
    /// in a series.
    ///
    /// Returns an empty string when the PACS has no match.
    pub fn find_sop_instance_uid(&mut self, series_uid: &str, instance_number: u32) -> Result<String> {
        let responses = self.send_find_request(&query::instance_lookup(series_uid, instance_number))?;
        Ok(responses
            .first()
            .map(|obj| string_of(obj, tags::SOP_INSTANCE_UID))
            .unwrap_or_default())
    }

    /// Pull series with the configured retrieve method.
    pub fn pull_series<S: AsRef<str>>(&mut self, series_uids: &[S]) -> Result<()> {
        match self.config.retrieve_method {
            RetrieveMethod::Move => self.pull_series_using_move_retrieve_method(series_uids),
            RetrieveMethod::Get => self.pull_series_using_get_retrieve_method(series_uids),
        }
    }

    /// Ask the PACS to send each series to the move destination AE,
    /// stopping at the first failure.
    pub fn pull_series_using_move_retrieve_method<S: AsRef<str>>(
        &mut self,
        series_uids: &[S],
    ) -> Result<()> {
        self.check_move_ready()?;
        self.writer.reset();
        for uid in series_uids {
            let uid = uid.as_ref();
            self.send_move_request(&query::series_retrieve(uid))
                .map_err(|e| retrieve_failure("C-MOVE", uid, e))?;
        }
        Ok(())
    }

    /// Retrieve each series on this association,
    /// stopping at the first failure.
    pub fn pull_series_using_get_retrieve_method<S: AsRef<str>>(
        &mut self,
        series_uids: &[S],
    ) -> Result<()> {
        ensure!(self.driver.is_some(), NotConnectedSnafu);
        self.writer.reset();
        for uid in series_uids {
            let uid = uid.as_ref();
            self.send_get_request(&query::series_retrieve(uid))
                .map_err(|e| retrieve_failure("C-GET", uid, e))?;
        }
        Ok(())
    }

    pub fn pull_instance_using_move_retrieve_method(
        &mut self,
        series_uid: &str,
        sop_instance_uid: &str,
    ) -> Result<()> {
        self.check_move_ready()?;
        self.writer.reset();
        self.send_move_request(&query::instance_retrieve(series_uid, sop_instance_uid))
            .map_err(|e| retrieve_failure("C-MOVE", series_uid, e))
    }

    pub fn pull_instance_using_get_retrieve_method(
        &mut self,
        series_uid: &str,
        sop_instance_uid: &str,
    ) -> Result<()> {
        ensure!(self.driver.is_some(), NotConnectedSnafu);
        self.writer.reset();
        self.send_get_request(&query::instance_retrieve(series_uid, sop_instance_uid))
            .map_err(|e| retrieve_failure("C-GET", series_uid, e))
    }

    fn check_move_ready(&self) -> Result<()> {
        ensure!(self.driver.is_some(), NotConnectedSnafu);
        ensure!(
            !self.config.move_ae_title.is_empty(),
            InvalidConfigurationSnafu {
                message: "the move destination AE title is not set"
            }
        );
        Ok(())
    }

    fn send_move_request(&mut self, identifier: &InMemDicomObject) -> Result<()> {
        let driver = self.driver.as_mut().context(NotConnectedSnafu)?;
        let pc_id = driver.find_uncompressed_pc(MOVE);
        if pc_id == 0 {
            warn!("There is no uncompressed presentation context for Study Root MOVE");
        }
        info!("Send C-MOVE request to {}", self.config.move_ae_title);
        debug!("Identifier: {:?}", identifier);
        driver.move_request(pc_id, &self.config.move_ae_title, identifier, &mut self.writer)?;
        Ok(())
    }

    fn send_get_request(&mut self, identifier: &InMemDicomObject) -> Result<()> {
        let driver = self.driver.as_mut().context(NotConnectedSnafu)?;
        let pc_id = driver.find_uncompressed_pc(GET);
        if pc_id == 0 {
            warn!("There is no uncompressed presentation context for Study Root GET");
        }
        info!("Send C-GET request");
        debug!("Identifier: {:?}", identifier);
        let status = driver.get_request(pc_id, identifier, &mut self.writer)?;
        match StatusClass::of(status) {
            StatusClass::Success | StatusClass::Warning => Ok(()),
            _ => Err(Error::RequestFailure {
                message: format!("{} ({:04X}H)", describe_status(status), status),
                series_uid: None,
                status: Some(status),
            }),
        }
    }

    /// Store DICOM files on the PACS, stopping at the first failure.
    pub fn push_series<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<()> {
        ensure!(self.driver.is_some(), NotConnectedSnafu);
        self.writer.reset();
        for path in paths {
            let path = path.as_ref();
            self.store_file(path).map_err(store_failure)?;
            self.writer.notify("", &path.to_string_lossy());
        }
        Ok(())
    }

    /// Store in-memory data sets on the PACS,
    /// stopping at the first failure.
    pub fn push_series_datasets(&mut self, datasets: &[InMemDicomObject]) -> Result<()> {
        ensure!(self.driver.is_some(), NotConnectedSnafu);
        self.writer.reset();
        for dataset in datasets {
            let sop_class_uid = string_of(dataset, tags::SOP_CLASS_UID);
            ensure!(
                !sop_class_uid.is_empty(),
                MissingAttributeSnafu {
                    tag: tags::SOP_CLASS_UID
                }
            );
            let sop_instance_uid = string_of(dataset, tags::SOP_INSTANCE_UID);
            ensure!(
                !sop_instance_uid.is_empty(),
                MissingAttributeSnafu {
                    tag: tags::SOP_INSTANCE_UID
                }
            );
            self.send_store_request(dataset, &sop_class_uid, &sop_instance_uid, None)
                .map_err(store_failure)?;
            self.writer.notify("", "");
        }
        Ok(())
    }

    fn store_file(&mut self, path: &Path) -> Result<()> {
        let file = open_file(path).context(OpenFileSnafu {
            path: PathBuf::from(path),
        })?;
        let meta = file.meta();
        let sop_class_uid = meta.media_storage_sop_class_uid().to_string();
        let sop_instance_uid = meta.media_storage_sop_instance_uid().to_string();
        let transfer_syntax = meta.transfer_syntax().to_string();
        self.send_store_request(&file, &sop_class_uid, &sop_instance_uid, Some(&transfer_syntax))
    }

    fn send_store_request(
        &mut self,
        dataset: &InMemDicomObject,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        transfer_syntax: Option<&str>,
    ) -> Result<()> {
        let driver = self.driver.as_mut().context(NotConnectedSnafu)?;
        let move_pc_id = driver.find_uncompressed_pc(MOVE);
        if move_pc_id == 0 {
            warn!("There is no uncompressed presentation context for Study Root MOVE");
        }

        let pc = store_context(driver.contexts(), sop_class_uid, transfer_syntax, move_pc_id)
            .cloned()
            .ok_or_else(|| Error::RequestFailure {
                message: match transfer_syntax {
                    Some(ts) => format!("No presentation context acceptable for {sop_class_uid} in {ts}"),
                    None => format!("No presentation context acceptable for {sop_class_uid}"),
                },
                series_uid: None,
                status: None,
            })?;
        if let Some(ts) = transfer_syntax.filter(|ts| *ts != pc.transfer_syntax) {
            debug!("Transcoding {} from {} to {}", sop_instance_uid, ts, pc.transfer_syntax);
        }

        let data = encode_dataset(dataset, &pc.transfer_syntax)?;
        let status = driver.store_request(pc.id, sop_class_uid, sop_instance_uid, data)?;
        match StatusClass::of(status) {
            StatusClass::Success => Ok(()),
            StatusClass::Warning => {
                warn!(
                    "C-STORE of {} completed with warning {:04X}H",
                    sop_instance_uid, status
                );
                Ok(())
            }
            _ => Err(Error::RequestFailure {
                message: format!("{} ({:04X}H)", describe_status(status), status),
                series_uid: None,
                status: Some(status),
            }),
        }
    }
}

impl Drop for SeriesEnquirer {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Attach the series to a failed retrieval,
/// keeping failures reported by the PACS as they are.
fn retrieve_failure(operation: &str, series_uid: &str, e: Error) -> Error {
    let e = match e {
        Error::RequestFailure {
            message,
            series_uid: None,
            status: Some(status),
        } if message == "Unable to perform a C-MOVE operation." => Error::RequestFailure {
            message,
            series_uid: Some(series_uid.to_string()),
            status: Some(status),
        },
        Error::RequestFailure {
            message, status, ..
        } => Error::RequestFailure {
            message: format!(
                "Unable to send a {operation} request to the server. (Series instance UID ={series_uid}) : {message}"
            ),
            series_uid: Some(series_uid.to_string()),
            status,
        },
        other => Error::RequestFailure {
            message: format!(
                "Unable to send a {operation} request to the server. (Series instance UID ={series_uid}) : {other}"
            ),
            series_uid: Some(series_uid.to_string()),
            status: None,
        },
    };
    error!("{}", e);
    e
}

fn store_failure(e: Error) -> Error {
    let (reason, status) = match e {
        Error::RequestFailure { message, status, .. } => (message, status),
        other => (other.to_string(), None),
    };
    let e = Error::RequestFailure {
        message: format!("Unable to send a C-STORE request to the server : {reason}"),
        series_uid: None,
        status,
    };
    error!("{}", e);
    e
}
