//! Persistence of retrieved objects and progress reporting.

use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use dicom_object::FileMetaTableBuilder;
use snafu::{ensure, ResultExt};
use tracing::{debug, error, info};

use crate::dimse::{string_of, STATUS_CANNOT_UNDERSTAND, STATUS_OUT_OF_RESOURCES, STATUS_SUCCESS};
use crate::driver::{AssociationHandler, IncomingStore};
use crate::error::{
    BuildMetaSnafu, CreateDirectorySnafu, Error, MissingAttributeSnafu, Result, WriteFileSnafu,
};

/// Receives `(series instance UID, instance index, path)`
/// once per processed instance.
///
/// The index starts at 1 on each pull or push.
pub type ProgressCallback = Box<dyn FnMut(&str, usize, &str) + Send>;

/// Writes incoming objects to
/// `<working directory>/<series instance UID>/<SOP instance UID>`
/// and counts them.
pub struct SeriesWriter {
    working_directory: PathBuf,
    progress: Option<ProgressCallback>,
    instance_index: usize,
}

impl std::fmt::Debug for SeriesWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesWriter")
            .field("working_directory", &self.working_directory)
            .field("progress", &self.progress.is_some())
            .field("instance_index", &self.instance_index)
            .finish()
    }
}

impl SeriesWriter {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        SeriesWriter {
            working_directory: working_directory.into(),
            progress: None,
            instance_index: 0,
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn set_progress(&mut self, progress: Option<ProgressCallback>) {
        self.progress = progress;
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Number of instances processed since the last reset.
    pub fn instance_index(&self) -> usize {
        self.instance_index
    }

    /// Restart the instance count.
    pub fn reset(&mut self) {
        self.instance_index = 0;
    }

    /// Count one more instance and report it.
    pub fn notify(&mut self, series_uid: &str, path: &str) -> usize {
        self.instance_index += 1;
        if let Some(progress) = self.progress.as_mut() {
            progress(series_uid, self.instance_index, path);
        }
        self.instance_index
    }

    /// Write an incoming object under the working directory
    /// and report it.
    pub fn write(&mut self, request: IncomingStore) -> Result<PathBuf> {
        let IncomingStore {
            transfer_syntax,
            sop_class_uid,
            sop_instance_uid,
            dataset,
            ..
        } = request;

        let series_uid = string_of(&dataset, tags::SERIES_INSTANCE_UID);
        ensure!(
            is_file_name(&series_uid),
            MissingAttributeSnafu {
                tag: tags::SERIES_INSTANCE_UID
            }
        );
        let sop_instance_uid = Some(string_of(&dataset, tags::SOP_INSTANCE_UID))
            .filter(|uid| !uid.is_empty())
            .unwrap_or(sop_instance_uid);
        ensure!(
            is_file_name(&sop_instance_uid),
            MissingAttributeSnafu {
                tag: tags::SOP_INSTANCE_UID
            }
        );
        let sop_class_uid = Some(string_of(&dataset, tags::SOP_CLASS_UID))
            .filter(|uid| !uid.is_empty())
            .unwrap_or(sop_class_uid);

        let series_dir = self.working_directory.join(&series_uid);
        std::fs::create_dir_all(&series_dir).context(CreateDirectorySnafu { path: &series_dir })?;

        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(sop_class_uid)
            .media_storage_sop_instance_uid(sop_instance_uid.as_str())
            .transfer_syntax(transfer_syntax)
            .build()
            .context(BuildMetaSnafu)?;

        let path = series_dir.join(&sop_instance_uid);
        dataset
            .with_exact_meta(meta)
            .write_to_file(&path)
            .context(WriteFileSnafu { path: &path })?;
        debug!("Stored {}", path.display());

        self.notify(&series_uid, &path.to_string_lossy());
        Ok(path)
    }
}

/// Whether a UID can be used as a single path component.
fn is_file_name(uid: &str) -> bool {
    !uid.is_empty()
        && !uid.chars().all(|c| c == '.')
        && !uid.contains(|c: char| c == '/' || c == '\\' || c == ':')
}

fn status_for(e: &Error) -> u16 {
    match e {
        Error::MissingAttribute { .. } => STATUS_CANNOT_UNDERSTAND,
        _ => STATUS_OUT_OF_RESOURCES,
    }
}

impl AssociationHandler for SeriesWriter {
    fn handle_incoming_store(&mut self, request: IncomingStore) -> u16 {
        let sop_instance_uid = request.sop_instance_uid.clone();
        match self.write(request) {
            Ok(path) => {
                info!("Received {} into {}", sop_instance_uid, path.display());
                STATUS_SUCCESS
            }
            Err(e) => {
                error!("Could not store {}: {}", sop_instance_uid, snafu::Report::from_error(&e));
                status_for(&e)
            }
        }
    }
}
