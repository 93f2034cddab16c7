//! Connection settings of the enquirer.
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use snafu::ensure;

use crate::error::{InvalidConfigurationSnafu, Result};

/// Smallest maximum PDU length accepted.
pub const MIN_PDU_LENGTH: u32 = 4096;
/// Largest maximum PDU length accepted.
pub const MAX_PDU_LENGTH: u32 = 131_072;
/// Maximum PDU length proposed by default.
pub const DEFAULT_PDU_LENGTH: u32 = 16_384;

/// How series are pulled from the PACS.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum RetrieveMethod {
    /// C-MOVE to a third party storage SCP
    #[default]
    Move,
    /// C-GET on the query association
    Get,
}

impl fmt::Display for RetrieveMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrieveMethod::Move => f.write_str("MOVE"),
            RetrieveMethod::Get => f.write_str("GET"),
        }
    }
}

impl FromStr for RetrieveMethod {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MOVE" => Ok(RetrieveMethod::Move),
            "GET" => Ok(RetrieveMethod::Get),
            _ => InvalidConfigurationSnafu {
                message: format!("unknown retrieve method `{s}`"),
            }
            .fail(),
        }
    }
}

/// Identity of the local node and the PACS it talks to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PacsConfiguration {
    pub local_ae_title: String,
    pub host: String,
    pub port: u16,
    pub peer_ae_title: String,
    /// AE title receiving C-MOVE sub-operations,
    /// empty when C-MOVE is not used
    pub move_ae_title: String,
    /// where retrieved objects are written
    pub working_directory: PathBuf,
    pub max_pdu_length: u32,
    /// propose only native uncompressed transfer syntaxes
    pub uncompressed_only: bool,
    pub retrieve_method: RetrieveMethod,
}

impl Default for PacsConfiguration {
    fn default() -> Self {
        PacsConfiguration {
            local_ae_title: "LOCAL-AE".to_string(),
            host: "localhost".to_string(),
            port: 11112,
            peer_ae_title: "ANY-SCP".to_string(),
            move_ae_title: String::new(),
            working_directory: default_working_directory(),
            max_pdu_length: DEFAULT_PDU_LENGTH,
            uncompressed_only: false,
            retrieve_method: RetrieveMethod::default(),
        }
    }
}

/// `dicom` under the system's temporary directory.
pub fn default_working_directory() -> PathBuf {
    std::env::temp_dir().join("dicom")
}

impl PacsConfiguration {
    pub fn new(
        local_ae_title: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        peer_ae_title: impl Into<String>,
    ) -> Self {
        PacsConfiguration {
            local_ae_title: local_ae_title.into(),
            host: host.into(),
            port,
            peer_ae_title: peer_ae_title.into(),
            ..Default::default()
        }
    }

    pub fn with_move_ae_title(mut self, move_ae_title: impl Into<String>) -> Self {
        self.move_ae_title = move_ae_title.into();
        self
    }

    pub fn with_working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = path.into();
        self
    }

    pub fn with_max_pdu_length(mut self, max_pdu_length: u32) -> Self {
        self.max_pdu_length = max_pdu_length;
        self
    }

    pub fn with_uncompressed_only(mut self, uncompressed_only: bool) -> Self {
        self.uncompressed_only = uncompressed_only;
        self
    }

    pub fn with_retrieve_method(mut self, method: RetrieveMethod) -> Self {
        self.retrieve_method = method;
        self
    }

    /// `host:port` of the PACS
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check that the settings can be used to open an association.
    pub fn validate(&self) -> Result<()> {
        check_ae_title("local", &self.local_ae_title)?;
        check_ae_title("peer", &self.peer_ae_title)?;
        if !self.move_ae_title.is_empty() {
            check_ae_title("move destination", &self.move_ae_title)?;
        }
        ensure!(
            !self.host.trim().is_empty(),
            InvalidConfigurationSnafu {
                message: "host name is empty"
            }
        );
        ensure!(
            self.port != 0,
            InvalidConfigurationSnafu {
                message: "port must not be 0"
            }
        );
        ensure!(
            (MIN_PDU_LENGTH..=MAX_PDU_LENGTH).contains(&self.max_pdu_length),
            InvalidConfigurationSnafu {
                message: format!(
                    "maximum PDU length {} is outside {}..={}",
                    self.max_pdu_length, MIN_PDU_LENGTH, MAX_PDU_LENGTH
                )
            }
        );
        Ok(())
    }
}

fn check_ae_title(which: &str, title: &str) -> Result<()> {
    let title = title.trim();
    ensure!(
        !title.is_empty(),
        InvalidConfigurationSnafu {
            message: format!("{which} AE title is empty")
        }
    );
    ensure!(
        title.len() <= 16,
        InvalidConfigurationSnafu {
            message: format!("{which} AE title `{title}` is longer than 16 characters")
        }
    );
    Ok(())
}
