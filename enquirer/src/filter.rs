//! Client side refinement of series searches.
//!
//! A PACS only matches on the single key of a C-FIND request,
//! so the remaining criteria are checked on the responses.

use std::collections::HashSet;

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use crate::dimse::string_of;
use crate::enquirer::SeriesEnquirer;
use crate::error::Result;

/// Criteria for series searches.
///
/// Empty criteria match everything.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SeriesFilter {
    /// text found in any of the attributes below
    pub search: String,
    pub patient_name: String,
    /// part of the birth date, `YYYYMMDD`
    pub patient_birth_date: String,
    pub patient_id: String,
    pub series_uid: String,
    pub series_description: String,
    pub modality: String,
    /// inclusive study date bounds, `YYYYMMDD`
    pub study_date_range: Option<(String, String)>,
}

impl SeriesFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = search.into();
        self
    }

    pub fn with_patient_name(mut self, name: impl Into<String>) -> Self {
        self.patient_name = name.into();
        self
    }

    pub fn with_patient_birth_date(mut self, birth_date: impl Into<String>) -> Self {
        self.patient_birth_date = birth_date.into();
        self
    }

    pub fn with_patient_id(mut self, id: impl Into<String>) -> Self {
        self.patient_id = id.into();
        self
    }

    pub fn with_series_uid(mut self, uid: impl Into<String>) -> Self {
        self.series_uid = uid.into();
        self
    }

    pub fn with_series_description(mut self, description: impl Into<String>) -> Self {
        self.series_description = description.into();
        self
    }

    pub fn with_modality(mut self, modality: impl Into<String>) -> Self {
        self.modality = modality.into();
        self
    }

    pub fn with_study_date_range(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.study_date_range = Some((from.into(), to.into()));
        self
    }

    /// Run the C-FIND request on the first criterion set,
    /// in the order name, birth date, patient ID, series UID,
    /// description, modality, then study date range.
    /// With no criterion, every series is requested.
    pub fn primary_search(&self, enquirer: &mut SeriesEnquirer) -> Result<Vec<InMemDicomObject>> {
        if !self.patient_name.is_empty() {
            enquirer.find_series_by_patient_name(&self.patient_name)
        } else if !self.patient_birth_date.is_empty() {
            enquirer.find_series_by_patient_birth_date(&self.patient_birth_date)
        } else if !self.patient_id.is_empty() {
            enquirer.find_series_by_patient_uid(&self.patient_id)
        } else if !self.series_uid.is_empty() {
            enquirer.find_series_by_uid(&self.series_uid)
        } else if !self.series_description.is_empty() {
            enquirer.find_series_by_description(&self.series_description)
        } else if !self.modality.is_empty() {
            enquirer.find_series_by_modality(&self.modality)
        } else if let Some((from, to)) = &self.study_date_range {
            enquirer.find_series_by_date(from, to)
        } else {
            enquirer.find_series_by_patient_name("")
        }
    }

    /// Primary search followed by [`apply`](Self::apply).
    pub fn search(&self, enquirer: &mut SeriesEnquirer) -> Result<Vec<InMemDicomObject>> {
        let responses = self.primary_search(enquirer)?;
        Ok(self.apply(responses))
    }

    /// Keep the first response of each series
    /// which satisfies every criterion.
    pub fn apply(&self, responses: Vec<InMemDicomObject>) -> Vec<InMemDicomObject> {
        let mut seen = HashSet::new();
        responses
            .into_iter()
            .filter(|record| seen.insert(string_of(record, tags::SERIES_INSTANCE_UID)))
            .filter(|record| self.matches(record))
            .collect()
    }

    /// Whether a C-FIND response satisfies every criterion.
    pub fn matches(&self, record: &InMemDicomObject) -> bool {
        let study_date = string_of(record, tags::STUDY_DATE);
        if let Some((from, to)) = &self.study_date_range {
            if !is_date(&study_date) || study_date < *from || study_date > *to {
                return false;
            }
        }

        let birth_date = string_of(record, tags::PATIENT_BIRTH_DATE);
        if !birth_date.contains(self.patient_birth_date.as_str()) {
            return false;
        }

        let fields = [
            (tags::PATIENT_NAME, &self.patient_name),
            (tags::PATIENT_ID, &self.patient_id),
            (tags::SERIES_INSTANCE_UID, &self.series_uid),
            (tags::SERIES_DESCRIPTION, &self.series_description),
            (tags::MODALITY, &self.modality),
        ];
        let values: Vec<String> = fields
            .iter()
            .map(|(tag, _)| string_of(record, *tag).to_lowercase())
            .collect();
        let all_match = fields
            .iter()
            .zip(&values)
            .all(|((_, wanted), value)| value.contains(&wanted.to_lowercase()));
        if !all_match {
            return false;
        }

        let search = self.search.to_lowercase();
        search.is_empty()
            || display_date(&study_date).contains(&search)
            || birth_date.contains(&search)
            || values.iter().any(|value| value.contains(&search))
    }
}

fn is_date(value: &str) -> bool {
    value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit())
}

/// `YYYYMMDD` as `MM/DD/YYYY`
fn display_date(value: &str) -> String {
    if is_date(value) {
        format!("{}/{}/{}", &value[4..6], &value[6..8], &value[0..4])
    } else {
        String::new()
    }
}
