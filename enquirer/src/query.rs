//! Identifiers for series queries and retrievals.
//!
//! Every series search asks for the same set of return keys,
//! so that responses have the same shape
//! whichever attribute was used for matching.

use std::fmt;
use std::str::FromStr;

use dicom_core::{DataDictionary, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::InMemDicomObject;

use crate::error::{Error, InvalidConfigurationSnafu};

/// Query/retrieve level of an identifier.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum QueryLevel {
    Series,
    Image,
}

impl QueryLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryLevel::Series => "SERIES",
            QueryLevel::Image => "IMAGE",
        }
    }
}

impl fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" => Ok(QueryLevel::Image),
            _ => InvalidConfigurationSnafu {
                message: format!("unsupported query/retrieve level `{s}`"),
            }
            .fail(),
        }
    }
}

/// Series module return keys
pub static SERIES_KEYS: &[Tag] = &[
    tags::MODALITY,
    tags::SERIES_INSTANCE_UID,
    tags::SERIES_NUMBER,
    tags::LATERALITY,
    tags::SERIES_DATE,
    tags::SERIES_TIME,
    tags::PERFORMING_PHYSICIAN_NAME,
    tags::PROTOCOL_NAME,
    tags::SERIES_DESCRIPTION,
    tags::BODY_PART_EXAMINED,
    tags::PATIENT_POSITION,
    tags::ANATOMICAL_ORIENTATION_TYPE,
    tags::PERFORMED_PROCEDURE_STEP_ID,
    tags::PERFORMED_PROCEDURE_STEP_START_DATE,
    tags::PERFORMED_PROCEDURE_STEP_START_TIME,
    tags::PERFORMED_PROCEDURE_STEP_END_DATE,
    tags::PERFORMED_PROCEDURE_STEP_END_TIME,
    tags::PERFORMED_PROCEDURE_STEP_DESCRIPTION,
    tags::COMMENTS_ON_THE_PERFORMED_PROCEDURE_STEP,
];

/// Study module return keys
pub static STUDY_KEYS: &[Tag] = &[
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_ID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::CONSULTING_PHYSICIAN_NAME,
    tags::STUDY_DESCRIPTION,
    tags::PATIENT_AGE,
    tags::PATIENT_SIZE,
    tags::PATIENT_WEIGHT,
    tags::PATIENT_BODY_MASS_INDEX,
];

/// Patient module return keys
pub static PATIENT_KEYS: &[Tag] = &[
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
];

/// Equipment module return keys
pub static EQUIPMENT_KEYS: &[Tag] = &[tags::INSTITUTION_NAME];

/// All return keys of a series search, in request order.
pub fn return_keys() -> impl Iterator<Item = Tag> {
    SERIES_KEYS
        .iter()
        .chain(STUDY_KEYS)
        .chain(PATIENT_KEYS)
        .chain(EQUIPMENT_KEYS)
        .copied()
        .chain(std::iter::once(tags::NUMBER_OF_SERIES_RELATED_INSTANCES))
}

fn element(tag: Tag, value: &str) -> DataElement<InMemDicomObject> {
    let vr = StandardDataDictionary
        .by_tag(tag)
        .map(|entry| entry.vr.relaxed())
        .unwrap_or(VR::LO);
    let value = if value.is_empty() {
        PrimitiveValue::Empty
    } else {
        PrimitiveValue::from(value)
    };
    DataElement::new(tag, vr, value)
}

/// `*value*`
fn wildcard(value: &str) -> String {
    format!("*{value}*")
}

fn identifier(level: QueryLevel) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(element(tags::QUERY_RETRIEVE_LEVEL, level.as_str()));
    obj
}

fn series_search(key: Tag, value: &str) -> InMemDicomObject {
    let mut obj = identifier(QueryLevel::Series);
    for tag in return_keys() {
        obj.put(element(tag, ""));
    }
    obj.put(element(key, value));
    obj
}

/// Series search matching any part of the patient name.
pub fn series_by_patient_name(name: &str) -> InMemDicomObject {
    series_search(tags::PATIENT_NAME, &wildcard(name))
}

/// Series search matching any part of the patient ID.
pub fn series_by_patient_id(id: &str) -> InMemDicomObject {
    series_search(tags::PATIENT_ID, &wildcard(id))
}

/// Series search on the patient birth date, matched as given.
pub fn series_by_patient_birth_date(birth_date: &str) -> InMemDicomObject {
    series_search(tags::PATIENT_BIRTH_DATE, birth_date)
}

/// Series search on a study date range,
/// both dates in `YYYYMMDD` form.
pub fn series_by_date(from: &str, to: &str) -> InMemDicomObject {
    series_search(tags::STUDY_DATE, &format!("{from}-{to}"))
}

pub fn series_by_uid(uid: &str) -> InMemDicomObject {
    series_search(tags::SERIES_INSTANCE_UID, &wildcard(uid))
}

pub fn series_by_modality(modality: &str) -> InMemDicomObject {
    series_search(tags::MODALITY, &wildcard(modality))
}

pub fn series_by_description(description: &str) -> InMemDicomObject {
    series_search(tags::SERIES_DESCRIPTION, &wildcard(description))
}

/// Identifier for retrieving a whole series.
pub fn series_retrieve(series_uid: &str) -> InMemDicomObject {
    let mut obj = identifier(QueryLevel::Series);
    obj.put(element(tags::SERIES_INSTANCE_UID, series_uid));
    obj
}

/// Identifier for retrieving one instance of a series.
pub fn instance_retrieve(series_uid: &str, sop_instance_uid: &str) -> InMemDicomObject {
    let mut obj = identifier(QueryLevel::Image);
    obj.put(element(tags::SERIES_INSTANCE_UID, series_uid));
    obj.put(element(tags::SOP_INSTANCE_UID, sop_instance_uid));
    obj.put(element(tags::INSTANCE_NUMBER, ""));
    obj
}

/// Image level search for the SOP instance UID
/// of the instance with the given number in a series.
pub fn instance_lookup(series_uid: &str, instance_number: u32) -> InMemDicomObject {
    let mut obj = identifier(QueryLevel::Image);
    obj.put(element(tags::SERIES_INSTANCE_UID, series_uid));
    obj.put(element(tags::SOP_INSTANCE_UID, ""));
    obj.put(element(tags::INSTANCE_NUMBER, &instance_number.to_string()));
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::BTreeSet;

    fn value(obj: &InMemDicomObject, tag: Tag) -> String {
        obj.get(tag)
            .map(|e| e.to_str().unwrap().to_string())
            .unwrap_or_default()
    }

    fn tag_set(obj: &InMemDicomObject) -> BTreeSet<Tag> {
        obj.iter().map(|e| e.header().tag).collect()
    }

    #[rstest]
    #[case(series_by_patient_name("DOE"), tags::PATIENT_NAME, "*DOE*")]
    #[case(series_by_patient_id("42"), tags::PATIENT_ID, "*42*")]
    #[case(series_by_patient_birth_date("19700101"), tags::PATIENT_BIRTH_DATE, "19700101")]
    #[case(series_by_date("20200101", "20201231"), tags::STUDY_DATE, "20200101-20201231")]
    #[case(series_by_uid("1.2.3"), tags::SERIES_INSTANCE_UID, "*1.2.3*")]
    #[case(series_by_modality("CT"), tags::MODALITY, "*CT*")]
    #[case(series_by_description("head"), tags::SERIES_DESCRIPTION, "*head*")]
    fn search_sets_match_key(
        #[case] query: InMemDicomObject,
        #[case] key: Tag,
        #[case] expected: &str,
    ) {
        assert_eq!(value(&query, tags::QUERY_RETRIEVE_LEVEL), "SERIES");
        assert_eq!(value(&query, key), expected);

        // only the match key carries a value
        for tag in return_keys().filter(|t| *t != key) {
            assert_eq!(value(&query, tag), "", "{tag} should be empty");
        }
    }

    #[test]
    fn searches_share_one_shape() {
        let reference = tag_set(&series_by_modality("MR"));
        for query in [
            series_by_patient_name("A"),
            series_by_patient_id("B"),
            series_by_patient_birth_date("20000101"),
            series_by_date("20000101", "20000102"),
            series_by_uid("1.2"),
            series_by_description("C"),
        ] {
            assert_eq!(tag_set(&query), reference);
        }
        assert!(reference.contains(&tags::QUERY_RETRIEVE_LEVEL));
        assert!(reference.contains(&tags::PATIENT_ID));
        assert!(reference.contains(&tags::NUMBER_OF_SERIES_RELATED_INSTANCES));
    }

    #[test]
    fn empty_value_matches_everything() {
        let query = series_by_patient_name("");
        assert_eq!(value(&query, tags::PATIENT_NAME), "**");
    }

    #[test]
    fn return_keys_use_dictionary_vrs() {
        let query = series_by_modality("CT");
        assert_eq!(query.element(tags::MODALITY).unwrap().vr(), VR::CS);
        assert_eq!(query.element(tags::PATIENT_NAME).unwrap().vr(), VR::PN);
        assert_eq!(query.element(tags::STUDY_DATE).unwrap().vr(), VR::DA);
    }

    #[test]
    fn retrieve_identifiers() {
        let series = series_retrieve("1.2.3");
        assert_eq!(value(&series, tags::QUERY_RETRIEVE_LEVEL), "SERIES");
        assert_eq!(value(&series, tags::SERIES_INSTANCE_UID), "1.2.3");

        let instance = instance_retrieve("1.2.3", "1.2.3.4");
        assert_eq!(value(&instance, tags::QUERY_RETRIEVE_LEVEL), "IMAGE");
        assert_eq!(value(&instance, tags::SOP_INSTANCE_UID), "1.2.3.4");
        assert!(instance.get(tags::INSTANCE_NUMBER).is_some());

        let lookup = instance_lookup("1.2.3", 7);
        assert_eq!(value(&lookup, tags::INSTANCE_NUMBER), "7");
        assert_eq!(value(&lookup, tags::SOP_INSTANCE_UID), "");
    }

    #[test]
    fn query_levels() {
        assert_eq!("IMAGE".parse::<QueryLevel>().unwrap(), QueryLevel::Image);
        assert_eq!(QueryLevel::Series.to_string(), "SERIES");
        assert!("STUDY".parse::<QueryLevel>().is_err());
    }
}
