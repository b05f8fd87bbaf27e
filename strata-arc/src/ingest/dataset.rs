//! Parsed attribute sets
//!
//! Objects are decoded into a [`Dataset`]: attribute keyword → value, where a
//! value is a string, a number, a list of strings (multi-valued attribute)
//! or a list of nested datasets (sequence). Parsing the binary encoding of
//! real modalities is the job of a [`DatasetParser`] implementation; the
//! archive ships a JSON one.

use crate::error::{ArcError, ArcResult};
use crate::identity::{Issuer, PersonName, SubjectDemographics};
use crate::models::{RequestAttributes, SubjectId};
use serde_json::{Map, Value};

/// Attribute keywords used by the archive
pub mod keyword {
    pub const STUDY_INSTANCE_UID: &str = "StudyInstanceUID";
    pub const SERIES_INSTANCE_UID: &str = "SeriesInstanceUID";
    pub const SOP_INSTANCE_UID: &str = "SOPInstanceUID";
    pub const SOP_CLASS_UID: &str = "SOPClassUID";
    pub const STUDY_DATE: &str = "StudyDate";
    pub const STUDY_DESCRIPTION: &str = "StudyDescription";
    pub const SERIES_NUMBER: &str = "SeriesNumber";
    pub const INSTANCE_NUMBER: &str = "InstanceNumber";
    pub const MODALITY: &str = "Modality";
    pub const ACCESSION_NUMBER: &str = "AccessionNumber";
    pub const ISSUER_OF_ACCESSION_NUMBER_SEQUENCE: &str = "IssuerOfAccessionNumberSequence";
    pub const PATIENT_ID: &str = "PatientID";
    pub const PATIENT_NAME: &str = "PatientName";
    pub const PATIENT_BIRTH_DATE: &str = "PatientBirthDate";
    pub const PATIENT_SEX: &str = "PatientSex";
    pub const ISSUER_OF_PATIENT_ID: &str = "IssuerOfPatientID";
    pub const ISSUER_OF_PATIENT_ID_QUALIFIERS_SEQUENCE: &str = "IssuerOfPatientIDQualifiersSequence";
    pub const OTHER_PATIENT_IDS_SEQUENCE: &str = "OtherPatientIDsSequence";
    pub const LOCAL_NAMESPACE_ENTITY_ID: &str = "LocalNamespaceEntityID";
    pub const UNIVERSAL_ENTITY_ID: &str = "UniversalEntityID";
    pub const UNIVERSAL_ENTITY_ID_TYPE: &str = "UniversalEntityIDType";
    pub const REQUEST_ATTRIBUTES_SEQUENCE: &str = "RequestAttributesSequence";
    pub const REQUESTED_PROCEDURE_ID: &str = "RequestedProcedureID";
    pub const SCHEDULED_PROCEDURE_STEP_ID: &str = "ScheduledProcedureStepID";
    pub const REQUESTING_SERVICE: &str = "RequestingService";
    pub const REQUESTING_PHYSICIAN: &str = "RequestingPhysician";
}

use keyword::*;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    attrs: Map<String, Value>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(attrs: Map<String, Value>) -> Self {
        Self { attrs }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.attrs
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.attrs.contains_key(keyword)
    }

    /// First value of an attribute as a string; empty values are absent
    pub fn string(&self, keyword: &str) -> Option<String> {
        let value = match self.attrs.get(keyword)? {
            Value::Array(values) => values.first()?,
            other => other,
        };
        let s = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!s.is_empty()).then_some(s)
    }

    /// All values of a multi-valued attribute
    pub fn strings(&self, keyword: &str) -> Vec<String> {
        match self.attrs.get(keyword) {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            Some(_) => self.string(keyword).into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn int(&self, keyword: &str) -> Option<i64> {
        self.string(keyword)?.parse().ok()
    }

    /// Items of a sequence attribute
    pub fn items(&self, keyword: &str) -> Vec<Dataset> {
        match self.attrs.get(keyword) {
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(|v| v.as_object().cloned().map(Dataset::from_map))
                .collect(),
            Some(Value::Object(item)) => vec![Dataset::from_map(item.clone())],
            _ => Vec::new(),
        }
    }

    pub fn set_string(&mut self, keyword: &str, value: &str) {
        self.attrs
            .insert(keyword.to_string(), Value::String(value.to_string()));
    }

    pub fn remove(&mut self, keyword: &str) -> bool {
        self.attrs.remove(keyword).is_some()
    }

    /// Replace string values of `*UID` attributes, descending into sequences
    ///
    /// Returns the number of values replaced.
    pub fn replace_uids(&mut self, lookup: &dyn Fn(&str) -> Option<String>) -> usize {
        fn walk(map: &mut Map<String, Value>, lookup: &dyn Fn(&str) -> Option<String>) -> usize {
            let mut replaced = 0;
            for (key, value) in map.iter_mut() {
                match value {
                    Value::String(s) if key.ends_with("UID") => {
                        if let Some(new) = lookup(s) {
                            *s = new;
                            replaced += 1;
                        }
                    }
                    Value::Array(values) => {
                        for v in values.iter_mut() {
                            match v {
                                Value::Object(item) => replaced += walk(item, lookup),
                                Value::String(s) if key.ends_with("UID") => {
                                    if let Some(new) = lookup(s) {
                                        *s = new;
                                        replaced += 1;
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
            replaced
        }
        walk(&mut self.attrs, lookup)
    }

    pub fn study_iuid(&self) -> Option<String> {
        self.string(STUDY_INSTANCE_UID)
    }

    pub fn series_iuid(&self) -> Option<String> {
        self.string(SERIES_INSTANCE_UID)
    }

    pub fn sop_iuid(&self) -> Option<String> {
        self.string(SOP_INSTANCE_UID)
    }

    /// Issuer from `IssuerOfPatientID` and its qualifiers sequence
    fn patient_id_issuer(&self) -> Option<Issuer> {
        let qualifiers = self.items(ISSUER_OF_PATIENT_ID_QUALIFIERS_SEQUENCE);
        let qualifier = qualifiers.first();
        let issuer = Issuer::new(
            self.string(ISSUER_OF_PATIENT_ID).as_deref(),
            qualifier
                .and_then(|q| q.string(UNIVERSAL_ENTITY_ID))
                .as_deref(),
            qualifier
                .and_then(|q| q.string(UNIVERSAL_ENTITY_ID_TYPE))
                .as_deref(),
        );
        (!issuer.is_empty()).then_some(issuer)
    }

    fn patient_id(&self) -> Option<SubjectId> {
        let value = self.string(PATIENT_ID)?;
        Some(SubjectId::new(value, self.patient_id_issuer()))
    }

    /// Primary identifier, other identifiers, name and demographics
    pub fn subject_demographics(&self) -> SubjectDemographics {
        let mut ids: Vec<SubjectId> = self.patient_id().into_iter().collect();
        ids.extend(
            self.items(OTHER_PATIENT_IDS_SEQUENCE)
                .iter()
                .filter_map(Dataset::patient_id),
        );

        SubjectDemographics {
            ids,
            name: self
                .string(PATIENT_NAME)
                .map(|n| PersonName::parse(&n))
                .unwrap_or_default(),
            birth_date: self.string(PATIENT_BIRTH_DATE),
            sex: self.string(PATIENT_SEX),
        }
    }

    /// Request attributes from the first request item, or the top level
    pub fn request_attributes(&self) -> RequestAttributes {
        let items = self.items(REQUEST_ATTRIBUTES_SEQUENCE);
        let source = items.first().unwrap_or(self);

        let accession_issuer = source
            .items(ISSUER_OF_ACCESSION_NUMBER_SEQUENCE)
            .first()
            .map(|item| {
                Issuer::new(
                    item.string(LOCAL_NAMESPACE_ENTITY_ID).as_deref(),
                    item.string(UNIVERSAL_ENTITY_ID).as_deref(),
                    item.string(UNIVERSAL_ENTITY_ID_TYPE).as_deref(),
                )
            })
            .filter(|issuer| !issuer.is_empty());

        RequestAttributes {
            accession_no: source
                .string(ACCESSION_NUMBER)
                .or_else(|| self.string(ACCESSION_NUMBER)),
            accession_issuer,
            requested_procedure_id: source.string(REQUESTED_PROCEDURE_ID),
            scheduled_procedure_step_id: source.string(SCHEDULED_PROCEDURE_STEP_ID),
            requesting_service: source.string(REQUESTING_SERVICE),
            requesting_physician: source
                .string(REQUESTING_PHYSICIAN)
                .map(|n| PersonName::parse(&n))
                .unwrap_or_default(),
        }
    }
}

/// Decoder/encoder of stored object bytes
pub trait DatasetParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> ArcResult<Dataset>;

    fn encode(&self, dataset: &Dataset) -> ArcResult<Vec<u8>>;
}

/// Objects encoded as a JSON object of keyword → value
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDatasetParser;

impl DatasetParser for JsonDatasetParser {
    fn parse(&self, bytes: &[u8]) -> ArcResult<Dataset> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ArcError::Parse(format!("dataset not parseable: {}", e)))?;
        let Value::Object(attrs) = value else {
            return Err(ArcError::Parse(
                "dataset not parseable: top level is not an object".to_string(),
            ));
        };
        let dataset = Dataset::from_map(attrs);

        for required in [STUDY_INSTANCE_UID, SERIES_INSTANCE_UID, SOP_INSTANCE_UID] {
            if dataset.string(required).is_none() {
                return Err(ArcError::Parse(format!("missing {}", required)));
            }
        }
        Ok(dataset)
    }

    fn encode(&self, dataset: &Dataset) -> ArcResult<Vec<u8>> {
        serde_json::to_vec(dataset.as_map())
            .map_err(|e| ArcError::Parse(format!("dataset not encodable: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dataset(value: Value) -> Dataset {
        match value {
            Value::Object(map) => Dataset::from_map(map),
            _ => panic!("object expected"),
        }
    }

    #[test]
    fn test_parse_requires_uids() {
        let parser = JsonDatasetParser;
        assert!(matches!(parser.parse(b"not json"), Err(ArcError::Parse(_))));
        assert!(matches!(parser.parse(b"[1, 2]"), Err(ArcError::Parse(_))));

        let missing_sop = json!({"StudyInstanceUID": "1", "SeriesInstanceUID": "1.1"});
        let err = parser
            .parse(missing_sop.to_string().as_bytes())
            .unwrap_err();
        assert!(err.to_string().contains("SOPInstanceUID"));

        let ok = json!({"StudyInstanceUID": "1", "SeriesInstanceUID": "1.1", "SOPInstanceUID": "1.1.1"});
        let ds = parser.parse(ok.to_string().as_bytes()).unwrap();
        assert_eq!(ds.sop_iuid().as_deref(), Some("1.1.1"));
    }

    #[test]
    fn test_subject_ids_with_qualifiers_and_other_ids() {
        let ds = dataset(json!({
            "PatientID": "123",
            "IssuerOfPatientID": "G1",
            "IssuerOfPatientIDQualifiersSequence": [
                {"UniversalEntityID": "1.2.3", "UniversalEntityIDType": "ISO"}
            ],
            "OtherPatientIDsSequence": [
                {"PatientID": "789", "IssuerOfPatientID": "G2"},
                {"PatientID": ""}
            ],
            "PatientName": "Bunny^Bugs",
            "PatientSex": "M"
        }));

        let demo = ds.subject_demographics();
        assert_eq!(demo.ids.len(), 2);
        assert_eq!(demo.ids[0].value, "123");
        assert_eq!(demo.ids[0].issuer, Some(Issuer::parse("G1&1.2.3&ISO")));
        assert_eq!(demo.ids[1].issuer, Some(Issuer::local("G2")));
        assert_eq!(demo.name.family.as_deref(), Some("Bunny"));
        assert_eq!(demo.sex.as_deref(), Some("M"));
    }

    #[test]
    fn test_request_attributes_absent_values_stay_absent() {
        let ds = dataset(json!({
            "RequestAttributesSequence": [{
                "AccessionNumber": "A1",
                "IssuerOfAccessionNumberSequence": [{"LocalNamespaceEntityID": "HOSP"}],
                "RequestingPhysician": "House^Greg",
                "RequestingService": ""
            }]
        }));
        let request = ds.request_attributes();
        assert_eq!(request.accession_no.as_deref(), Some("A1"));
        assert_eq!(request.accession_issuer, Some(Issuer::local("HOSP")));
        assert_eq!(request.requesting_service, None);
        assert_eq!(request.requested_procedure_id, None);
        assert_eq!(request.requesting_physician.given.as_deref(), Some("Greg"));

        assert!(Dataset::new().request_attributes().is_empty());
    }

    #[test]
    fn test_multi_values_and_numbers() {
        let ds = dataset(json!({"ImageType": ["ORIGINAL", "PRIMARY"], "SeriesNumber": 4}));
        assert_eq!(ds.strings("ImageType"), vec!["ORIGINAL", "PRIMARY"]);
        assert_eq!(ds.string("ImageType").as_deref(), Some("ORIGINAL"));
        assert_eq!(ds.int("SeriesNumber"), Some(4));
    }

    #[test]
    fn test_replace_uids_descends_into_sequences() {
        let mut ds = dataset(json!({
            "StudyInstanceUID": "1",
            "PatientID": "1",
            "ReferencedSeriesSequence": [{"SeriesInstanceUID": "1", "Other": "1"}]
        }));
        let replaced = ds.replace_uids(&|uid| (uid == "1").then(|| "2".to_string()));
        assert_eq!(replaced, 2);
        assert_eq!(ds.study_iuid().as_deref(), Some("2"));
        assert_eq!(ds.string("PatientID").as_deref(), Some("1"));
        assert_eq!(
            ds.items("ReferencedSeriesSequence")[0].string("Other").as_deref(),
            Some("1")
        );
    }
}
