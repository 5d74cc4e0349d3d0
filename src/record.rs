//! Upstream thesis payloads: tolerant decoding, subject normalization, and
//! the embedding prompt templates.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::queue::SecondaryPayload;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// The subject facet arrives in four shapes: a string, a list of strings, an
/// object carrying `description`/`code`, or a list of such objects. The
/// variant never leaves this module; downstream code only sees the
/// normalized string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
pub enum SubjectField {
    #[default]
    Missing,
    One(String),
    Many(Vec<SubjectField>),
    Tagged(SubjectObject),
    /// Anything else the upstream invents; normalizes to the fallback.
    Other(Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectObject {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl SubjectField {
    /// Canonical comma-joined subject string, `"N/A"` when nothing usable.
    pub fn normalize(&self) -> String {
        let mut parts = Vec::new();
        self.collect_into(&mut parts);
        if parts.is_empty() {
            "N/A".to_string()
        } else {
            parts.join(", ")
        }
    }

    fn collect_into(&self, parts: &mut Vec<String>) {
        match self {
            SubjectField::Missing => {}
            SubjectField::One(s) => {
                let s = s.trim();
                if !s.is_empty() {
                    parts.push(s.to_string());
                }
            }
            SubjectField::Many(items) => {
                for item in items {
                    item.collect_into(parts);
                }
            }
            SubjectField::Tagged(obj) => {
                let chosen = obj
                    .description
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .or_else(|| obj.code.as_deref().map(str::trim).filter(|s| !s.is_empty()));
                if let Some(s) = chosen {
                    parts.push(s.to_string());
                }
            }
            SubjectField::Other(_) => {}
        }
    }
}

/// One decoded thesis from the remote repository.
#[derive(Debug, Clone, Deserialize)]
pub struct ThesisRecord {
    #[serde(default, alias = "Rubro")]
    pub rubro: String,
    #[serde(default, alias = "Texto")]
    pub texto: String,
    #[serde(default, alias = "Anio", alias = "Año", deserialize_with = "de_lenient_year")]
    pub anio: Option<i32>,
    #[serde(default, alias = "Mes", deserialize_with = "de_lenient_string")]
    pub mes: Option<String>,
    #[serde(default, alias = "Epoca", alias = "Época")]
    pub epoca: Option<String>,
    #[serde(default, alias = "Instancia")]
    pub instancia: Option<String>,
    #[serde(default, alias = "TipoTesis", alias = "tipoTesis")]
    pub tipo_tesis: Option<String>,
    #[serde(default, alias = "Materias", alias = "materia")]
    pub materias: SubjectField,
}

impl ThesisRecord {
    /// Decode the upstream body, returning both the typed view and the raw
    /// fields (persisted verbatim on the artifact).
    pub fn parse(body: &[u8]) -> Result<(Self, Value), ParseError> {
        let raw: Value = serde_json::from_slice(body)?;
        let record: ThesisRecord = serde_json::from_value(raw.clone())?;
        Ok((record, raw))
    }

    /// Both display fields must survive trimming.
    pub fn has_required_fields(&self) -> bool {
        !self.rubro.trim().is_empty() && !self.texto.trim().is_empty()
    }

    /// Header/body template for the primary source.
    pub fn embedding_prompt(&self, registro: &str) -> String {
        let mut prompt = String::new();
        prompt.push_str("SCJN/SJF\n");
        prompt.push_str(&format!("Registro: {registro}\n"));
        prompt.push_str(&format!(
            "Año: {}\n",
            self.anio.map(|y| y.to_string()).unwrap_or_default()
        ));
        prompt.push_str(&format!("Mes: {}\n", self.mes.as_deref().unwrap_or_default()));
        prompt.push_str(&format!(
            "TipoTesis: {}\n",
            self.tipo_tesis.as_deref().unwrap_or_default()
        ));
        prompt.push_str(&format!("Época: {}\n", self.epoca.as_deref().unwrap_or_default()));
        prompt.push_str(&format!(
            "Instancia: {}\n",
            self.instancia.as_deref().unwrap_or_default()
        ));
        prompt.push_str(&format!("Materias: {}\n", self.materias.normalize()));
        prompt.push_str(&format!("Rubro: {}\n", self.rubro.trim()));
        prompt.push('\n');
        prompt.push_str(self.texto.trim());
        prompt
    }
}

/// Header/body template for the secondary corpus.
pub fn secondary_embedding_prompt(payload: &SecondaryPayload) -> String {
    let mut prompt = String::new();
    prompt.push_str("TFJA\n");
    prompt.push_str(&format!("Época: {}\n", payload.epoca.as_deref().unwrap_or_default()));
    prompt.push_str(&format!(
        "Año: {}\n",
        payload.anio.map(|y| y.to_string()).unwrap_or_default()
    ));
    prompt.push_str(&format!("Mes: {}\n", payload.mes.as_deref().unwrap_or_default()));
    prompt.push_str(&format!("Rubro: {}\n", payload.rubro.trim()));
    prompt.push('\n');
    prompt.push_str(payload.texto.trim());
    prompt
}

/// Years arrive as numbers or numeric strings depending on the upstream
/// revision; anything else maps to unknown.
fn de_lenient_year<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::Number(n) => n.as_i64().and_then(|i| i32::try_from(i).ok()),
        Value::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    }))
}

fn de_lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_accepts_plain_string() {
        let record: ThesisRecord =
            serde_json::from_value(serde_json::json!({ "materias": "Penal" })).unwrap();
        assert_eq!(record.materias.normalize(), "Penal");
    }

    #[test]
    fn subject_accepts_string_list() {
        let record: ThesisRecord =
            serde_json::from_value(serde_json::json!({ "materias": ["Penal", "Civil"] })).unwrap();
        assert_eq!(record.materias.normalize(), "Penal, Civil");
    }

    #[test]
    fn subject_accepts_tagged_object() {
        let record: ThesisRecord = serde_json::from_value(
            serde_json::json!({ "materias": { "description": "Laboral" } }),
        )
        .unwrap();
        assert_eq!(record.materias.normalize(), "Laboral");

        let record: ThesisRecord =
            serde_json::from_value(serde_json::json!({ "materias": { "code": "ADM" } })).unwrap();
        assert_eq!(record.materias.normalize(), "ADM");
    }

    #[test]
    fn subject_accepts_object_list() {
        let record: ThesisRecord = serde_json::from_value(serde_json::json!({
            "materias": [{ "description": "Penal" }, { "code": "CIV" }]
        }))
        .unwrap();
        assert_eq!(record.materias.normalize(), "Penal, CIV");
    }

    #[test]
    fn subject_falls_back_to_na() {
        for value in [
            serde_json::json!({}),
            serde_json::json!({ "materias": null }),
            serde_json::json!({ "materias": [] }),
            serde_json::json!({ "materias": "  " }),
            serde_json::json!({ "materias": {} }),
            serde_json::json!({ "materias": 5 }),
        ] {
            let record: ThesisRecord = serde_json::from_value(value.clone()).unwrap();
            assert_eq!(record.materias.normalize(), "N/A", "input: {value}");
        }
    }

    #[test]
    fn year_is_lenient() {
        let record: ThesisRecord =
            serde_json::from_value(serde_json::json!({ "anio": "2019" })).unwrap();
        assert_eq!(record.anio, Some(2019));
        let record: ThesisRecord =
            serde_json::from_value(serde_json::json!({ "anio": 2021 })).unwrap();
        assert_eq!(record.anio, Some(2021));
        let record: ThesisRecord =
            serde_json::from_value(serde_json::json!({ "anio": "n/a" })).unwrap();
        assert_eq!(record.anio, None);
    }

    #[test]
    fn required_fields_need_non_blank_title_and_body() {
        let record: ThesisRecord =
            serde_json::from_value(serde_json::json!({ "rubro": "A", "texto": "b" })).unwrap();
        assert!(record.has_required_fields());
        let record: ThesisRecord =
            serde_json::from_value(serde_json::json!({ "rubro": "  ", "texto": "b" })).unwrap();
        assert!(!record.has_required_fields());
    }

    #[test]
    fn primary_prompt_layout() {
        let record: ThesisRecord = serde_json::from_value(serde_json::json!({
            "rubro": "AMPARO DIRECTO.",
            "texto": "Cuerpo de la tesis.",
            "anio": 2020,
            "mes": 5,
            "epoca": "11a",
            "instancia": "Primera Sala",
            "tipoTesis": "Aislada",
            "materias": ["Penal"]
        }))
        .unwrap();
        let prompt = record.embedding_prompt("292564");
        let expected = "SCJN/SJF\n\
                        Registro: 292564\n\
                        Año: 2020\n\
                        Mes: 5\n\
                        TipoTesis: Aislada\n\
                        Época: 11a\n\
                        Instancia: Primera Sala\n\
                        Materias: Penal\n\
                        Rubro: AMPARO DIRECTO.\n\
                        \n\
                        Cuerpo de la tesis.";
        assert_eq!(prompt, expected);
    }

    #[test]
    fn secondary_prompt_layout() {
        let payload = SecondaryPayload {
            rubro: "Criterio TFJA".into(),
            texto: "Texto del criterio.".into(),
            epoca: Some("8a".into()),
            anio: Some(2018),
            mes: Some("11".into()),
        };
        let prompt = secondary_embedding_prompt(&payload);
        let expected = "TFJA\n\
                        Época: 8a\n\
                        Año: 2018\n\
                        Mes: 11\n\
                        Rubro: Criterio TFJA\n\
                        \n\
                        Texto del criterio.";
        assert_eq!(prompt, expected);
    }

    #[test]
    fn parse_rejects_non_json() {
        assert!(ThesisRecord::parse(b"<html>not json</html>").is_err());
    }
}
