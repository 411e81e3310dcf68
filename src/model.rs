//! Query and result records
//!
//! Everything here is created per lookup and dropped once the response is built.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Status reported for every record; the portal never exposes a real one.
pub const CANDIDATE_STATUS: i32 = 0;

/// Classification tag for records scraped from the credential table.
pub const CANDIDATE_TIPO: &str = "C1";

/// Logical form field a query value is written into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Nombre,
    Paterno,
    Materno,
    Curp,
}

impl Field {
    /// All fields, in the order the form lays them out
    pub const ALL: [Field; 4] = [Field::Nombre, Field::Paterno, Field::Materno, Field::Curp];

    /// Name used in configuration and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Nombre => "nombre",
            Field::Paterno => "paterno",
            Field::Materno => "materno",
            Field::Curp => "curp",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lookup request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nombre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paterno: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materno: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curp: Option<String>,
}

impl Query {
    /// Query by CURP only
    pub fn by_curp(curp: impl Into<String>) -> Self {
        Self {
            curp: Some(curp.into()),
            ..Default::default()
        }
    }

    /// Query by name and surnames
    pub fn by_name(
        nombre: impl Into<String>,
        paterno: impl Into<String>,
        materno: impl Into<String>,
    ) -> Self {
        Self {
            nombre: Some(nombre.into()),
            paterno: Some(paterno.into()),
            materno: Some(materno.into()),
            curp: None,
        }
    }

    /// Value for a field, `None` when absent or blank
    pub fn value(&self, field: Field) -> Option<&str> {
        let raw = match field {
            Field::Nombre => self.nombre.as_deref(),
            Field::Paterno => self.paterno.as_deref(),
            Field::Materno => self.materno.as_deref(),
            Field::Curp => self.curp.as_deref(),
        };
        raw.map(str::trim).filter(|v| !v.is_empty())
    }

    /// Fields carrying a non-empty value, in form order
    pub fn present_fields(&self) -> impl Iterator<Item = (Field, &str)> + '_ {
        Field::ALL
            .into_iter()
            .filter_map(move |field| self.value(field).map(|v| (field, v)))
    }

    /// Caller-side check: a search needs at least a name or a CURP
    pub fn validate(&self) -> Result<()> {
        if self.value(Field::Nombre).is_none() && self.value(Field::Curp).is_none() {
            return Err(Error::InvalidQuery(
                "provide at least {nombre, paterno, materno} or {curp}".into(),
            ));
        }
        Ok(())
    }
}

/// Cell texts of one table row, positional
pub type RawRow = Vec<String>;

/// One normalized credential record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub cedula: String,
    pub nombre: String,
    pub paterno: String,
    pub materno: String,
    pub carrera: String,
    pub universidad: String,
    pub entidad: String,
    pub anno: String,
    pub status: i32,
    pub tipo: String,
}

impl Candidate {
    /// Map a raw table row by column position; headers are never consulted.
    ///
    /// Column 4 (gender) and anything past column 8 are ignored. Missing
    /// trailing cells become empty strings.
    pub fn from_row(row: &[String]) -> Self {
        let cell = |i: usize| row.get(i).map(|c| c.trim().to_string()).unwrap_or_default();
        Self {
            cedula: cell(0),
            nombre: cell(1),
            paterno: cell(2),
            materno: cell(3),
            universidad: cell(5),
            carrera: cell(6),
            entidad: cell(7),
            anno: cell(8),
            status: CANDIDATE_STATUS,
            tipo: CANDIDATE_TIPO.to_string(),
        }
    }

    /// Year of the record, from the first run of digits in `anno`
    pub fn year(&self) -> Option<i64> {
        leading_number(&self.anno)
    }
}

fn leading_number(s: &str) -> Option<i64> {
    let digits: String = s
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Records of one lookup plus aggregates derived from them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    pub records: Vec<Candidate>,
    pub total_count: usize,
    pub first_record: Option<Candidate>,
    pub cedulas: Vec<String>,
    pub universities: Vec<String>,
    pub jurisdictions: Vec<String>,
    pub numeric_years: Vec<i64>,
    pub latest_year: Option<i64>,
}

impl ResultSet {
    /// A legitimate zero-match result
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the set and its aggregates from records in table order
    pub fn from_records(records: Vec<Candidate>) -> Self {
        let cedulas = records.iter().map(|r| r.cedula.clone()).collect();
        let universities = unique_non_empty(records.iter().map(|r| r.universidad.as_str()));
        let jurisdictions = unique_non_empty(records.iter().map(|r| r.entidad.as_str()));
        let numeric_years: Vec<i64> = records.iter().filter_map(Candidate::year).collect();
        let latest_year = numeric_years.iter().copied().max();

        Self {
            total_count: records.len(),
            first_record: records.first().cloned(),
            records,
            cedulas,
            universities,
            jurisdictions,
            numeric_years,
            latest_year,
        }
    }

    /// Whether the portal reported no matches
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// First-seen order, duplicates and empty strings dropped
fn unique_non_empty<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for v in values.filter(|v| !v.is_empty()) {
        if !out.iter().any(|seen| seen == v) {
            out.push(v.to_string());
        }
    }
    out
}
