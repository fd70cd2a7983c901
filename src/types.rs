use geo::{MultiPolygon, Point};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One SE (enumeration area) polygon with its normalized attributes.
#[derive(Debug, Clone)]
pub struct EnumerationArea {
    pub region: String,
    pub cercle: String,
    pub commune: String,
    pub num_se: String,
    pub pop_se: u32,
    pub men_se: Option<u32>,
    pub geometry: MultiPolygon<f64>,
}

/// One uploaded point (concession). Non-coordinate CSV columns pass
/// through untouched as string attributes.
#[derive(Debug, Clone)]
pub struct SurveyPoint {
    pub point: Point<f64>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}
