use crate::types::{EnumerationArea, SurveyPoint};
use geo::algorithm::contains::Contains;
use geo::algorithm::intersects::Intersects;
use geo::algorithm::relate::Relate;
use geo::bounding_rect::BoundingRect;
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Spatial predicate applied point-against-polygon, in that argument
/// order: `within` asks whether the point lies within the polygon,
/// `contains` whether the point contains the polygon (degenerate, but
/// kept for parity with the attribute-query UI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Predicate {
    Intersects,
    Within,
    Contains,
}

/// Bounding-box entry pointing back into the area slice.
pub struct AreaEnvelope {
    pub index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for AreaEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

pub fn build_index(areas: &[EnumerationArea]) -> RTree<AreaEnvelope> {
    let entries: Vec<AreaEnvelope> = areas
        .iter()
        .enumerate()
        .filter_map(|(index, area)| {
            let rect = area.geometry.bounding_rect()?;
            Some(AreaEnvelope {
                index,
                aabb: AABB::from_corners(
                    [rect.min().x, rect.min().y],
                    [rect.max().x, rect.max().y],
                ),
            })
        })
        .collect();
    RTree::bulk_load(entries)
}

/// One (point, area) pair produced by the inner spatial join. A point
/// falling on a shared boundary can pair with several areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPair {
    pub point_index: usize,
    pub area_index: usize,
}

/// Inner join of the points against the selected areas. Candidates come
/// from the R-tree over all area bounding boxes; `selected` restricts the
/// exact test to the current attribute selection.
pub fn spatial_join(
    points: &[SurveyPoint],
    areas: &[EnumerationArea],
    tree: &RTree<AreaEnvelope>,
    selected: &HashSet<usize>,
    predicate: Predicate,
) -> Vec<JoinPair> {
    let mut pairs = Vec::new();

    for (point_index, survey_point) in points.iter().enumerate() {
        let envelope = AABB::from_point([survey_point.point.x(), survey_point.point.y()]);
        for candidate in tree.locate_in_envelope_intersecting(&envelope) {
            if !selected.contains(&candidate.index) {
                continue;
            }
            let area = &areas[candidate.index];
            if evaluate(predicate, survey_point, area) {
                pairs.push(JoinPair {
                    point_index,
                    area_index: candidate.index,
                });
            }
        }
    }

    pairs
}

fn evaluate(predicate: Predicate, point: &SurveyPoint, area: &EnumerationArea) -> bool {
    match predicate {
        Predicate::Intersects => area.geometry.intersects(&point.point),
        Predicate::Within => area.geometry.contains(&point.point),
        Predicate::Contains => point.point.relate(&area.geometry).is_contains(),
    }
}
