use crate::types::{EnumerationArea, SurveyPoint};
use anyhow::{anyhow, bail, Context, Result};
use csv::ReaderBuilder;
use geo::bounding_rect::BoundingRect;
use geo::{MultiPolygon, Point};
use geojson::GeoJson;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::convert::TryInto;
use std::fs;
use tracing::{info, warn};

/// Fallback chains for the label columns. The source GeoJSON has been
/// re-exported several times with shifting column names; the first
/// present, non-empty property wins.
const REGION_COLUMNS: &[&str] = &["lreg_new", "lregion", "region"];
const CERCLE_COLUMNS: &[&str] = &["lcer_new", "lcercle", "cercle"];
const COMMUNE_COLUMNS: &[&str] = &["lcom_new", "lcommune", "commune"];
const SE_COLUMNS: &[&str] = &["num_se", "idse", "se"];

pub const LATITUDE_COLUMN: &str = "Latitude";
pub const LONGITUDE_COLUMN: &str = "Longitude";

/// Read bytes from an http(s) URL or a local path.
pub async fn fetch_bytes(source: &str) -> Result<Vec<u8>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::get(source)
            .await
            .with_context(|| format!("Failed to fetch {}", source))?
            .error_for_status()
            .with_context(|| format!("Request for {} failed", source))?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    } else {
        fs::read(source).with_context(|| format!("Failed to read file: {}", source))
    }
}

pub async fn load_enumeration_areas(source: &str) -> Result<Vec<EnumerationArea>> {
    info!(source, "loading SE polygons");
    let bytes = fetch_bytes(source).await?;
    let (areas, skipped) = parse_enumeration_areas(&bytes)?;
    info!(loaded = areas.len(), skipped, "SE polygons ready");
    Ok(areas)
}

pub async fn load_points(source: &str) -> Result<Vec<SurveyPoint>> {
    info!(source, "loading point CSV");
    let bytes = fetch_bytes(source).await?;
    let (points, skipped) = parse_points_csv(&bytes)?;
    if skipped > 0 {
        warn!(skipped, "rows with unparseable coordinates were dropped");
    }
    info!(loaded = points.len(), "points ready");
    Ok(points)
}

/// Parse the SE GeoJSON into enumeration areas. Features with missing,
/// empty, or non-polygon geometry are skipped; the second element of the
/// return value counts them.
pub fn parse_enumeration_areas(bytes: &[u8]) -> Result<(Vec<EnumerationArea>, usize)> {
    let text = std::str::from_utf8(bytes).context("SE GeoJSON is not valid UTF-8")?;
    let geojson: GeoJson = text.parse().context("Failed to parse SE GeoJSON")?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => bail!("SE GeoJSON must be a FeatureCollection"),
    };

    let mut areas = Vec::new();
    let mut skipped = 0usize;

    for feature in collection.features {
        let props = normalize_properties(feature.properties.as_ref());

        let geometry = match feature.geometry.and_then(|g| to_multi_polygon(g.value)) {
            Some(mp) if is_usable(&mp) => mp,
            _ => {
                skipped += 1;
                continue;
            }
        };

        areas.push(EnumerationArea {
            region: first_label(&props, REGION_COLUMNS).unwrap_or_default(),
            cercle: first_label(&props, CERCLE_COLUMNS).unwrap_or_default(),
            commune: first_label(&props, COMMUNE_COLUMNS).unwrap_or_default(),
            num_se: first_label(&props, SE_COLUMNS).unwrap_or_default(),
            pop_se: first_count(&props, &["pop_se"]).unwrap_or(0),
            men_se: first_count(&props, &["men_se"]),
            geometry,
        });
    }

    Ok((areas, skipped))
}

/// Lowercase and trim property keys. When the normalization collides
/// (e.g. "Region" and "REGION"), the first occurrence wins.
fn normalize_properties(props: Option<&geojson::JsonObject>) -> BTreeMap<String, JsonValue> {
    let mut out = BTreeMap::new();
    if let Some(props) = props {
        for (key, value) in props {
            let key = key.trim().to_lowercase();
            out.entry(key).or_insert_with(|| value.clone());
        }
    }
    out
}

fn first_label(props: &BTreeMap<String, JsonValue>, chain: &[&str]) -> Option<String> {
    for key in chain {
        match props.get(*key) {
            Some(JsonValue::String(s)) => {
                let s = s.trim();
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            }
            Some(JsonValue::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn first_count(props: &BTreeMap<String, JsonValue>, chain: &[&str]) -> Option<u32> {
    for key in chain {
        match props.get(*key) {
            Some(JsonValue::Number(n)) => {
                if let Some(v) = n.as_f64() {
                    return Some(v.max(0.0).round() as u32);
                }
            }
            Some(JsonValue::String(s)) => {
                if let Ok(v) = s.trim().parse::<f64>() {
                    return Some(v.max(0.0).round() as u32);
                }
            }
            _ => {}
        }
    }
    None
}

fn to_multi_polygon(value: geojson::Value) -> Option<MultiPolygon<f64>> {
    let geometry: geo::Geometry<f64> = value.try_into().ok()?;
    match geometry {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p])),
        _ => None,
    }
}

/// Empty and degenerate geometries (rings too short to close) are dropped,
/// mirroring the source's valid-and-non-empty filter.
fn is_usable(mp: &MultiPolygon<f64>) -> bool {
    if mp.0.is_empty() || mp.bounding_rect().is_none() {
        return false;
    }
    mp.0.iter().all(|p| p.exterior().0.len() >= 4)
}

/// Parse an uploaded point CSV. The header must contain `Latitude` and
/// `Longitude`; rows whose coordinates do not parse are skipped and
/// counted. Every other column passes through as a string attribute.
pub fn parse_points_csv(bytes: &[u8]) -> Result<(Vec<SurveyPoint>, usize)> {
    let mut reader = ReaderBuilder::new().from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let lat_idx = headers.iter().position(|h| h == LATITUDE_COLUMN);
    let lon_idx = headers.iter().position(|h| h == LONGITUDE_COLUMN);
    let (lat_idx, lon_idx) = match (lat_idx, lon_idx) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => bail!(
            "CSV must contain {} and {} columns",
            LATITUDE_COLUMN,
            LONGITUDE_COLUMN
        ),
    };

    let mut points = Vec::new();
    let mut skipped = 0usize;

    for result in reader.records() {
        let record = result.context("Failed to read CSV record")?;
        let lat = record.get(lat_idx).unwrap_or("").trim().parse::<f64>();
        let lon = record.get(lon_idx).unwrap_or("").trim().parse::<f64>();
        let (lat, lon) = match (lat, lon) {
            (Ok(lat), Ok(lon)) if lat.is_finite() && lon.is_finite() => (lat, lon),
            _ => {
                skipped += 1;
                continue;
            }
        };

        let mut attributes = BTreeMap::new();
        for (idx, value) in record.iter().enumerate() {
            if idx == lat_idx || idx == lon_idx {
                continue;
            }
            if let Some(name) = headers.get(idx) {
                attributes.insert(name.clone(), value.trim().to_string());
            }
        }

        points.push(SurveyPoint {
            point: Point::new(lon, lat),
            attributes,
        });
    }

    Ok((points, skipped))
}

/// Rewrite a Google Drive share link into its direct-download form.
pub fn drive_download_url(link: &str) -> Result<String> {
    if !link.contains("drive.google.com") {
        bail!("Invalid Google Drive link");
    }
    let after = link
        .split("/d/")
        .nth(1)
        .ok_or_else(|| anyhow!("Invalid Google Drive link"))?;
    let file_id = after.split('/').next().unwrap_or("");
    if file_id.is_empty() {
        bail!("Invalid Google Drive link");
    }
    Ok(format!("https://drive.google.com/uc?id={}", file_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature_collection(features: &str) -> String {
        format!(r#"{{"type":"FeatureCollection","features":[{}]}}"#, features)
    }

    fn square_feature(props: &str) -> String {
        format!(
            r#"{{"type":"Feature","properties":{},"geometry":{{"type":"Polygon","coordinates":[[[0.0,0.0],[1.0,0.0],[1.0,1.0],[0.0,1.0],[0.0,0.0]]]}}}}"#,
            props
        )
    }

    #[test]
    fn normalizes_label_fallback_chain() {
        let raw = feature_collection(&square_feature(
            r#"{"LREGION":" Kayes ","cercle":"Kita","LCOM_NEW":"Commune I","num_se":101,"pop_se":"250"}"#,
        ));
        let (areas, skipped) = parse_enumeration_areas(raw.as_bytes()).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(areas.len(), 1);
        assert_eq!(areas[0].region, "Kayes");
        assert_eq!(areas[0].cercle, "Kita");
        assert_eq!(areas[0].commune, "Commune I");
        assert_eq!(areas[0].num_se, "101");
        assert_eq!(areas[0].pop_se, 250);
        assert_eq!(areas[0].men_se, None);
    }

    #[test]
    fn new_label_columns_win_over_legacy_ones() {
        let raw = feature_collection(&square_feature(
            r#"{"lreg_new":"Nioro","lregion":"Kayes","region":"Old"}"#,
        ));
        let (areas, _) = parse_enumeration_areas(raw.as_bytes()).unwrap();
        assert_eq!(areas[0].region, "Nioro");
    }

    #[test]
    fn missing_labels_and_population_get_defaults() {
        let raw = feature_collection(&square_feature("{}"));
        let (areas, _) = parse_enumeration_areas(raw.as_bytes()).unwrap();
        assert_eq!(areas[0].region, "");
        assert_eq!(areas[0].num_se, "");
        assert_eq!(areas[0].pop_se, 0);
    }

    #[test]
    fn features_without_usable_geometry_are_skipped() {
        let no_geometry = r#"{"type":"Feature","properties":{"region":"Gao"},"geometry":null}"#;
        let point_geometry = r#"{"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[1.0,2.0]}}"#;
        let raw = feature_collection(&format!(
            "{},{},{}",
            no_geometry,
            point_geometry,
            square_feature(r#"{"region":"Segou"}"#)
        ));
        let (areas, skipped) = parse_enumeration_areas(raw.as_bytes()).unwrap();
        assert_eq!(areas.len(), 1);
        assert_eq!(skipped, 2);
        assert_eq!(areas[0].region, "Segou");
    }

    #[test]
    fn non_feature_collection_is_an_error() {
        let raw = r#"{"type":"Point","coordinates":[0.0,0.0]}"#;
        assert!(parse_enumeration_areas(raw.as_bytes()).is_err());
    }

    #[test]
    fn csv_without_coordinate_columns_is_rejected() {
        let raw = b"Name,X,Y\nA,1.0,2.0\n";
        let err = parse_points_csv(raw).unwrap_err();
        assert!(err.to_string().contains("Latitude"));
    }

    #[test]
    fn csv_rows_with_bad_coordinates_are_skipped() {
        let raw = b"Latitude,Longitude,Enqueteur\n12.5,-8.0,Fanta\nabc,-8.0,Modibo\n13.1,-7.9,Kalilou\n";
        let (points, skipped) = parse_points_csv(raw).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(skipped, 1);
        assert_eq!(points[0].point.x(), -8.0);
        assert_eq!(points[0].point.y(), 12.5);
        assert_eq!(points[0].attributes.get("Enqueteur").unwrap(), "Fanta");
    }

    #[test]
    fn csv_header_is_trimmed_before_matching() {
        let raw = b" Latitude , Longitude \n12.0,-8.0\n";
        let (points, skipped) = parse_points_csv(raw).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn drive_share_link_is_rewritten() {
        let link = "https://drive.google.com/file/d/1AbC_dEf/view?usp=sharing";
        assert_eq!(
            drive_download_url(link).unwrap(),
            "https://drive.google.com/uc?id=1AbC_dEf"
        );
    }

    #[test]
    fn non_drive_links_are_rejected() {
        assert!(drive_download_url("https://example.org/file.csv").is_err());
        assert!(drive_download_url("https://drive.google.com/open?id=1AbC").is_err());
    }
}
