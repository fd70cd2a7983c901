use crate::types::{EnumerationArea, Role};
use serde::Deserialize;

/// Sorted, trimmed, deduplicated option list; empty labels are dropped.
pub fn unique_clean<'a, I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out: Vec<String> = values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Cascading attribute filter, narrowing from region down to a single SE.
/// Every level is optional; an absent level matches everything below it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterSelection {
    pub region: Option<String>,
    pub cercle: Option<String>,
    pub commune: Option<String>,
    pub se: Option<String>,
}

impl FilterSelection {
    pub fn matches(&self, area: &EnumerationArea) -> bool {
        level_matches(&self.region, &area.region)
            && level_matches(&self.cercle, &area.cercle)
            && level_matches(&self.commune, &area.commune)
            && level_matches(&self.se, &area.num_se)
    }
}

fn level_matches(wanted: &Option<String>, actual: &str) -> bool {
    match wanted {
        Some(w) => w.trim() == actual,
        None => true,
    }
}

/// Is this user allowed to see the given region? Admins see everything;
/// other users only the regions assigned to them.
pub fn region_allowed(role: Role, accessible: &[String], region: &str) -> bool {
    role == Role::Admin || accessible.iter().any(|r| r == region)
}

/// Areas matching the selection, restricted to the user's regions.
pub fn select<'a>(
    areas: &'a [EnumerationArea],
    selection: &FilterSelection,
    role: Role,
    accessible: &[String],
) -> Vec<&'a EnumerationArea> {
    areas
        .iter()
        .filter(|a| region_allowed(role, accessible, &a.region))
        .filter(|a| selection.matches(a))
        .collect()
}

/// Region dropdown options for a user.
pub fn accessible_regions(
    areas: &[EnumerationArea],
    role: Role,
    accessible: &[String],
) -> Vec<String> {
    let all = unique_clean(areas.iter().map(|a| a.region.as_str()));
    all.into_iter()
        .filter(|r| region_allowed(role, accessible, r))
        .collect()
}
