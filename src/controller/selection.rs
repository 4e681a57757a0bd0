//! Geographic node selection.
//!
//! Nodes carry their location as labels. Region selectors compare a label
//! against the selector values; polygon selectors test the node's
//! coordinates against one or more `[[lon, lat], ...]` polygons.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::controller::error::{Error, Result};
use crate::controller::node_monitor::is_usable;
use crate::crd::{Selector, SelectorKind, SelectorOperator};

pub const CITY_LABEL: &str = "edge-net.io/city";
pub const STATE_LABEL: &str = "edge-net.io/state-iso";
pub const COUNTRY_LABEL: &str = "edge-net.io/country-iso";
pub const CONTINENT_LABEL: &str = "edge-net.io/continent";
pub const LATITUDE_LABEL: &str = "edge-net.io/lat";
pub const LONGITUDE_LABEL: &str = "edge-net.io/lon";

/// A closed ring of `(lon, lat)` vertices.
pub type Polygon = Vec<(f64, f64)>;

/// Parse a coordinate label such as `n48.85`, `w2.35` or `-33.9`.
///
/// `s` and `w` prefixes negate the value.
pub fn parse_coordinate(value: &str) -> Option<f64> {
    let value = value.trim();
    let (sign, digits) = match value.chars().next()? {
        'n' | 'N' | 'e' | 'E' => (1.0, value.get(1..)?),
        's' | 'S' | 'w' | 'W' => (-1.0, value.get(1..)?),
        _ => (1.0, value),
    };
    digits.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| sign * v)
}

/// Parse one polygon value. At least three vertices are required.
pub fn parse_polygon(value: &str) -> Result<Polygon> {
    let points: Vec<[f64; 2]> = serde_json::from_str(value)
        .map_err(|e| Error::Selection(format!("invalid polygon {value:?}: {e}")))?;
    if points.len() < 3 {
        return Err(Error::Selection(format!(
            "polygon needs at least 3 points, got {}",
            points.len()
        )));
    }
    Ok(points.into_iter().map(|[lon, lat]| (lon, lat)).collect())
}

/// Ray casting point-in-polygon test.
pub fn point_in_polygon(lon: f64, lat: f64, polygon: &[(f64, f64)]) -> bool {
    let Some(&last) = polygon.last() else {
        return false;
    };
    let mut inside = false;
    let mut previous = last;
    for &current in polygon {
        let ((x1, y1), (x2, y2)) = (previous, current);
        if (y1 > lat) != (y2 > lat) && lon < (x2 - x1) * (lat - y1) / (y2 - y1) + x1 {
            inside = !inside;
        }
        previous = current;
    }
    inside
}

/// Node coordinates as `(lon, lat)`.
pub fn node_coordinates(node: &Node) -> Option<(f64, f64)> {
    let labels = node.labels();
    let lat = parse_coordinate(labels.get(LATITUDE_LABEL)?)?;
    let lon = parse_coordinate(labels.get(LONGITUDE_LABEL)?)?;
    Some((lon, lat))
}

fn label_for(kind: SelectorKind) -> Option<&'static str> {
    match kind {
        SelectorKind::City => Some(CITY_LABEL),
        SelectorKind::State => Some(STATE_LABEL),
        SelectorKind::Country => Some(COUNTRY_LABEL),
        SelectorKind::Continent => Some(CONTINENT_LABEL),
        SelectorKind::Polygon => None,
    }
}

/// A selector with its polygons parsed once.
#[derive(Debug)]
pub struct CompiledSelector<'a> {
    selector: &'a Selector,
    polygons: Vec<Polygon>,
}

impl<'a> CompiledSelector<'a> {
    /// Fails for polygon selectors with malformed values.
    pub fn compile(selector: &'a Selector) -> Result<Self> {
        let polygons = match selector.name {
            SelectorKind::Polygon => selector
                .value
                .iter()
                .map(|v| parse_polygon(v))
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(Self { selector, polygons })
    }

    fn criteria_match(&self, node: &Node) -> bool {
        match label_for(self.selector.name) {
            Some(label) => node
                .labels()
                .get(label)
                .is_some_and(|v| self.selector.value.iter().any(|want| want.eq_ignore_ascii_case(v))),
            None => node_coordinates(node).is_some_and(|(lon, lat)| {
                self.polygons
                    .iter()
                    .any(|polygon| point_in_polygon(lon, lat, polygon))
            }),
        }
    }

    /// Whether the node satisfies the selector, ignoring quantity.
    pub fn matches(&self, node: &Node) -> bool {
        let matched = self.criteria_match(node);
        match self.selector.operator {
            SelectorOperator::In => matched,
            SelectorOperator::NotIn => !matched,
        }
    }

    /// Pick the nodes for this selector.
    ///
    /// Only usable nodes qualify. With a positive quantity at most that many
    /// are kept, preferring nodes in `current` (the existing placement) and
    /// then name order.
    pub fn select<'n, I>(&self, nodes: I, current: &BTreeSet<String>) -> Vec<String>
    where
        I: IntoIterator<Item = &'n Node>,
    {
        let mut selected: Vec<String> = nodes
            .into_iter()
            .filter(|node| is_usable(node) && self.matches(node))
            .map(|node| node.name_any())
            .collect();
        selected.sort_by(|a, b| match (current.contains(a), current.contains(b)) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.cmp(b),
        });
        selected.dedup();
        let quantity = usize::try_from(self.selector.quantity).unwrap_or(0);
        if quantity > 0 {
            selected.truncate(quantity);
        }
        selected
    }
}
