//! Aggregation of converged stream values into a balance report.
//!
//! The report is a flat, immutable snapshot shaped for direct display: one
//! row per unit with its closure error, one row per stream with its
//! converged state, and a plant summary. Rows are sorted by ascending id
//! and all maps are ordered, so solving the same graph twice produces
//! byte-identical serialized reports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::graph::FlowsheetGraph;
use crate::{Composition, StreamId, StreamState, UnitId};

/// Relative closure error below which a unit counts as balanced, percent.
const BALANCED_PCT: f64 = 0.1;
/// Upper bound of the warning band, percent.
const WARNING_PCT: f64 = 2.0;

/// Classification of a unit's mass-balance closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceStatus {
    /// Closure error at or below 0.1 %.
    Balanced,
    /// Closure error above 0.1 % and at or below 2 %.
    Warning,
    /// Closure error above 2 %.
    Error,
}

impl BalanceStatus {
    /// Classifies a relative closure error given in percent.
    pub fn from_error_pct(error_pct: f64) -> Self {
        if error_pct <= BALANCED_PCT {
            BalanceStatus::Balanced
        } else if error_pct <= WARNING_PCT {
            BalanceStatus::Warning
        } else {
            BalanceStatus::Error
        }
    }
}

/// Mass-balance closure of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitBalance {
    /// The unit this row describes.
    pub unit: UnitId,
    /// Display label, e.g. `"Thickener #4"`.
    pub label: String,
    /// Total mass flow entering the unit.
    pub input_total: f64,
    /// Total mass flow leaving the unit, including water deliberately
    /// removed by dewatering or drying. Removed water is part of the
    /// closure, not an error.
    pub output_total: f64,
    /// Relative closure error in percent of the input total.
    pub error_pct: f64,
    /// Classification of `error_pct`.
    pub status: BalanceStatus,
}

/// Converged state of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// The stream this row describes.
    pub stream: StreamId,
    /// Source unit; `None` for plant feeds.
    pub from: Option<UnitId>,
    /// Destination unit; `None` for plant products.
    pub to: Option<UnitId>,
    /// Total wet mass flow rate.
    pub flow_rate: f64,
    /// Solids composition, mass fraction per component.
    pub composition: Composition,
    /// Water fraction of the total flow.
    pub moisture: f64,
}

impl StreamRecord {
    /// Mass fraction of one component; zero when absent.
    pub fn grade(&self, component: &str) -> f64 {
        self.composition.get(component).copied().unwrap_or(0.0)
    }
}

/// Plant-wide totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantSummary {
    /// Sum of all plant feed flows.
    pub total_feed: f64,
    /// Sum of all plant product flows.
    pub total_product: f64,
    /// Product over feed, in percent. Zero for a plant with no feed.
    pub overall_recovery: f64,
}

/// The complete outcome of one converged solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceReport {
    /// Plant-wide totals.
    pub summary: PlantSummary,
    /// One row per unit, ascending by unit id.
    pub units: Vec<UnitBalance>,
    /// One row per stream, ascending by stream id.
    pub streams: Vec<StreamRecord>,
    /// Number of balance passes the solve took.
    pub passes: usize,
}

/// Builds the report from the solver's converged value map.
///
/// `removed` carries the water each unit discharged outside the stream
/// network, keyed by unit id.
pub(crate) fn aggregate(
    graph: &FlowsheetGraph,
    values: &BTreeMap<StreamId, StreamState>,
    removed: &BTreeMap<UnitId, f64>,
    passes: usize,
) -> BalanceReport {
    let mut units = Vec::with_capacity(graph.unit_count());
    for unit in graph.units() {
        let input_total: f64 = unit
            .inputs()
            .iter()
            .filter_map(|id| values.get(id))
            .map(|s| s.flow_rate)
            .sum();
        let output_total: f64 = unit
            .outputs()
            .iter()
            .filter_map(|id| values.get(id))
            .map(|s| s.flow_rate)
            .sum::<f64>()
            + removed.get(&unit.id).copied().unwrap_or(0.0);

        let error_pct = if input_total > 0.0 {
            (input_total - output_total).abs() / input_total * 100.0
        } else {
            0.0
        };
        units.push(UnitBalance {
            unit: unit.id,
            label: unit.label(),
            input_total,
            output_total,
            error_pct,
            status: BalanceStatus::from_error_pct(error_pct),
        });
    }

    let mut streams = Vec::with_capacity(graph.stream_count());
    let mut total_feed = 0.0;
    let mut total_product = 0.0;
    for stream in graph.streams() {
        let state = values.get(&stream.id).unwrap_or(&stream.state);
        if stream.is_feed() {
            total_feed += state.flow_rate;
        }
        if stream.is_product() {
            total_product += state.flow_rate;
        }
        streams.push(StreamRecord {
            stream: stream.id,
            from: stream.from(),
            to: stream.to(),
            flow_rate: state.flow_rate,
            composition: state.composition.clone(),
            moisture: state.moisture,
        });
    }

    let overall_recovery = if total_feed > 0.0 {
        total_product / total_feed * 100.0
    } else {
        0.0
    };

    BalanceReport {
        summary: PlantSummary { total_feed, total_product, overall_recovery },
        units,
        streams,
        passes,
    }
}
