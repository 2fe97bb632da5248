//! The flowsheet graph: the single owned aggregate of units and streams.
//!
//! The graph is always internally consistent: no stream references a missing
//! unit, deleting a unit cascades to its attached streams, and every mutator
//! either succeeds completely or leaves the graph untouched. Stream
//! endpoints are immutable after creation: reconnecting means delete and
//! recreate, which keeps the topology from drifting silently mid-solve.
//!
//! During a solve the graph is only read; the solver computes stream values
//! into its own working map and never mutates the aggregate.
//!
//! # Example
//!
//! ```
//! use oreflow::{Composition, FlowsheetGraph, StreamState, UnitType};
//!
//! let mut graph = FlowsheetGraph::new();
//! let mill = graph
//!     .add_unit(UnitType::BallMill, UnitType::BallMill.default_parameters())
//!     .unwrap();
//!
//! let feed = StreamState::new(
//!     120.0,
//!     Composition::from([("Fe".to_string(), 1.0)]),
//!     0.05,
//! );
//! let inlet = graph.add_stream(None, Some(mill), feed).unwrap();
//!
//! assert_eq!(graph.unit(mill).unwrap().inputs(), &[inlet]);
//! graph.remove_unit(mill).unwrap();
//! assert_eq!(graph.stream_count(), 0);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Composition, GraphError, StreamId, StreamState, UnitId, UnitParams, UnitType};

/// A unit operation node: type, operating parameters, and the attached
/// streams in port order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Identity within the owning graph.
    pub id: UnitId,
    /// The unit operation type; fixes arity and the transfer function.
    pub kind: UnitType,
    /// Named operating parameters, validated against `kind`.
    pub params: UnitParams,
    inputs: Vec<StreamId>,
    outputs: Vec<StreamId>,
}

impl Unit {
    /// Inlet streams in the order they were attached.
    pub fn inputs(&self) -> &[StreamId] {
        &self.inputs
    }

    /// Outlet streams in the order they were attached. For separative units
    /// the first outlet is the primary product.
    pub fn outputs(&self) -> &[StreamId] {
        &self.outputs
    }

    /// Display label, e.g. `"Ball Mill #2"`.
    pub fn label(&self) -> String {
        format!("{} #{}", self.kind.label(), self.id.0)
    }
}

/// A directed material stream between two units, or across the plant
/// boundary.
///
/// `from = None` marks a plant feed whose state is user-declared;
/// `to = None` marks a product leaving the plant. Endpoints never change
/// after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    /// Identity within the owning graph.
    pub id: StreamId,
    from: Option<UnitId>,
    to: Option<UnitId>,
    /// Current material state: a feed's declared value, or the last
    /// computed/edited value for internal streams.
    pub state: StreamState,
}

impl Stream {
    /// Source unit; `None` for plant feeds.
    pub fn from(&self) -> Option<UnitId> {
        self.from
    }

    /// Destination unit; `None` for plant products.
    pub fn to(&self) -> Option<UnitId> {
        self.to
    }

    /// Whether this stream enters the plant from outside.
    pub fn is_feed(&self) -> bool {
        self.from.is_none()
    }

    /// Whether this stream leaves the plant.
    pub fn is_product(&self) -> bool {
        self.to.is_none()
    }
}

/// Partial update for a stream's material fields, applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdate {
    /// New total flow rate, if set.
    pub flow_rate: Option<f64>,
    /// New solids composition, if set.
    pub composition: Option<Composition>,
    /// New moisture fraction, if set.
    pub moisture: Option<f64>,
}

/// The set of all units and streams of one plant layout.
///
/// There is no process-wide singleton: callers own their graphs and pass
/// them to the solver by reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowsheetGraph {
    units: BTreeMap<UnitId, Unit>,
    streams: BTreeMap<StreamId, Stream>,
    next_unit_id: usize,
    next_stream_id: usize,
}

impl FlowsheetGraph {
    /// Creates an empty flowsheet.
    pub fn new() -> Self {
        FlowsheetGraph::default()
    }

    /// Adds a unit of the given type after validating its parameters.
    pub fn add_unit(&mut self, kind: UnitType, params: UnitParams) -> Result<UnitId, GraphError> {
        kind.validate_parameters(&params)?;
        let id = UnitId(self.next_unit_id);
        self.next_unit_id += 1;
        self.units.insert(
            id,
            Unit { id, kind, params, inputs: Vec::new(), outputs: Vec::new() },
        );
        Ok(id)
    }

    /// Adds a stream between two endpoints.
    ///
    /// Fails with `InvalidReference` if an endpoint id is unknown,
    /// `ArityViolation` if the stream would exceed either unit's fixed port
    /// arity, or `InvalidParameter` if the initial state is malformed. The
    /// graph is unchanged on failure.
    pub fn add_stream(
        &mut self,
        from: Option<UnitId>,
        to: Option<UnitId>,
        state: StreamState,
    ) -> Result<StreamId, GraphError> {
        state.validate()?;
        if let Some(source) = from {
            let unit = self.require_unit(source)?;
            let limit = unit.kind.output_arity();
            if unit.outputs.len() >= limit {
                return Err(GraphError::ArityViolation {
                    unit: source.0,
                    unit_type: unit.kind.label(),
                    direction: "outlet",
                    limit,
                    found: unit.outputs.len() + 1,
                });
            }
        }
        if let Some(dest) = to {
            let unit = self.require_unit(dest)?;
            let limit = unit.kind.max_inlets();
            if unit.inputs.len() >= limit {
                return Err(GraphError::ArityViolation {
                    unit: dest.0,
                    unit_type: unit.kind.label(),
                    direction: "inlet",
                    limit,
                    found: unit.inputs.len() + 1,
                });
            }
        }

        // All checks passed; now mutate.
        let id = StreamId(self.next_stream_id);
        self.next_stream_id += 1;
        if let Some(source) = from {
            if let Some(unit) = self.units.get_mut(&source) {
                unit.outputs.push(id);
            }
        }
        if let Some(dest) = to {
            if let Some(unit) = self.units.get_mut(&dest) {
                unit.inputs.push(id);
            }
        }
        self.streams.insert(id, Stream { id, from, to, state });
        Ok(id)
    }

    /// Removes a unit and, first, every stream attached to it.
    pub fn remove_unit(&mut self, id: UnitId) -> Result<(), GraphError> {
        self.require_unit(id)?;
        let attached: Vec<StreamId> = self
            .streams
            .values()
            .filter(|s| s.from == Some(id) || s.to == Some(id))
            .map(|s| s.id)
            .collect();
        for stream in attached {
            self.remove_stream(stream)?;
        }
        self.units.remove(&id);
        Ok(())
    }

    /// Removes a stream, detaching it from both endpoint units.
    pub fn remove_stream(&mut self, id: StreamId) -> Result<(), GraphError> {
        let stream = self
            .streams
            .remove(&id)
            .ok_or(GraphError::InvalidReference { kind: "stream", id: id.0 })?;
        if let Some(source) = stream.from {
            if let Some(unit) = self.units.get_mut(&source) {
                unit.outputs.retain(|s| *s != id);
            }
        }
        if let Some(dest) = stream.to {
            if let Some(unit) = self.units.get_mut(&dest) {
                unit.inputs.retain(|s| *s != id);
            }
        }
        Ok(())
    }

    /// Applies a partial update to a stream's material fields. The candidate
    /// state is validated as a whole before anything is stored.
    pub fn update_stream_fields(
        &mut self,
        id: StreamId,
        update: StreamUpdate,
    ) -> Result<(), GraphError> {
        let stream = self
            .streams
            .get(&id)
            .ok_or(GraphError::InvalidReference { kind: "stream", id: id.0 })?;

        let mut candidate = stream.state.clone();
        if let Some(flow) = update.flow_rate {
            candidate.flow_rate = flow;
        }
        if let Some(composition) = update.composition {
            candidate.composition = composition;
        }
        if let Some(moisture) = update.moisture {
            candidate.moisture = moisture;
        }
        candidate.validate()?;

        if let Some(stream) = self.streams.get_mut(&id) {
            stream.state = candidate;
        }
        Ok(())
    }

    /// Merges a partial parameter set into a unit's parameters. The merged
    /// result is validated against the unit type before it replaces the old
    /// set.
    pub fn update_unit_parameters(
        &mut self,
        id: UnitId,
        partial: &UnitParams,
    ) -> Result<(), GraphError> {
        let unit = self.require_unit(id)?;
        let mut merged = unit.params.clone();
        merged.merge(partial);
        unit.kind.validate_parameters(&merged)?;

        if let Some(unit) = self.units.get_mut(&id) {
            unit.params = merged;
        }
        Ok(())
    }

    /// All units in ascending id order.
    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    /// All streams in ascending id order.
    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    /// Looks up one unit.
    pub fn unit(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(&id)
    }

    /// Looks up one stream.
    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// Streams entering the given unit, in port order.
    pub fn inlet_streams(&self, unit: UnitId) -> Vec<&Stream> {
        self.units
            .get(&unit)
            .map(|u| u.inputs.iter().filter_map(|s| self.streams.get(s)).collect())
            .unwrap_or_default()
    }

    /// Streams leaving the given unit, in port order.
    pub fn outlet_streams(&self, unit: UnitId) -> Vec<&Stream> {
        self.units
            .get(&unit)
            .map(|u| u.outputs.iter().filter_map(|s| self.streams.get(s)).collect())
            .unwrap_or_default()
    }

    /// Plant feed streams (no source unit), in ascending id order.
    pub fn feed_streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values().filter(|s| s.is_feed())
    }

    /// Plant product streams (no destination unit), in ascending id order.
    pub fn product_streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values().filter(|s| s.is_product())
    }

    /// Number of units.
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Number of streams.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Checks that the graph is ready to solve: parameters valid, every
    /// unit's inlet count within `1..=max_inlets`, and its outlet count
    /// exactly the declared output arity.
    ///
    /// Mutators only prevent arity excess; completeness (every port
    /// connected) is required at solve time.
    pub fn validate(&self) -> Result<(), GraphError> {
        for unit in self.units.values() {
            unit.kind.validate_parameters(&unit.params)?;
            if unit.inputs.is_empty() || unit.inputs.len() > unit.kind.max_inlets() {
                return Err(GraphError::ArityViolation {
                    unit: unit.id.0,
                    unit_type: unit.kind.label(),
                    direction: "inlet",
                    limit: unit.kind.max_inlets(),
                    found: unit.inputs.len(),
                });
            }
            if unit.outputs.len() != unit.kind.output_arity() {
                return Err(GraphError::ArityViolation {
                    unit: unit.id.0,
                    unit_type: unit.kind.label(),
                    direction: "outlet",
                    limit: unit.kind.output_arity(),
                    found: unit.outputs.len(),
                });
            }
        }
        for stream in self.streams.values() {
            for endpoint in [stream.from, stream.to].into_iter().flatten() {
                if !self.units.contains_key(&endpoint) {
                    return Err(GraphError::InvalidReference {
                        kind: "unit",
                        id: endpoint.0,
                    });
                }
            }
            stream.state.validate()?;
        }
        Ok(())
    }

    fn require_unit(&self, id: UnitId) -> Result<&Unit, GraphError> {
        self.units.get(&id).ok_or(GraphError::InvalidReference { kind: "unit", id: id.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_state() -> StreamState {
        StreamState::new(
            450.0,
            Composition::from([("Fe".to_string(), 0.35), ("SiO2".to_string(), 0.65)]),
            0.085,
        )
    }

    fn mill_graph() -> (FlowsheetGraph, UnitId) {
        let mut graph = FlowsheetGraph::new();
        let mill = graph
            .add_unit(UnitType::BallMill, UnitType::BallMill.default_parameters())
            .unwrap();
        (graph, mill)
    }

    #[test]
    fn add_unit_validates_parameters() {
        let mut graph = FlowsheetGraph::new();
        let bad = UnitType::FlotationCell.default_parameters().with("recovery", 1.2);
        let err = graph.add_unit(UnitType::FlotationCell, bad).unwrap_err();
        assert!(matches!(err, GraphError::InvalidParameter { .. }));
        assert_eq!(graph.unit_count(), 0);
    }

    #[test]
    fn dangling_reference_rejected_without_mutation() {
        let (mut graph, mill) = mill_graph();
        graph.remove_unit(mill).unwrap();

        let err = graph.add_stream(Some(mill), None, feed_state()).unwrap_err();
        assert_eq!(err, GraphError::InvalidReference { kind: "unit", id: mill.0 });
        assert_eq!(graph.stream_count(), 0);
    }

    #[test]
    fn outlet_arity_enforced_atomically() {
        let (mut graph, mill) = mill_graph();
        graph.add_stream(Some(mill), None, feed_state()).unwrap();

        let before = graph.clone();
        let err = graph.add_stream(Some(mill), None, feed_state()).unwrap_err();
        assert!(matches!(err, GraphError::ArityViolation { direction: "outlet", .. }));
        assert_eq!(graph, before);
    }

    #[test]
    fn separative_units_take_one_inlet() {
        let mut graph = FlowsheetGraph::new();
        let cyclone = graph
            .add_unit(UnitType::Hydrocyclone, UnitType::Hydrocyclone.default_parameters())
            .unwrap();
        graph.add_stream(None, Some(cyclone), feed_state()).unwrap();

        let err = graph.add_stream(None, Some(cyclone), feed_state()).unwrap_err();
        assert!(matches!(err, GraphError::ArityViolation { direction: "inlet", .. }));
    }

    #[test]
    fn transformation_units_mix_multiple_inlets() {
        let (mut graph, mill) = mill_graph();
        graph.add_stream(None, Some(mill), feed_state()).unwrap();
        graph.add_stream(None, Some(mill), feed_state()).unwrap();
        assert_eq!(graph.unit(mill).unwrap().inputs().len(), 2);
    }

    #[test]
    fn remove_unit_cascades_to_streams() {
        let (mut graph, mill) = mill_graph();
        let cyclone = graph
            .add_unit(UnitType::Hydrocyclone, UnitType::Hydrocyclone.default_parameters())
            .unwrap();
        graph.add_stream(None, Some(mill), feed_state()).unwrap();
        let link = graph.add_stream(Some(mill), Some(cyclone), feed_state()).unwrap();

        graph.remove_unit(mill).unwrap();
        assert_eq!(graph.unit_count(), 1);
        assert_eq!(graph.stream_count(), 0);
        // The surviving unit no longer references the deleted stream.
        assert!(graph.unit(cyclone).unwrap().inputs().is_empty());
        assert!(graph.stream(link).is_none());
    }

    #[test]
    fn update_stream_fields_is_partial_and_atomic() {
        let (mut graph, mill) = mill_graph();
        let stream = graph.add_stream(None, Some(mill), feed_state()).unwrap();

        graph
            .update_stream_fields(
                stream,
                StreamUpdate { flow_rate: Some(500.0), ..Default::default() },
            )
            .unwrap();
        let state = &graph.stream(stream).unwrap().state;
        assert_eq!(state.flow_rate, 500.0);
        assert_eq!(state.moisture, 0.085);

        // An invalid moisture leaves everything untouched.
        let err = graph
            .update_stream_fields(
                stream,
                StreamUpdate { moisture: Some(2.0), flow_rate: Some(1.0), ..Default::default() },
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidParameter { .. }));
        assert_eq!(graph.stream(stream).unwrap().state.flow_rate, 500.0);
    }

    #[test]
    fn update_unit_parameters_merges_and_validates() {
        let (mut graph, mill) = mill_graph();
        graph
            .update_unit_parameters(mill, &UnitParams::new().with("efficiency", 0.7))
            .unwrap();
        assert_eq!(graph.unit(mill).unwrap().params.get("efficiency"), Some(0.7));
        assert_eq!(graph.unit(mill).unwrap().params.get("diameter"), Some(3.0));

        let err = graph
            .update_unit_parameters(mill, &UnitParams::new().with("efficiency", 1.5))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidParameter { .. }));
        assert_eq!(graph.unit(mill).unwrap().params.get("efficiency"), Some(0.7));
    }

    #[test]
    fn validate_requires_complete_ports() {
        let (mut graph, mill) = mill_graph();
        graph.add_stream(None, Some(mill), feed_state()).unwrap();
        // No outlet yet.
        assert!(matches!(
            graph.validate(),
            Err(GraphError::ArityViolation { direction: "outlet", .. })
        ));

        graph.add_stream(Some(mill), None, feed_state().zero_like()).unwrap();
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn incident_stream_queries_split_by_direction() {
        let (mut graph, mill) = mill_graph();
        let inlet = graph.add_stream(None, Some(mill), feed_state()).unwrap();
        let outlet = graph.add_stream(Some(mill), None, feed_state().zero_like()).unwrap();

        let inlets: Vec<StreamId> = graph.inlet_streams(mill).iter().map(|s| s.id).collect();
        let outlets: Vec<StreamId> = graph.outlet_streams(mill).iter().map(|s| s.id).collect();
        assert_eq!(inlets, vec![inlet]);
        assert_eq!(outlets, vec![outlet]);

        assert_eq!(graph.feed_streams().count(), 1);
        assert_eq!(graph.product_streams().count(), 1);
    }
}
