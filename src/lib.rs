//! # Oreflow: Steady-State Mass Balance for Mineral Processing Flowsheets
//!
//! A library for laying out a mineral-processing plant as a network of unit
//! operations (crushers, mills, screens, cyclones, flotation cells,
//! thickeners, filters, dryers) joined by material streams, and computing a
//! self-consistent steady-state mass balance for the whole network: flow
//! rate, solids composition, and moisture of every stream, including streams
//! that form recycle loops.
//!
//! The engine follows the classic sequential-modular approach used in
//! flowsheet simulation:
//!
//! 1. The [`FlowsheetGraph`] owns units and streams and keeps the topology
//!    internally consistent.
//! 2. The topology analyzer partitions the unit graph into an acyclic
//!    evaluation sequence plus recycle groups, and designates a tear stream
//!    per cycle.
//! 3. The [`BalanceSolver`] executes the plan, substituting estimates for
//!    tear streams and iterating until the estimates and the computed values
//!    agree.
//! 4. The converged stream states are validated for conservation and
//!    collected into a [`BalanceReport`].
//!
//! ## Example
//!
//! ```
//! use oreflow::{BalanceSolver, Composition, FlowsheetGraph, StreamState, UnitType};
//!
//! let mut graph = FlowsheetGraph::new();
//! let crusher = graph
//!     .add_unit(UnitType::JawCrusher, UnitType::JawCrusher.default_parameters())
//!     .unwrap();
//! let cyclone = graph
//!     .add_unit(UnitType::Hydrocyclone, UnitType::Hydrocyclone.default_parameters())
//!     .unwrap();
//!
//! let feed = StreamState::new(
//!     450.0,
//!     Composition::from([("Fe".to_string(), 0.35), ("SiO2".to_string(), 0.65)]),
//!     0.085,
//! );
//!
//! graph.add_stream(None, Some(crusher), feed.clone()).unwrap();
//! graph.add_stream(Some(crusher), Some(cyclone), feed.zero_like()).unwrap();
//! // First outlet added is the primary output (cyclone overflow).
//! graph.add_stream(Some(cyclone), None, feed.zero_like()).unwrap();
//! graph.add_stream(Some(cyclone), None, feed.zero_like()).unwrap();
//!
//! let mut solver = BalanceSolver::new();
//! let report = solver.solve(&graph).unwrap();
//!
//! assert_eq!(report.units.len(), 2);
//! assert!(report.units.iter().all(|u| u.status == oreflow::BalanceStatus::Balanced));
//! ```
//!
//! ## Scope
//!
//! The crate is the computational core only. Layout editing, rendering,
//! persistence, and report export are external concerns that drive the graph
//! through its mutators and consume the report as a flat table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod graph;
pub mod models;
pub mod report;
pub mod solver;
pub mod topology;

pub use graph::{FlowsheetGraph, Stream, StreamUpdate, Unit};
pub use models::{UnitFamily, UnitOutputs, UnitParams, UnitType};
pub use report::{BalanceReport, BalanceStatus, PlantSummary, StreamRecord, UnitBalance};
pub use solver::{BalanceSolver, CancelFlag, SolverConfig, SolverState};
pub use topology::{EvaluationPlan, PlanStep, RecycleGroup};

/// Tolerance on the sum of composition mass fractions.
pub const COMPOSITION_TOLERANCE: f64 = 1e-6;

/// Relative tolerance for the internal conservation assertions of the unit
/// transfer model. A violation is a programming defect, never a runtime
/// condition.
pub(crate) const CONSERVATION_TOLERANCE: f64 = 1e-9;

/// Unique identifier for a unit operation in a flowsheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub usize);

impl UnitId {
    /// Gets the index value.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "U{}", self.0)
    }
}

/// Unique identifier for a stream in a flowsheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub usize);

impl StreamId {
    /// Gets the index value.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Solids composition: mass fraction per component, on a dry-solids basis.
///
/// Fractions must sum to 1 within [`COMPOSITION_TOLERANCE`]. A `BTreeMap`
/// keeps component iteration order deterministic so that solving the same
/// graph twice yields identical reports.
pub type Composition = BTreeMap<String, f64>;

/// The material state carried by a stream: total wet mass flow, solids
/// composition, and moisture.
///
/// `flow_rate` is the total mass flow including moisture (t/h in the common
/// convention). `moisture` is the water fraction of the total flow, so the
/// dry-solids flow is `flow_rate * (1 - moisture)`.
///
/// # Examples
///
/// ```
/// use oreflow::{Composition, StreamState};
///
/// let feed = StreamState::new(
///     450.0,
///     Composition::from([("Fe".to_string(), 0.35), ("SiO2".to_string(), 0.65)]),
///     0.085,
/// );
///
/// assert!((feed.solids_flow() - 411.75).abs() < 1e-9);
/// assert!((feed.water_flow() - 38.25).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    /// Total wet mass flow rate (solids + moisture).
    pub flow_rate: f64,
    /// Mass fraction per solid component.
    pub composition: Composition,
    /// Water fraction of the total flow, in `[0, 1]`.
    pub moisture: f64,
}

impl StreamState {
    /// Creates a new stream state.
    pub fn new(flow_rate: f64, composition: Composition, moisture: f64) -> Self {
        StreamState { flow_rate, composition, moisture }
    }

    /// Returns a zero-flow state with the same composition and moisture.
    ///
    /// Useful as the initial value of streams whose contents the solver will
    /// compute.
    pub fn zero_like(&self) -> Self {
        StreamState {
            flow_rate: 0.0,
            composition: self.composition.clone(),
            moisture: self.moisture,
        }
    }

    /// Dry-solids mass flow.
    pub fn solids_flow(&self) -> f64 {
        self.flow_rate * (1.0 - self.moisture)
    }

    /// Water mass flow.
    pub fn water_flow(&self) -> f64 {
        self.flow_rate * self.moisture
    }

    /// Mass flow of one solid component; zero for unknown components.
    pub fn component_flow(&self, component: &str) -> f64 {
        self.solids_flow() * self.composition.get(component).copied().unwrap_or(0.0)
    }

    /// Checks that the state is physically meaningful: non-negative finite
    /// flow, moisture in `[0, 1]`, and non-negative fractions summing to 1
    /// within [`COMPOSITION_TOLERANCE`].
    pub fn validate(&self) -> Result<(), GraphError> {
        if !self.flow_rate.is_finite() || self.flow_rate < 0.0 {
            return Err(GraphError::InvalidParameter {
                name: "flow_rate".to_string(),
                reason: format!("must be a non-negative finite number, got {}", self.flow_rate),
            });
        }
        if !self.moisture.is_finite() || !(0.0..=1.0).contains(&self.moisture) {
            return Err(GraphError::InvalidParameter {
                name: "moisture".to_string(),
                reason: format!("must lie in [0, 1], got {}", self.moisture),
            });
        }
        if self.composition.is_empty() {
            return Err(GraphError::InvalidParameter {
                name: "composition".to_string(),
                reason: "at least one component is required".to_string(),
            });
        }
        let mut sum = 0.0;
        for (component, fraction) in &self.composition {
            if !fraction.is_finite() || *fraction < 0.0 {
                return Err(GraphError::InvalidParameter {
                    name: format!("composition.{component}"),
                    reason: format!("mass fraction must be non-negative, got {fraction}"),
                });
            }
            sum += fraction;
        }
        if (sum - 1.0).abs() > COMPOSITION_TOLERANCE {
            return Err(GraphError::InvalidParameter {
                name: "composition".to_string(),
                reason: format!("mass fractions must sum to 1, got {sum}"),
            });
        }
        Ok(())
    }
}

/// Errors raised by graph mutation and parameter validation.
///
/// Every mutator fails atomically: when one of these errors is returned, the
/// graph is exactly as it was before the call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// A unit or stream id does not exist in the graph.
    #[error("unknown {kind} id {id}")]
    InvalidReference {
        /// `"unit"` or `"stream"`.
        kind: &'static str,
        /// The offending id value.
        id: usize,
    },
    /// Attaching another stream would exceed the unit's fixed port arity,
    /// or the attached count does not match the declared arity at solve time.
    #[error("unit {unit} ({unit_type}) allows {limit} {direction} stream(s), found {found}")]
    ArityViolation {
        /// Offending unit id value.
        unit: usize,
        /// Display label of the unit type.
        unit_type: &'static str,
        /// `"inlet"` or `"outlet"`.
        direction: &'static str,
        /// The arity limit for this port direction.
        limit: usize,
        /// The number of streams that would be attached.
        found: usize,
    },
    /// A unit parameter or stream field is missing or outside its valid range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// Parameter or field name.
        name: String,
        /// Human-readable reason.
        reason: String,
    },
}

/// Errors and non-converged outcomes of a balance solve.
#[derive(Debug, Error)]
pub enum SolveError {
    /// The graph failed validation during planning, or a unit rejected its
    /// parameters during evaluation.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// A recycle group had no usable tear stream. Unreachable for any graph
    /// whose cycles are formed by streams; kept as a defensive check.
    #[error("recycle group {units:?} has no usable tear stream")]
    UnresolvableCycle {
        /// Units forming the offending group.
        units: Vec<UnitId>,
    },
    /// The pass cap was reached before the tear streams settled. A normal,
    /// user-visible outcome: the caller may relax tolerances or flag the
    /// flowsheet for review.
    #[error("failed to converge after {passes} passes (worst tear residual {residual:.3e})")]
    Diverged {
        /// Number of passes executed.
        passes: usize,
        /// Worst relative flow change across tear streams in the last pass.
        residual: f64,
    },
    /// The solve was cancelled between passes. No partial results survive.
    #[error("solve cancelled")]
    Cancelled,
}
