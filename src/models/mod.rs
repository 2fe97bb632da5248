//! Unit transfer models for mineral-processing unit operations.
//!
//! Every unit type maps its mixed inlet state to one or two outlet states
//! through a pure, deterministic transfer function:
//!
//! - **Transformation units** (crushers, mills, thickener, filters, dryer)
//!   produce a single outlet. Crushers and mills pass material through
//!   unchanged; dewatering units and the dryer remove part of the liquid
//!   phase while conserving every solid component.
//! - **Separative units** (screen, cyclone, classifier, flotation cell, jig,
//!   magnetic separator, centrifuge) produce exactly two outlets. Each
//!   component reports to the primary outlet with an independent recovery
//!   fraction; water follows the solids split.
//!
//! Unit types form a closed enumeration, so dispatch is an exhaustive
//! `match` rather than a runtime lookup table. Parameters are validated both
//! when a unit is created or edited and again before evaluation; `evaluate`
//! never fails on stream content.
//!
//! # Example
//!
//! ```
//! use oreflow::{Composition, StreamState, UnitType};
//!
//! let feed = StreamState::new(
//!     100.0,
//!     Composition::from([("Fe".to_string(), 0.4), ("SiO2".to_string(), 0.6)]),
//!     0.1,
//! );
//!
//! let params = UnitType::Hydrocyclone.default_parameters();
//! let outputs = UnitType::Hydrocyclone.evaluate(&[feed], &params).unwrap();
//!
//! assert_eq!(outputs.streams.len(), 2);
//! let total: f64 = outputs.streams.iter().map(|s| s.flow_rate).sum();
//! assert!((total - 100.0).abs() < 1e-9);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Composition, GraphError, StreamState};

mod separation;
mod transformation;

/// Parameter names interpreted as fractions in `[0, 1]`.
const FRACTIONAL_PARAMETERS: &[&str] =
    &["efficiency", "recovery", "target_moisture", "concentrate_grade", "immersion", "vacuum"];

/// Upper bound on inlet streams for transformation units. A transformation
/// unit with several inlets mixes them before applying its transfer
/// function, which is how recycle streams rejoin the circuit (e.g. cyclone
/// underflow returning to the mill feed).
const MAX_MIXED_INLETS: usize = 4;

/// The two behavioral families of unit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitFamily {
    /// Single outlet; conserves all solid component mass.
    Transformation,
    /// Two outlets; splits each component by a recovery fraction.
    Separative,
}

/// Closed enumeration of the supported unit operation types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum UnitType {
    JawCrusher,
    ConeCrusher,
    BallMill,
    RodMill,
    SagMill,
    VibratingScreen,
    Hydrocyclone,
    SpiralClassifier,
    FlotationCell,
    Jig,
    MagneticSeparator,
    Centrifuge,
    Thickener,
    FilterPress,
    VacuumFilter,
    Dryer,
}

impl UnitType {
    /// All unit types, in declaration order.
    pub const ALL: [UnitType; 16] = [
        UnitType::JawCrusher,
        UnitType::ConeCrusher,
        UnitType::BallMill,
        UnitType::RodMill,
        UnitType::SagMill,
        UnitType::VibratingScreen,
        UnitType::Hydrocyclone,
        UnitType::SpiralClassifier,
        UnitType::FlotationCell,
        UnitType::Jig,
        UnitType::MagneticSeparator,
        UnitType::Centrifuge,
        UnitType::Thickener,
        UnitType::FilterPress,
        UnitType::VacuumFilter,
        UnitType::Dryer,
    ];

    /// Which transfer-function family this type belongs to.
    pub fn family(self) -> UnitFamily {
        match self {
            UnitType::VibratingScreen
            | UnitType::Hydrocyclone
            | UnitType::SpiralClassifier
            | UnitType::FlotationCell
            | UnitType::Jig
            | UnitType::MagneticSeparator
            | UnitType::Centrifuge => UnitFamily::Separative,
            UnitType::JawCrusher
            | UnitType::ConeCrusher
            | UnitType::BallMill
            | UnitType::RodMill
            | UnitType::SagMill
            | UnitType::Thickener
            | UnitType::FilterPress
            | UnitType::VacuumFilter
            | UnitType::Dryer => UnitFamily::Transformation,
        }
    }

    /// Maximum number of inlet streams the type accepts.
    ///
    /// Separative units take exactly one inlet. Transformation units accept
    /// up to [`MAX_MIXED_INLETS`] and mix them ahead of the transfer
    /// function, so recycle streams can rejoin at a mill or crusher without a
    /// dedicated mixer unit.
    pub fn max_inlets(self) -> usize {
        match self.family() {
            UnitFamily::Transformation => MAX_MIXED_INLETS,
            UnitFamily::Separative => 1,
        }
    }

    /// Exact number of outlet streams the type produces.
    pub fn output_arity(self) -> usize {
        match self.family() {
            UnitFamily::Transformation => 1,
            UnitFamily::Separative => 2,
        }
    }

    /// Display label.
    pub fn label(self) -> &'static str {
        match self {
            UnitType::JawCrusher => "Jaw Crusher",
            UnitType::ConeCrusher => "Cone Crusher",
            UnitType::BallMill => "Ball Mill",
            UnitType::RodMill => "Rod Mill",
            UnitType::SagMill => "SAG Mill",
            UnitType::VibratingScreen => "Vibrating Screen",
            UnitType::Hydrocyclone => "Hydrocyclone",
            UnitType::SpiralClassifier => "Spiral Classifier",
            UnitType::FlotationCell => "Flotation Cell",
            UnitType::Jig => "Jig",
            UnitType::MagneticSeparator => "Magnetic Separator",
            UnitType::Centrifuge => "Centrifuge",
            UnitType::Thickener => "Thickener",
            UnitType::FilterPress => "Filter Press",
            UnitType::VacuumFilter => "Vacuum Filter",
            UnitType::Dryer => "Dryer",
        }
    }

    /// Names of the outlet ports, in declaration order. The first outlet of
    /// a separative unit is the primary (recovery-weighted) product.
    pub fn output_labels(self) -> &'static [&'static str] {
        match self {
            UnitType::VibratingScreen => &["undersize", "oversize"],
            UnitType::Hydrocyclone => &["overflow", "underflow"],
            UnitType::SpiralClassifier => &["overflow", "sands"],
            UnitType::FlotationCell => &["concentrate", "tailings"],
            UnitType::Jig | UnitType::MagneticSeparator | UnitType::Centrifuge => {
                &["concentrate", "rejects"]
            }
            _ => &["product"],
        }
    }

    /// Typical operating parameters for a freshly placed unit of this type.
    pub fn default_parameters(self) -> UnitParams {
        let pairs: &[(&str, f64)] = match self {
            UnitType::JawCrusher => {
                &[("reduction_ratio", 4.0), ("capacity", 100.0), ("efficiency", 0.85), ("power", 150.0)]
            }
            UnitType::ConeCrusher => {
                &[("reduction_ratio", 6.0), ("capacity", 150.0), ("efficiency", 0.88), ("power", 200.0)]
            }
            UnitType::BallMill => {
                &[("diameter", 3.0), ("length", 4.0), ("speed", 20.0), ("efficiency", 0.90), ("power", 250.0)]
            }
            UnitType::RodMill => {
                &[("diameter", 2.5), ("length", 3.5), ("speed", 15.0), ("efficiency", 0.85), ("power", 180.0)]
            }
            UnitType::SagMill => {
                &[("diameter", 8.0), ("length", 4.0), ("speed", 10.0), ("efficiency", 0.92), ("power", 500.0)]
            }
            UnitType::VibratingScreen => {
                &[("aperture", 10.0), ("efficiency", 0.85), ("capacity", 200.0)]
            }
            UnitType::Hydrocyclone => {
                &[("diameter", 0.5), ("pressure", 1.5), ("efficiency", 0.85)]
            }
            UnitType::SpiralClassifier => {
                &[("pitch", 0.3), ("immersion", 0.5), ("efficiency", 0.80)]
            }
            UnitType::FlotationCell => {
                &[("volume", 10.0), ("air_flow", 5.0), ("recovery", 0.85), ("concentrate_grade", 0.65)]
            }
            UnitType::Jig => &[("stroke", 20.0), ("frequency", 60.0), ("efficiency", 0.75)],
            UnitType::MagneticSeparator => &[("field_strength", 1.2), ("efficiency", 0.90)],
            UnitType::Centrifuge => {
                &[("speed", 3000.0), ("g_force", 2000.0), ("efficiency", 0.88)]
            }
            UnitType::Thickener => &[("diameter", 20.0), ("area", 314.0), ("efficiency", 0.95)],
            UnitType::FilterPress => &[("area", 50.0), ("pressure", 8.0), ("efficiency", 0.90)],
            UnitType::VacuumFilter => &[("area", 30.0), ("vacuum", 0.6), ("efficiency", 0.85)],
            UnitType::Dryer => &[
                ("temperature", 150.0),
                ("capacity", 25.0),
                ("efficiency", 0.88),
                ("target_moisture", 0.02),
            ],
        };
        let mut params = UnitParams::new();
        for (name, value) in pairs {
            params.values.insert((*name).to_string(), *value);
        }
        params
    }

    /// Parameter names that must be present for the transfer function.
    fn required_parameters(self) -> &'static [&'static str] {
        match self {
            UnitType::Thickener | UnitType::FilterPress | UnitType::VacuumFilter => {
                &["efficiency"]
            }
            UnitType::Dryer => &["target_moisture"],
            // Separative units accept either `recovery` or `efficiency`;
            // checked separately below.
            _ => &[],
        }
    }

    /// Validates a full parameter set for this unit type.
    ///
    /// Rejected at the mutation site, before any evaluation: missing required
    /// parameters, fractions outside `[0, 1]`, non-finite or negative
    /// values, reduction ratios below 1.
    pub fn validate_parameters(self, params: &UnitParams) -> Result<(), GraphError> {
        for (name, value) in &params.values {
            if !value.is_finite() || *value < 0.0 {
                return Err(GraphError::InvalidParameter {
                    name: name.clone(),
                    reason: format!("must be a non-negative finite number, got {value}"),
                });
            }
            if FRACTIONAL_PARAMETERS.contains(&name.as_str()) && *value > 1.0 {
                return Err(GraphError::InvalidParameter {
                    name: name.clone(),
                    reason: format!("must lie in [0, 1], got {value}"),
                });
            }
            if name == "reduction_ratio" && *value < 1.0 {
                return Err(GraphError::InvalidParameter {
                    name: name.clone(),
                    reason: format!("must be at least 1, got {value}"),
                });
            }
        }
        if self == UnitType::Dryer {
            if let Some(target) = params.get("target_moisture") {
                if target >= 1.0 {
                    return Err(GraphError::InvalidParameter {
                        name: "target_moisture".to_string(),
                        reason: format!("must lie in [0, 1), got {target}"),
                    });
                }
            }
        }
        for (component, recovery) in &params.component_recovery {
            if !recovery.is_finite() || !(0.0..=1.0).contains(recovery) {
                return Err(GraphError::InvalidParameter {
                    name: format!("component_recovery.{component}"),
                    reason: format!("must lie in [0, 1], got {recovery}"),
                });
            }
        }
        for name in self.required_parameters() {
            if params.get(name).is_none() {
                return Err(GraphError::InvalidParameter {
                    name: (*name).to_string(),
                    reason: format!("required for {}", self.label()),
                });
            }
        }
        if self.family() == UnitFamily::Separative && params.base_recovery().is_none() {
            return Err(GraphError::InvalidParameter {
                name: "recovery".to_string(),
                reason: format!("{} requires `recovery` or `efficiency`", self.label()),
            });
        }
        Ok(())
    }

    /// Applies the transfer function: mixed inlet state in, outlet states
    /// out.
    ///
    /// `inputs` are mixed into a single combined state first (transformation
    /// units may have several inlets). Pure and deterministic; fails only
    /// with [`GraphError::InvalidParameter`], never on stream content.
    pub fn evaluate(
        self,
        inputs: &[StreamState],
        params: &UnitParams,
    ) -> Result<UnitOutputs, GraphError> {
        self.validate_parameters(params)?;
        let combined = mix(inputs);
        match self.family() {
            UnitFamily::Transformation => transformation::evaluate(self, &combined, params),
            UnitFamily::Separative => separation::evaluate(self, &combined, params),
        }
    }
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Named numeric operating parameters of a unit, plus the optional
/// per-component recovery override for separative units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitParams {
    /// Scalar parameters by name (`efficiency`, `recovery`,
    /// `reduction_ratio`, ...).
    pub values: BTreeMap<String, f64>,
    /// Per-component recovery fractions overriding the scalar recovery.
    pub component_recovery: BTreeMap<String, f64>,
}

impl UnitParams {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        UnitParams::default()
    }

    /// Builder-style insertion of a scalar parameter.
    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    /// Builder-style insertion of a per-component recovery override.
    pub fn with_component_recovery(mut self, component: &str, recovery: f64) -> Self {
        self.component_recovery.insert(component.to_string(), recovery);
        self
    }

    /// Looks up a scalar parameter.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    /// Looks up a required scalar parameter.
    pub fn require(&self, name: &str) -> Result<f64, GraphError> {
        self.get(name).ok_or_else(|| GraphError::InvalidParameter {
            name: name.to_string(),
            reason: "required parameter is missing".to_string(),
        })
    }

    /// The scalar recovery fraction of a separative unit: `recovery` when
    /// present, otherwise `efficiency`.
    pub fn base_recovery(&self) -> Option<f64> {
        self.get("recovery").or_else(|| self.get("efficiency"))
    }

    /// Recovery to the primary outlet for one component.
    pub fn recovery_for(&self, component: &str, base: f64) -> f64 {
        self.component_recovery.get(component).copied().unwrap_or(base)
    }

    /// Merges another parameter set into this one, overwriting existing
    /// entries key by key.
    pub fn merge(&mut self, partial: &UnitParams) {
        for (name, value) in &partial.values {
            self.values.insert(name.clone(), *value);
        }
        for (component, recovery) in &partial.component_recovery {
            self.component_recovery.insert(component.clone(), *recovery);
        }
    }
}

/// The result of evaluating one unit: outlet stream states in port order,
/// plus liquid mass leaving through the unit's non-stream path (thickener
/// underflow water, filter cake moisture, dryer vapor).
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutputs {
    /// Outlet states, ordered as the unit's declared outlet ports.
    pub streams: Vec<StreamState>,
    /// Water mass flow removed from the process at this unit.
    pub water_removed: f64,
}

impl UnitOutputs {
    /// Total mass flow across outlets, excluding removed water.
    pub fn total_flow(&self) -> f64 {
        self.streams.iter().map(|s| s.flow_rate).sum()
    }
}

/// Mixes inlet streams into one combined state: flows add, component masses
/// add, moisture is recomputed from the combined water mass.
pub(crate) fn mix(inputs: &[StreamState]) -> StreamState {
    if inputs.len() == 1 {
        return inputs[0].clone();
    }

    let total_flow: f64 = inputs.iter().map(|s| s.flow_rate).sum();
    let total_water: f64 = inputs.iter().map(|s| s.water_flow()).sum();
    let total_solids = total_flow - total_water;

    let mut component_mass: BTreeMap<String, f64> = BTreeMap::new();
    for input in inputs {
        let solids = input.solids_flow();
        for (component, fraction) in &input.composition {
            *component_mass.entry(component.clone()).or_insert(0.0) += solids * fraction;
        }
    }

    let composition: Composition = if total_solids > 0.0 {
        component_mass.into_iter().map(|(c, m)| (c, m / total_solids)).collect()
    } else {
        // No solids anywhere: keep the first inlet's composition as a
        // placeholder so downstream units still see valid fractions.
        inputs.first().map(|s| s.composition.clone()).unwrap_or_default()
    };

    let moisture = if total_flow > 0.0 { total_water / total_flow } else { 0.0 };

    StreamState { flow_rate: total_flow, composition, moisture }
}
