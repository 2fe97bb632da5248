//! Transfer functions for two-outlet (separative) units.
//!
//! Each solid component reports to the primary outlet with an independent
//! recovery fraction: the unit's scalar `recovery` (or `efficiency`), unless
//! a per-component override is configured. The secondary outlet receives the
//! complement. Water splits between the outlets in proportion to the solids
//! split, and both outlet compositions are renormalized over their own
//! solids. Conservation of total and per-component mass is exact by
//! construction and asserted.

use std::collections::BTreeMap;

use crate::{Composition, GraphError, StreamState, UnitOutputs, UnitParams, UnitType,
            CONSERVATION_TOLERANCE};

pub(crate) fn evaluate(
    kind: UnitType,
    input: &StreamState,
    params: &UnitParams,
) -> Result<UnitOutputs, GraphError> {
    let base = params.base_recovery().ok_or_else(|| GraphError::InvalidParameter {
        name: "recovery".to_string(),
        reason: format!("{} requires `recovery` or `efficiency`", kind.label()),
    })?;

    let solids_in = input.solids_flow();
    let water_in = input.water_flow();

    let mut primary_mass: BTreeMap<String, f64> = BTreeMap::new();
    let mut secondary_mass: BTreeMap<String, f64> = BTreeMap::new();
    let mut primary_solids = 0.0;
    for (component, fraction) in &input.composition {
        let mass = solids_in * fraction;
        let recovered = mass * params.recovery_for(component, base);
        primary_solids += recovered;
        primary_mass.insert(component.clone(), recovered);
        secondary_mass.insert(component.clone(), mass - recovered);
    }
    let secondary_solids = solids_in - primary_solids;

    // Liquid phase follows the solids split; for an all-water stream fall
    // back to the scalar recovery.
    let primary_share = if solids_in > 0.0 { primary_solids / solids_in } else { base };
    let primary_water = water_in * primary_share;
    let secondary_water = water_in - primary_water;

    let primary = outlet(input, primary_mass, primary_solids, primary_water);
    let secondary = outlet(input, secondary_mass, secondary_solids, secondary_water);

    check_conservation(kind, input, &primary, &secondary);

    Ok(UnitOutputs { streams: vec![primary, secondary], water_removed: 0.0 })
}

fn outlet(
    input: &StreamState,
    component_mass: BTreeMap<String, f64>,
    solids: f64,
    water: f64,
) -> StreamState {
    let composition: Composition = if solids > 0.0 {
        component_mass.into_iter().map(|(c, m)| (c, m / solids)).collect()
    } else {
        input.composition.clone()
    };
    let flow = solids + water;
    let moisture = if flow > 0.0 { water / flow } else { 0.0 };
    StreamState { flow_rate: flow, composition, moisture }
}

/// Total and per-component conservation at 1e-9 relative. Any violation is a
/// logic defect in the split above, so it aborts rather than propagating as
/// a user error.
fn check_conservation(
    kind: UnitType,
    input: &StreamState,
    primary: &StreamState,
    secondary: &StreamState,
) {
    let scale = input.flow_rate.max(1.0);
    let total = primary.flow_rate + secondary.flow_rate - input.flow_rate;
    assert!(
        total.abs() <= CONSERVATION_TOLERANCE * scale,
        "{} violated total mass conservation by {total}",
        kind.label()
    );
    for component in input.composition.keys() {
        let gap = primary.component_flow(component) + secondary.component_flow(component)
            - input.component_flow(component);
        assert!(
            gap.abs() <= CONSERVATION_TOLERANCE * scale,
            "{} violated conservation of `{component}` by {gap}",
            kind.label()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn slurry(flow: f64) -> StreamState {
        StreamState::new(
            flow,
            Composition::from([("Fe".to_string(), 0.4), ("SiO2".to_string(), 0.6)]),
            0.2,
        )
    }

    #[test]
    fn scalar_recovery_splits_every_component_alike() {
        let input = slurry(100.0);
        let params = UnitParams::new().with("recovery", 0.85);
        let out = evaluate(UnitType::Hydrocyclone, &input, &params).unwrap();

        let primary = &out.streams[0];
        let secondary = &out.streams[1];

        assert_relative_eq!(primary.solids_flow(), 68.0, max_relative = 1e-12);
        assert_relative_eq!(secondary.solids_flow(), 12.0, max_relative = 1e-12);
        // Uniform recovery leaves the grades unchanged.
        assert_relative_eq!(primary.composition["Fe"], 0.4, max_relative = 1e-12);
        assert_relative_eq!(secondary.composition["Fe"], 0.4, max_relative = 1e-12);
        // Water follows the solids split.
        assert_relative_eq!(primary.water_flow(), 17.0, max_relative = 1e-12);
        assert_relative_eq!(secondary.water_flow(), 3.0, max_relative = 1e-12);
        assert_relative_eq!(
            primary.flow_rate + secondary.flow_rate,
            input.flow_rate,
            max_relative = 1e-12
        );
    }

    #[test]
    fn per_component_override_upgrades_primary() {
        let input = slurry(100.0);
        let params = UnitParams::new()
            .with("recovery", 0.2)
            .with_component_recovery("Fe", 0.95);
        let out = evaluate(UnitType::FlotationCell, &input, &params).unwrap();

        let concentrate = &out.streams[0];
        let tailings = &out.streams[1];

        // 80 t/h solids: Fe 32 * 0.95 = 30.4, SiO2 48 * 0.2 = 9.6.
        assert_relative_eq!(concentrate.solids_flow(), 40.0, max_relative = 1e-12);
        assert_relative_eq!(concentrate.composition["Fe"], 0.76, max_relative = 1e-12);
        assert_relative_eq!(
            tailings.component_flow("Fe"),
            32.0 - 30.4,
            max_relative = 1e-9
        );
        let sum: f64 = concentrate.composition.values().sum();
        assert_relative_eq!(sum, 1.0, max_relative = 1e-12);
    }

    #[test]
    fn recovery_of_one_sends_everything_to_primary() {
        let input = slurry(100.0);
        let params = UnitParams::new().with("recovery", 1.0);
        let out = evaluate(UnitType::MagneticSeparator, &input, &params).unwrap();
        assert_relative_eq!(out.streams[0].flow_rate, 100.0, max_relative = 1e-12);
        assert_eq!(out.streams[1].flow_rate, 0.0);
        // A zero-mass outlet keeps the inlet composition as a placeholder.
        assert_eq!(out.streams[1].composition, input.composition);
    }

    #[test]
    fn zero_flow_input_yields_zero_outputs() {
        let input = slurry(0.0);
        let params = UnitParams::new().with("efficiency", 0.85);
        let out = evaluate(UnitType::VibratingScreen, &input, &params).unwrap();
        assert_eq!(out.streams[0].flow_rate, 0.0);
        assert_eq!(out.streams[1].flow_rate, 0.0);
    }

    #[test]
    fn missing_recovery_is_invalid_parameter() {
        let err = evaluate(UnitType::Jig, &slurry(10.0), &UnitParams::new()).unwrap_err();
        assert!(matches!(err, GraphError::InvalidParameter { .. }));
    }
}
