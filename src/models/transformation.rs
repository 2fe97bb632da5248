//! Transfer functions for single-outlet (transformation) units.
//!
//! Crushers and mills change particle size, not mass: their outlet equals
//! their mixed inlet. Thickener, filter press, and vacuum filter remove a
//! fraction of the liquid phase set by `efficiency`; the dryer removes just
//! enough water to reach `target_moisture`. All of them conserve every solid
//! component exactly; the removed water is reported separately so the node
//! balance still closes.

use crate::{GraphError, StreamState, UnitOutputs, UnitParams, UnitType, CONSERVATION_TOLERANCE};

pub(crate) fn evaluate(
    kind: UnitType,
    input: &StreamState,
    params: &UnitParams,
) -> Result<UnitOutputs, GraphError> {
    let (output, water_removed) = match kind {
        UnitType::JawCrusher
        | UnitType::ConeCrusher
        | UnitType::BallMill
        | UnitType::RodMill
        | UnitType::SagMill => (input.clone(), 0.0),
        UnitType::Thickener | UnitType::FilterPress | UnitType::VacuumFilter => {
            dewater(input, params.require("efficiency")?)
        }
        UnitType::Dryer => dry(input, params.require("target_moisture")?),
        _ => unreachable!("separative unit routed to transformation family"),
    };

    let balance = output.flow_rate + water_removed - input.flow_rate;
    assert!(
        balance.abs() <= CONSERVATION_TOLERANCE * input.flow_rate.max(1.0),
        "transformation unit violated mass conservation by {balance}"
    );

    Ok(UnitOutputs { streams: vec![output], water_removed })
}

/// Removes `efficiency` of the liquid phase; solids untouched.
fn dewater(input: &StreamState, efficiency: f64) -> (StreamState, f64) {
    let water = input.water_flow();
    let removed = water * efficiency;
    with_water(input, water - removed, removed)
}

/// Removes `min(input water, required reduction)` to reach the target
/// moisture fraction. A stream already drier than the target passes through
/// unchanged.
fn dry(input: &StreamState, target_moisture: f64) -> (StreamState, f64) {
    let water = input.water_flow();
    let solids = input.solids_flow();
    // Water that may remain while holding the target moisture fraction,
    // for target < 1: w / (s + w) = t  =>  w = s * t / (1 - t).
    let water_at_target = solids * target_moisture / (1.0 - target_moisture);
    let removed = (water - water_at_target).max(0.0).min(water);
    with_water(input, water - removed, removed)
}

fn with_water(input: &StreamState, remaining_water: f64, removed: f64) -> (StreamState, f64) {
    let flow = input.solids_flow() + remaining_water;
    let moisture = if flow > 0.0 { remaining_water / flow } else { 0.0 };
    (
        StreamState {
            flow_rate: flow,
            composition: input.composition.clone(),
            moisture,
        },
        removed,
    )
}
