use crate::pollutant::Pollutant;

pub const AVOGADRO: f64 = 6.022_140_76e23;
/// molecules/cm² → mol/m²: ×1e4 cm²/m², ÷ Avogadro.
pub const MOLECULES_PER_CM2_TO_MOL_PER_M2: f64 = 1e4 / AVOGADRO;

pub const MOL_PER_M2: &str = "mol/m²";
pub const MICROGRAMS_PER_M3: &str = "µg/m³";
pub const DOBSON_UNIT: &str = "DU";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    MoleculesPerCm2,
    MicrogramsPerM3,
    MilligramsPerM3,
    Dobson,
    Other,
}

fn classify(unit: &str) -> UnitKind {
    let compact: String = unit
        .trim()
        .to_lowercase()
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != '^')
        .map(|ch| match ch {
            'μ' => 'µ',
            '²' => '2',
            '³' => '3',
            other => other,
        })
        .collect();

    if compact.starts_with("molec") && compact.contains("cm") {
        return UnitKind::MoleculesPerCm2;
    }

    match compact.as_str() {
        "µg/m3" | "ug/m3" | "ugm-3" | "µgm-3" | "microgramspercubicmeter" => {
            UnitKind::MicrogramsPerM3
        }
        "mg/m3" | "mgm-3" => UnitKind::MilligramsPerM3,
        "du" | "dobson" | "dobsonunit" | "dobsonunits" => UnitKind::Dobson,
        _ => UnitKind::Other,
    }
}

/// Applies the fixed pollutant+unit conversions and canonicalizes unit labels.
pub fn convert(pollutant: &str, value: Option<f64>, unit: &str) -> (Option<f64>, String) {
    let known = Pollutant::from_alias(pollutant);

    match classify(unit) {
        UnitKind::MoleculesPerCm2 if known.is_some_and(Pollutant::is_column_gas) => (
            value.map(|raw| raw * MOLECULES_PER_CM2_TO_MOL_PER_M2),
            MOL_PER_M2.to_string(),
        ),
        UnitKind::MicrogramsPerM3 => (value, MICROGRAMS_PER_M3.to_string()),
        UnitKind::MilligramsPerM3 => (
            value.map(|raw| raw * 1_000.0),
            MICROGRAMS_PER_M3.to_string(),
        ),
        UnitKind::Dobson => (value, DOBSON_UNIT.to_string()),
        UnitKind::MoleculesPerCm2 | UnitKind::Other => (value, unit.trim().to_string()),
    }
}
