//! Canonical pollutant identifiers and the alias table that maps them to and
//! from each upstream vocabulary.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pollutant {
    Pm25,
    Pm10,
    No2,
    O3,
    So2,
    Co,
    Hcho,
}

/// Upstream vocabularies with their own naming for pollutants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vocabulary {
    OpenAq,
    OpenMeteo,
    Tempo,
}

pub const ALL_POLLUTANTS: [Pollutant; 7] = [
    Pollutant::Pm25,
    Pollutant::Pm10,
    Pollutant::No2,
    Pollutant::O3,
    Pollutant::So2,
    Pollutant::Co,
    Pollutant::Hcho,
];

impl Pollutant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pm25 => "pm25",
            Self::Pm10 => "pm10",
            Self::No2 => "no2",
            Self::O3 => "o3",
            Self::So2 => "so2",
            Self::Co => "co",
            Self::Hcho => "hcho",
        }
    }

    pub fn upstream_name(self, vocabulary: Vocabulary) -> Option<&'static str> {
        match (vocabulary, self) {
            (Vocabulary::OpenAq, Self::Hcho) => None,
            (Vocabulary::OpenAq, other) => Some(other.as_str()),
            (Vocabulary::OpenMeteo, Self::Pm25) => Some("pm2_5"),
            (Vocabulary::OpenMeteo, Self::Pm10) => Some("pm10"),
            (Vocabulary::OpenMeteo, Self::No2) => Some("nitrogen_dioxide"),
            (Vocabulary::OpenMeteo, Self::O3) => Some("ozone"),
            (Vocabulary::OpenMeteo, Self::So2) => Some("sulphur_dioxide"),
            (Vocabulary::OpenMeteo, Self::Co) => Some("carbon_monoxide"),
            (Vocabulary::OpenMeteo, Self::Hcho) => Some("formaldehyde"),
            (Vocabulary::Tempo, Self::No2) => Some("nitrogendioxide_tropospheric_column"),
            (Vocabulary::Tempo, Self::So2) => Some("sulfurdioxide_total_column"),
            (Vocabulary::Tempo, Self::O3) => Some("ozone_total_column"),
            (Vocabulary::Tempo, Self::Hcho) => Some("formaldehyde_tropospheric_column"),
            (Vocabulary::Tempo, _) => None,
        }
    }

    /// Column pollutants reported by satellites in molecules/cm².
    pub fn is_column_gas(self) -> bool {
        matches!(self, Self::No2 | Self::So2 | Self::Hcho)
    }

    pub fn from_alias(raw: &str) -> Option<Self> {
        let key = alias_key(raw);
        if key.is_empty() {
            return None;
        }

        let found = match key.as_str() {
            "pm25" | "pm2_5" | "pm2.5" | "pm2,5" | "particulate_matter_2_5" => Self::Pm25,
            "pm10" | "particulate_matter_10" => Self::Pm10,
            "no2" | "nitrogen_dioxide" | "nitrogendioxide"
            | "nitrogendioxide_tropospheric_column" | "vertical_column_troposphere" => Self::No2,
            "o3" | "ozone" | "ozone_total_column" | "column_amount_o3" => Self::O3,
            "so2" | "sulphur_dioxide" | "sulfur_dioxide" | "sulfurdioxide_total_column" => {
                Self::So2
            }
            "co" | "carbon_monoxide" => Self::Co,
            "hcho" | "formaldehyde" | "formaldehyde_tropospheric_column" => Self::Hcho,
            _ => {
                // Upstream variable paths such as "product/vertical_column_troposphere".
                let (_, tail) = key.rsplit_once('/')?;
                return Self::from_alias(tail);
            }
        };
        Some(found)
    }
}

/// Maps any upstream pollutant name to the canonical identifier. Unknown names
/// pass through unchanged apart from surrounding whitespace.
pub fn canonical_id(raw: &str) -> String {
    match Pollutant::from_alias(raw) {
        Some(pollutant) => pollutant.as_str().to_string(),
        None => raw.trim().to_string(),
    }
}

/// Name of a canonical identifier in an upstream vocabulary. Unknown canonical
/// identifiers are sent unchanged.
pub fn upstream_id(canonical: &str, vocabulary: Vocabulary) -> Option<String> {
    match Pollutant::from_alias(canonical) {
        Some(pollutant) => pollutant.upstream_name(vocabulary).map(str::to_string),
        None => Some(canonical.trim().to_string()),
    }
}

fn alias_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|ch| match ch {
            '₂' => '2',
            '₃' => '3',
            ' ' | '-' => '_',
            other => other,
        })
        .collect()
}
