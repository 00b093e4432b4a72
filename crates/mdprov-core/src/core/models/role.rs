use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The intent of a protocol stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    Minimization,
    Heating,
    Equilibration,
    Production,
    #[default]
    Unknown,
}

impl StageRole {
    /// Infers a role from a stage or file name by keyword matching.
    ///
    /// Both path components and the final name are examined, so
    /// `equil/step3.in` and `03_npt.in` resolve the same way.
    pub fn from_name(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase().replace('\\', "/");
        for part in lowered.split('/') {
            if part.starts_with("min") || part.contains("_min") || part == "em" {
                return Some(StageRole::Minimization);
            }
            if part.contains("heat") || part.contains("warm") {
                return Some(StageRole::Heating);
            }
            if part.starts_with("equil")
                || part.contains("_equil")
                || part.contains("nvt")
                || part.contains("npt")
            {
                return Some(StageRole::Equilibration);
            }
            if part.starts_with("prod") || part.contains("_prod") {
                return Some(StageRole::Production);
            }
        }
        None
    }
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageRole::Minimization => "minimization",
            StageRole::Heating => "heating",
            StageRole::Equilibration => "equilibration",
            StageRole::Production => "production",
            StageRole::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl FromStr for StageRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimization" | "min" => Ok(StageRole::Minimization),
            "heating" | "heat" => Ok(StageRole::Heating),
            "equilibration" | "equil" => Ok(StageRole::Equilibration),
            "production" | "prod" => Ok(StageRole::Production),
            "unknown" => Ok(StageRole::Unknown),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_roles_from_common_names() {
        assert_eq!(StageRole::from_name("min1"), Some(StageRole::Minimization));
        assert_eq!(StageRole::from_name("02_heat"), Some(StageRole::Heating));
        assert_eq!(
            StageRole::from_name("equil/step3"),
            Some(StageRole::Equilibration)
        );
        assert_eq!(
            StageRole::from_name("npt_restrained"),
            Some(StageRole::Equilibration)
        );
        assert_eq!(
            StageRole::from_name("prod_001"),
            Some(StageRole::Production)
        );
    }

    #[test]
    fn unrelated_names_stay_uninferred() {
        assert_eq!(StageRole::from_name("system"), None);
        assert_eq!(StageRole::from_name("run42"), None);
    }

    #[test]
    fn parses_short_aliases() {
        assert_eq!("prod".parse(), Ok(StageRole::Production));
        assert_eq!("Equil".parse(), Ok(StageRole::Equilibration));
        assert!("banana".parse::<StageRole>().is_err());
    }
}
