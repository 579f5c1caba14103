use std::fmt;
use std::str::FromStr;

/// Backend tables known to Recast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Processes,
    Steps,
    StepProperties,
    Elements,
    ElementProperties,
    Profiles,
    Bundles,
    Upload,
    Devices,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Self::Processes,
        Self::Steps,
        Self::StepProperties,
        Self::Elements,
        Self::ElementProperties,
        Self::Profiles,
        Self::Bundles,
        Self::Upload,
        Self::Devices,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processes => "Processes",
            Self::Steps => "Steps",
            Self::StepProperties => "StepProperties",
            Self::Elements => "Elements",
            Self::ElementProperties => "ElementProperties",
            Self::Profiles => "profiles",
            Self::Bundles => "Bundles",
            Self::Upload => "upload",
            Self::Devices => "devices",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown table: {}", s))
    }
}
