#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
    /// One model replica per listed accelerator.
    Ordinals(Vec<usize>),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl DeviceMap {
    /// Accelerator ordinals requested by this map; empty for CPU.
    pub fn ordinals(&self) -> Vec<usize> {
        match self {
            Self::ForceCpu => Vec::new(),
            Self::Ordinal(ordinal) => vec![*ordinal],
            Self::Ordinals(ordinals) => ordinals.clone(),
        }
    }
}

impl std::str::FromStr for DeviceMap {
    type Err = std::num::ParseIntError;

    /// Parses `cpu` or a comma separated list of ordinals such as `0,1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(Self::ForceCpu);
        }
        let ordinals = s
            .split(',')
            .map(|part| part.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(match ordinals.as_slice() {
            [ordinal] => Self::Ordinal(*ordinal),
            _ => Self::Ordinals(ordinals),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_lists() {
        assert_eq!("cpu".parse::<DeviceMap>().unwrap(), DeviceMap::ForceCpu);
        assert_eq!("1".parse::<DeviceMap>().unwrap(), DeviceMap::Ordinal(1));
        assert_eq!(
            "0, 1,3".parse::<DeviceMap>().unwrap(),
            DeviceMap::Ordinals(vec![0, 1, 3])
        );
        assert!("gpu".parse::<DeviceMap>().is_err());
    }

    #[test]
    fn ordinals_of_each_map() {
        assert!(DeviceMap::ForceCpu.ordinals().is_empty());
        assert_eq!(DeviceMap::default().ordinals(), vec![0]);
        assert_eq!(DeviceMap::Ordinals(vec![2, 3]).ordinals(), vec![2, 3]);
    }
}
