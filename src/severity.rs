// SPDX-License-Identifier: Apache-2.0 OR MIT
// Severity points, totally ordered by integer rank

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

/// A severity point on the totally ordered scale.
///
/// The named points are spaced ten ranks apart so configuration can
/// insert additional named points between them. Ordering is always by
/// integer rank.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Severity(u8);

/// Named severity points registered by configuration.
static CUSTOM: RwLock<Vec<(String, u8)>> = RwLock::new(Vec::new());

const NAMED: [(&str, u8); 7] = [
    ("TRACE", 0),
    ("DEBUG", 10),
    ("INFO", 20),
    ("NOTICE", 30),
    ("WARNING", 40),
    ("ERROR", 50),
    ("CRITICAL", 60),
];

/// Errors from registering a configuration-defined severity point.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeverityError {
    #[error("severity name '{0}' is already registered with rank {1}")]
    NameTaken(String, u8),

    #[error("severity rank {0} is already named '{1}'")]
    RankTaken(u8, String),
}

impl Severity {
    pub const TRACE: Severity = Severity(0);
    pub const DEBUG: Severity = Severity(10);
    pub const INFO: Severity = Severity(20);
    pub const NOTICE: Severity = Severity(30);
    pub const WARNING: Severity = Severity(40);
    pub const ERROR: Severity = Severity(50);
    pub const CRITICAL: Severity = Severity(60);

    /// Integer rank of this point.
    #[inline]
    pub const fn rank(self) -> u8 {
        self.0
    }

    /// Reconstruct a severity from its rank (e.g. from a decoded frame).
    #[inline]
    pub const fn from_rank(rank: u8) -> Severity {
        Severity(rank)
    }

    /// Name of a built-in point, if this is one.
    pub fn builtin_name(self) -> Option<&'static str> {
        NAMED
            .iter()
            .find(|(_, rank)| *rank == self.0)
            .map(|(name, _)| *name)
    }

    /// Resolve a name, case-insensitively, against the built-in points
    /// and any configuration-registered points.
    pub fn from_name(name: &str) -> Option<Severity> {
        for (candidate, rank) in NAMED {
            if candidate.eq_ignore_ascii_case(name) {
                return Some(Severity(rank));
            }
        }
        let custom = CUSTOM.read().unwrap_or_else(|e| e.into_inner());
        custom
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, rank)| Severity(*rank))
    }

    /// Register an additional named point. Names and ranks must both be
    /// unused; re-registering an identical (name, rank) pair is a no-op.
    pub fn register(name: &str, rank: u8) -> Result<Severity, SeverityError> {
        for (candidate, taken) in NAMED {
            if candidate.eq_ignore_ascii_case(name) {
                if taken == rank {
                    return Ok(Severity(rank));
                }
                return Err(SeverityError::NameTaken(candidate.to_string(), taken));
            }
            if taken == rank {
                return Err(SeverityError::RankTaken(rank, candidate.to_string()));
            }
        }
        let mut custom = CUSTOM.write().unwrap_or_else(|e| e.into_inner());
        for (candidate, taken) in custom.iter() {
            if candidate.eq_ignore_ascii_case(name) {
                if *taken == rank {
                    return Ok(Severity(rank));
                }
                return Err(SeverityError::NameTaken(candidate.clone(), *taken));
            }
            if *taken == rank {
                return Err(SeverityError::RankTaken(rank, candidate.clone()));
            }
        }
        custom.push((name.to_ascii_uppercase(), rank));
        Ok(Severity(rank))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.builtin_name() {
            return f.write_str(name);
        }
        let custom = CUSTOM.read().unwrap_or_else(|e| e.into_inner());
        if let Some((name, _)) = custom.iter().find(|(_, rank)| *rank == self.0) {
            return f.write_str(name);
        }
        write!(f, "SEVERITY({})", self.0)
    }
}

impl fmt::Debug for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = Severity;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a severity name or integer rank")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Severity, E> {
                Severity::from_name(value)
                    .ok_or_else(|| E::custom(format!("unknown severity '{}'", value)))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Severity, E> {
                u8::try_from(value)
                    .map(Severity)
                    .map_err(|_| E::custom(format!("severity rank {} out of range", value)))
            }

            // json5 surfaces every number as a float.
            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Severity, E> {
                if value.fract() == 0.0 && (0.0..=255.0).contains(&value) {
                    Ok(Severity(value as u8))
                } else {
                    Err(E::custom(format!("severity rank {} out of range", value)))
                }
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::TRACE < Severity::DEBUG);
        assert!(Severity::DEBUG < Severity::INFO);
        assert!(Severity::INFO < Severity::NOTICE);
        assert!(Severity::NOTICE < Severity::WARNING);
        assert!(Severity::WARNING < Severity::ERROR);
        assert!(Severity::ERROR < Severity::CRITICAL);
    }

    #[test]
    fn test_severity_from_name() {
        assert_eq!(Severity::from_name("WARNING"), Some(Severity::WARNING));
        assert_eq!(Severity::from_name("warning"), Some(Severity::WARNING));
        assert_eq!(Severity::from_name("bogus"), None);
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(format!("{}", Severity::INFO), "INFO");
        assert_eq!(format!("{}", Severity::from_rank(7)), "SEVERITY(7)");
    }

    #[test]
    fn test_severity_roundtrip_rank() {
        let severity = Severity::ERROR;
        assert_eq!(Severity::from_rank(severity.rank()), severity);
    }

    #[test]
    fn test_register_custom_point() {
        let verbose = Severity::register("VERBOSE2", 5).unwrap();
        assert!(Severity::TRACE < verbose && verbose < Severity::DEBUG);
        assert_eq!(Severity::from_name("verbose2"), Some(verbose));
        assert_eq!(format!("{}", verbose), "VERBOSE2");

        // Identical re-registration is fine, conflicts are not.
        assert!(Severity::register("VERBOSE2", 5).is_ok());
        assert!(matches!(
            Severity::register("VERBOSE2", 6),
            Err(SeverityError::NameTaken(_, 5))
        ));
        assert!(matches!(
            Severity::register("OTHER2", 5),
            Err(SeverityError::RankTaken(5, _))
        ));
        assert!(matches!(
            Severity::register("INFO", 33),
            Err(SeverityError::NameTaken(_, 20))
        ));
    }

    #[test]
    fn test_severity_serde() {
        let json = serde_json::to_string(&Severity::NOTICE).unwrap();
        assert_eq!(json, "\"NOTICE\"");
        let back: Severity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Severity::NOTICE);
        let by_rank: Severity = serde_json::from_str("40").unwrap();
        assert_eq!(by_rank, Severity::WARNING);
    }
}
