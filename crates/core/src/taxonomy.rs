//! Game-side event vocabularies and their canonical wire strings.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Defines an enum together with its single variant-to-string table.
macro_rules! taxonomy {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const TABLE: &'static [($name, &'static str)] = &[$(($name::$variant, $text)),+];

            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::TABLE
                    .iter()
                    .find(|(_, text)| *text == s)
                    .map(|(v, _)| *v)
                    .ok_or_else(|| format!("unknown {}: {s:?}", stringify!($name)))
            }
        }
    };
}

taxonomy! {
    /// Lifecycle of a match.
    MatchEvent {
        Start => "match_start",
        Win => "match_win",
        Loss => "match_loss",
    }
}

impl MatchEvent {
    /// Progression status reported alongside the event.
    pub fn status(self) -> &'static str {
        match self {
            MatchEvent::Start => "start",
            MatchEvent::Win => "complete",
            MatchEvent::Loss => "fail",
        }
    }
}

taxonomy! {
    Resource {
        Cash => "cash",
        Iridium => "iridium",
        Research => "research",
        Population => "population",
        Favor => "favor",
    }
}

taxonomy! {
    /// How a resource changed hands.
    Acquisition {
        Found => "found",
        Sold => "sold",
        Gifted => "gifted",
        Subsidiary => "subsidiary",
        Stolen => "stolen",
    }
}

taxonomy! {
    /// What produced a resource.
    Source {
        BuildingGenerated => "building_generated",
        UnitGenerated => "unit_generated",
        NpcGenerated => "npc_generated",
    }
}

/// Direction of a resource change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Source,
    Sink,
}

impl Flow {
    pub fn of(amount: f64) -> Self {
        if amount > 0.0 { Flow::Source } else { Flow::Sink }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Flow::Source => "source",
            Flow::Sink => "sink",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn assert_table_complete<T: Copy + Eq + std::hash::Hash + fmt::Debug>(
        all: &[T],
        table: &[(T, &str)],
        as_str: fn(T) -> &'static str,
    ) {
        assert_eq!(all.len(), table.len());
        let variants: HashSet<T> = table.iter().map(|(v, _)| *v).collect();
        let strings: HashSet<&str> = table.iter().map(|(_, s)| *s).collect();
        assert_eq!(variants.len(), table.len(), "duplicate variant");
        assert_eq!(strings.len(), table.len(), "duplicate string");
        for (variant, text) in table {
            assert_eq!(as_str(*variant), *text);
            assert!(!text.contains(crate::record::KEY_DELIMITER));
        }
    }

    #[test]
    fn test_tables_complete_and_unique() {
        assert_table_complete(MatchEvent::ALL, MatchEvent::TABLE, MatchEvent::as_str);
        assert_table_complete(Resource::ALL, Resource::TABLE, Resource::as_str);
        assert_table_complete(Acquisition::ALL, Acquisition::TABLE, Acquisition::as_str);
        assert_table_complete(Source::ALL, Source::TABLE, Source::as_str);
    }

    #[test]
    fn test_parse() {
        assert_eq!("match_win".parse::<MatchEvent>(), Ok(MatchEvent::Win));
        assert_eq!("npc_generated".parse::<Source>(), Ok(Source::NpcGenerated));
        assert!("gold".parse::<Resource>().is_err());
    }

    #[test]
    fn test_match_status() {
        assert_eq!(MatchEvent::Start.status(), "start");
        assert_eq!(MatchEvent::Win.status(), "complete");
        assert_eq!(MatchEvent::Loss.status(), "fail");
    }

    #[test]
    fn test_flow_direction() {
        assert_eq!(Flow::of(150.0), Flow::Source);
        assert_eq!(Flow::of(-3.0), Flow::Sink);
    }
}
