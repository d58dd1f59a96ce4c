use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, EnumIter, EnumString};

/// The two persisted collections. Each one maps to its own JSON file and its
/// own debounce timer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CollectionKind {
    Persons,
    Tags,
}

impl CollectionKind {
    /// File name inside the data directory (e.g. "tags.json")
    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_ref())
    }

    /// Singular label used in messages
    pub fn label(&self) -> &'static str {
        match self {
            CollectionKind::Persons => "person",
            CollectionKind::Tags => "tag",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which collections a mutation changed, so only those get rewritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Touched {
    pub persons: bool,
    pub tags: bool,
}

impl Touched {
    pub const NONE: Touched = Touched {
        persons: false,
        tags: false,
    };
    pub const PERSONS: Touched = Touched {
        persons: true,
        tags: false,
    };
    pub const TAGS: Touched = Touched {
        persons: false,
        tags: true,
    };
    pub const BOTH: Touched = Touched {
        persons: true,
        tags: true,
    };

    pub fn any(self) -> bool {
        self.persons || self.tags
    }

    pub fn kinds(self) -> Vec<CollectionKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.persons {
            kinds.push(CollectionKind::Persons);
        }
        if self.tags {
            kinds.push(CollectionKind::Tags);
        }
        kinds
    }
}

impl std::ops::BitOr for Touched {
    type Output = Touched;

    fn bitor(self, rhs: Touched) -> Touched {
        Touched {
            persons: self.persons || rhs.persons,
            tags: self.tags || rhs.tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_file_names() {
        let names: Vec<String> = CollectionKind::iter().map(|k| k.file_name()).collect();
        assert_eq!(names, vec!["persons.json", "tags.json"]);
        assert_eq!("tags".parse::<CollectionKind>().unwrap(), CollectionKind::Tags);
        assert_eq!(CollectionKind::Persons.to_string(), "person");
    }

    #[test]
    fn test_touched_kinds() {
        assert!(Touched::NONE.kinds().is_empty());
        assert_eq!(
            (Touched::PERSONS | Touched::TAGS).kinds(),
            vec![CollectionKind::Persons, CollectionKind::Tags]
        );
    }
}
