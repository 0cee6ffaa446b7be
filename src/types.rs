use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// The three levels of the catalog hierarchy.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryRetrieveLevel {
	Study,
	Series,
	Image,
}

impl QueryRetrieveLevel {
	pub const ALL: [Self; 3] = [Self::Study, Self::Series, Self::Image];

	/// The level directly above this one, if any.
	pub const fn parent(self) -> Option<Self> {
		match self {
			Self::Study => None,
			Self::Series => Some(Self::Study),
			Self::Image => Some(Self::Series),
		}
	}
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Image => write!(f, "IMAGE"),
		}
	}
}
